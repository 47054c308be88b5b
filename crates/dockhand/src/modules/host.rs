use serde::Deserialize;

use dockhand_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::modules::util::{self, default_true};
use crate::remote::{self, RemoteScript, RemoteStep, shell_quote};
use crate::{Error, Result};

pub const DEFAULT_PACKAGES: [&str; 4] = ["ca-certificates", "curl", "rsync", "nginx"];

#[Task(
    id = "host.probe",
    module = "host",
    phase = "probe",
    provides = ["host:reachable"],
    after = ["repo.verify"],
    failure = Transport,
    default_label = "Probe SSH connectivity"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    pub connect_timeout_secs: u64,
}

impl Default for ProbeTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            connect_timeout_secs: 10,
        }
    }
}

impl ProbeTask {
    pub fn run(cfg: &Self, _doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let (_, target) = util::ssh_target(ctx)?;
        let timeout = cfg.connect_timeout_secs.max(1);
        ctx.log(&format!(
            "checking SSH access to {} (timeout {timeout}s)",
            target.destination()
        ));
        let out = ctx.run(&target.command("echo ok", Some(timeout)))?;
        if !out.success() {
            return Err(Error::transport(format!(
                "cannot open an SSH session to {} ({}); check network and credentials",
                target.destination(),
                out.status_text()
            )));
        }
        ctx.log("SSH connection ok");
        Ok(())
    }
}

#[Task(
    id = "host.provision",
    module = "host",
    phase = "provision",
    provides = ["host:provisioned"],
    after = ["host.probe"],
    failure = Provisioning,
    default_label = "Provision host"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvisionTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    /// Baseline apt packages installed on every run.
    pub packages: Vec<String>,
    pub docker_install_url: String,
}

impl Default for ProvisionTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            packages: DEFAULT_PACKAGES.iter().map(|s| s.to_string()).collect(),
            docker_install_url: "https://get.docker.com".into(),
        }
    }
}

impl ProvisionTask {
    pub fn run(cfg: &Self, _doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let (_, target) = util::ssh_target(ctx)?;
        let script = provision_script(cfg)?;
        remote::run_script(ctx, &target, &script)?;
        ctx.log("host provisioned");
        Ok(())
    }
}

pub fn provision_script(cfg: &ProvisionTask) -> Result<RemoteScript> {
    let packages: Vec<String> = cfg
        .packages
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(shell_quote)
        .collect();
    if packages.is_empty() {
        return Err(Error::msg("[host.steps.provision].packages is empty"));
    }

    Ok(RemoteScript::new("provision")
        .step(RemoteStep::required(
            "refresh package index",
            "sudo apt-get update -y",
        ))
        .step(RemoteStep::required(
            "install base packages",
            format!("sudo apt-get install -y {}", packages.join(" ")),
        ))
        .step(RemoteStep::unless(
            "install docker",
            "command -v docker",
            format!(
                "curl -fsSL {} | sudo sh",
                shell_quote(cfg.docker_install_url.trim())
            ),
        ))
        .step(RemoteStep::unless(
            "install compose plugin",
            "docker compose version || command -v docker-compose",
            "sudo apt-get install -y docker-compose-plugin",
        ))
        .step(RemoteStep::required(
            "add user to docker group",
            "sudo usermod -aG docker \"$USER\"",
        ))
        .step(RemoteStep::required(
            "enable docker",
            "sudo systemctl enable --now docker",
        ))
        .step(RemoteStep::required(
            "enable nginx",
            "sudo systemctl enable --now nginx",
        )))
}

#[Module(id = "host", tasks = [ProbeTask, ProvisionTask])]
pub struct HostModule;
