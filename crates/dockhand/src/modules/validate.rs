use std::time::Duration;

use serde::Deserialize;

use dockhand_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::modules::container::PICK_COMPOSE;
use crate::modules::proxy::ConfigureTask;
use crate::modules::sync::remote_project_dir;
use crate::modules::util::{self, default_true, non_blank};
use crate::params::Descriptor;
use crate::remote::{self, RemoteScript, RemoteStep, shell_quote};
use crate::Result;

#[Task(
    id = "validate.reachability",
    module = "validate",
    phase = "validate",
    provides = ["deployment:validated"],
    after = ["remote:proxy"],
    failure = Deployment,
    default_label = "Validate deployment"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReachabilityTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    pub log_tail: u32,
    /// Per-request limit for the curl checks on the host.
    pub curl_timeout_secs: u64,
    pub external_timeout_secs: u64,
    /// Defaults to `http://<ssh host>/`.
    pub external_url: Option<String>,
}

impl Default for ReachabilityTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            log_tail: 20,
            curl_timeout_secs: 10,
            external_timeout_secs: 10,
            external_url: None,
        }
    }
}

/// Outcome of the check run from the operator's machine. Never fails the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalCheck {
    Reachable(u16),
    BadStatus(u16),
    Unreachable(String),
}

impl ReachabilityTask {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let (params, target) = util::ssh_target(ctx)?;
        let proxy: ConfigureTask = doc
            .deserialize_path(ConfigureTask::CONFIG_PATH)?
            .unwrap_or_default();
        let name = params.container_name()?;
        let descriptor = ctx.descriptor()?;
        let remote_dir = remote_project_dir(doc, &params)?;

        let script = validate_script(
            cfg,
            &remote_dir,
            &name,
            &descriptor,
            params.app_port,
            proxy.listen_port,
        );
        remote::run_script(ctx, &target, &script)?;

        let url = external_url(cfg, &params.ssh_host, proxy.listen_port);
        match check_external(&url, cfg.external_timeout_secs) {
            ExternalCheck::Reachable(code) => {
                ctx.log(&format!("{url} answered with HTTP {code}"))
            }
            ExternalCheck::BadStatus(code) => ctx.warn(&format!(
                "{url} answered with HTTP {code}; check firewall rules and the application"
            )),
            ExternalCheck::Unreachable(why) => ctx.warn(&format!(
                "{url} is not reachable from here ({why}); the host may block port {}",
                proxy.listen_port
            )),
        }

        ctx.log("deployment summary:");
        ctx.log(&format!("  url:              {url}"));
        ctx.log(&format!("  project:          {}", params.project_dir_name()?));
        ctx.log(&format!(
            "  remote directory: {}:{remote_dir}",
            target.destination()
        ));
        ctx.log(&format!("  container:        {name}"));
        ctx.log(&format!("  build descriptor: {}", descriptor.describe()));
        Ok(())
    }
}

pub fn external_url(cfg: &ReachabilityTask, host: &str, listen_port: u16) -> String {
    if let Some(url) = non_blank(cfg.external_url.as_deref()) {
        return url;
    }
    if listen_port == 80 {
        format!("http://{host}/")
    } else {
        format!("http://{host}:{listen_port}/")
    }
}

pub fn validate_script(
    cfg: &ReachabilityTask,
    remote_dir: &str,
    name: &str,
    descriptor: &Descriptor,
    app_port: u16,
    listen_port: u16,
) -> RemoteScript {
    let curl = |port: u16| {
        format!(
            "curl -sS -o /dev/null -w 'HTTP %{{http_code}}\\n' --max-time {} http://127.0.0.1:{port}/",
            cfg.curl_timeout_secs.max(1)
        )
    };
    let quoted = shell_quote(name);
    let logs = match descriptor {
        Descriptor::Compose { file } => format!(
            "{PICK_COMPOSE}\n$COMPOSE -f {} -p {quoted} logs --tail {}",
            shell_quote(file),
            cfg.log_tail
        ),
        Descriptor::Dockerfile => format!("docker logs --tail {} {quoted}", cfg.log_tail),
    };

    RemoteScript::new("validate")
        .step(RemoteStep::required(
            "enter project directory",
            format!("cd {}", shell_quote(remote_dir)),
        ))
        .step(RemoteStep::required(
            format!("application answers on port {app_port}"),
            curl(app_port),
        ))
        .step(RemoteStep::required(
            format!("nginx answers on port {listen_port}"),
            curl(listen_port),
        ))
        .step(RemoteStep::best_effort("recent container logs", logs))
}

pub fn check_external(url: &str, timeout_secs: u64) -> ExternalCheck {
    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
    {
        Ok(c) => c,
        Err(e) => return ExternalCheck::Unreachable(format!("failed to build HTTP client: {e}")),
    };
    match client.get(url).send() {
        Ok(res) => {
            let status = res.status();
            if status.is_success() || status.is_redirection() {
                ExternalCheck::Reachable(status.as_u16())
            } else {
                ExternalCheck::BadStatus(status.as_u16())
            }
        }
        Err(e) => ExternalCheck::Unreachable(e.to_string()),
    }
}

#[Module(id = "validate", tasks = [ReachabilityTask])]
pub struct ValidateModule;
