use serde::Deserialize;

use dockhand_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::error::ErrorKind;
use crate::executor::ExecCtx;
use crate::modules::sync::remote_project_dir;
use crate::modules::util::{self, default_true};
use crate::params::Descriptor;
use crate::remote::{self, RemoteScript, RemoteStep, shell_quote};
use crate::Result;

// Set by the script itself; `docker compose` when the plugin works, else the standalone binary.
pub(crate) const PICK_COMPOSE: &str = "if docker compose version >/dev/null 2>&1; then COMPOSE=\"docker compose\"; else COMPOSE=\"docker-compose\"; fi";

#[Task(
    id = "container.deploy",
    module = "container",
    phase = "deploy",
    provides = ["remote:container"],
    after = ["remote:files", "descriptor"],
    failure = Deployment,
    default_label = "Deploy container"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeployTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    /// Seconds to wait before checking that the container stayed up.
    pub settle_secs: u64,
    /// Log lines shown when the container is not running.
    pub log_tail: u32,
}

impl Default for DeployTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            settle_secs: 10,
            log_tail: 50,
        }
    }
}

impl DeployTask {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let (params, target) = util::ssh_target(ctx)?;
        let descriptor = ctx.descriptor()?;
        let plan = DeployPlan {
            remote_dir: remote_project_dir(doc, &params)?,
            name: params.container_name()?,
            port: params.app_port,
            descriptor,
        };
        ctx.log(&format!(
            "deploying {} from {} ({})",
            plan.name,
            plan.remote_dir,
            plan.descriptor.describe()
        ));
        if let Err(e) = remote::run_script(ctx, &target, &deploy_script(cfg, &plan)) {
            if e.kind() != ErrorKind::Transport {
                ctx.error(&format!(
                    "container {} did not come up; its last {} log lines are above",
                    plan.name, cfg.log_tail
                ));
            }
            return Err(e);
        }
        ctx.log(&format!("container {} is running", plan.name));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DeployPlan {
    pub remote_dir: String,
    pub name: String,
    pub port: u16,
    pub descriptor: Descriptor,
}

pub fn deploy_script(cfg: &DeployTask, plan: &DeployPlan) -> RemoteScript {
    let name = shell_quote(&plan.name);
    let port = plan.port;

    let mut script = RemoteScript::new("deploy")
        .step(RemoteStep::required(
            "enter project directory",
            format!("cd {}", shell_quote(&plan.remote_dir)),
        ))
        .step(RemoteStep::best_effort(
            "stop previous container",
            format!("docker stop {name}"),
        ))
        .step(RemoteStep::best_effort(
            "remove previous container",
            format!("docker rm {name}"),
        ));

    let logs_cmd = match &plan.descriptor {
        Descriptor::Compose { file } => {
            let file = shell_quote(file);
            script = script
                .step(RemoteStep::required("select compose command", PICK_COMPOSE))
                .step(RemoteStep::best_effort(
                    "stop previous stack",
                    format!("$COMPOSE -f {file} -p {name} down"),
                ))
                .step(RemoteStep::required(
                    "build and start stack",
                    format!("$COMPOSE -f {file} -p {name} up -d --build"),
                ));
            format!("$COMPOSE -f {file} -p {name} logs --tail {}", cfg.log_tail)
        }
        Descriptor::Dockerfile => {
            script = script
                .step(RemoteStep::required(
                    "build image",
                    format!("docker build -t {name} ."),
                ))
                .step(RemoteStep::required(
                    "start container",
                    format!(
                        "docker run -d --name {name} --restart unless-stopped -p {port}:{port} {name}"
                    ),
                ));
            format!("docker logs --tail {} {name}", cfg.log_tail)
        }
    };

    script
        .step(RemoteStep::required(
            "wait for container to settle",
            format!("sleep {}", cfg.settle_secs),
        ))
        .step(RemoteStep::required(
            "check container is running",
            format!(
                "if [ -z \"$(docker ps -q --filter name={name})\" ]; then\n  echo \"container {} is not running; last {} log lines:\"\n  {logs_cmd} 2>&1 || true\n  exit 1\nfi\ndocker ps --filter name={name}",
                plan.name, cfg.log_tail
            ),
        ))
}

#[Module(id = "container", tasks = [DeployTask])]
pub struct ContainerModule;
