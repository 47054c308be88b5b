use serde::Deserialize;

use dockhand_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::input::{self, TOKEN_ENV, TargetConfig};
use crate::modules::util::default_true;
use crate::{Error, Result};

/// Tables a deploy file may contain; anything else is a typo.
const KNOWN_TABLES: [&str; 8] = [
    "target",
    "core",
    "repo",
    "host",
    "sync",
    "container",
    "proxy",
    "validate",
];

#[Task(
    id = "core.collect",
    module = "core",
    phase = "collect",
    provides = ["params"],
    after = [],
    failure = Input,
    default_label = "Collect run parameters"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    /// Environment variable holding the access token.
    pub token_env: String,
}

impl Default for CollectTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            token_env: TOKEN_ENV.into(),
        }
    }
}

impl CollectTask {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let target: TargetConfig = doc.deserialize_path("target")?.unwrap_or_default();
        let env_token = std::env::var(cfg.token_env.trim()).ok();
        if env_token.as_deref().is_some_and(|t| !t.trim().is_empty()) {
            ctx.log(&format!("access token taken from ${}", cfg.token_env.trim()));
        }

        let params = input::collect(&target, env_token, ctx.prompter())?;
        ctx.register_secret(params.token.expose());
        if let Some(auth) = params.authenticated_url()? {
            ctx.register_secret(&auth.userinfo);
        }

        ctx.log(&format!("repository: {}", params.repo_url));
        ctx.log(&format!("branch: {}", params.branch));
        ctx.log(&format!("target: {}", params.ssh_destination()));
        ctx.log(&format!("ssh key: {}", params.ssh_key.display()));
        ctx.log(&format!("application port: {}", params.app_port));
        ctx.set_params(params)
    }
}

#[Module(id = "core", tasks = [CollectTask])]
pub struct CoreModule;

/// Reject unknown top-level tables before anything runs.
pub fn check_tables(doc: &ConfigDoc) -> Result<()> {
    let Some(table) = doc.value.as_table() else {
        return Ok(());
    };
    for key in table.keys() {
        if !KNOWN_TABLES.contains(&key.as_str()) {
            return Err(Error::input(format!(
                "config table '{key}' is not supported; use target, core, repo, host, sync, container, proxy and validate"
            )));
        }
    }
    Ok(())
}
