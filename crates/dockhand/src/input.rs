use dialoguer::{Input, Password};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::params::{DEFAULT_APP_PORT, DEFAULT_BRANCH, DEFAULT_SSH_KEY, RawInputs, RunParameters};

pub const TOKEN_ENV: &str = "DOCKHAND_TOKEN";

/// Where answers come from when a value was not preset.
pub trait Prompter: Send + Sync {
    /// Ask for a visible value. Returning an empty string means "use the default".
    fn text(&self, label: &str, default: Option<&str>) -> Result<String>;
    /// Ask for a value without echoing it.
    fn secret(&self, label: &str) -> Result<String>;
}

/// Interactive prompts on the controlling terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn text(&self, label: &str, default: Option<&str>) -> Result<String> {
        let mut input = Input::<String>::new().with_prompt(label).allow_empty(true);
        if let Some(d) = default {
            input = input.default(d.to_string()).show_default(true);
        }
        input
            .interact_text()
            .map_err(|e| Error::input(format!("failed to read {label}: {e}")))
    }

    fn secret(&self, label: &str) -> Result<String> {
        Password::new()
            .with_prompt(label)
            .allow_empty_password(true)
            .interact()
            .map_err(|e| Error::input(format!("failed to read {label}: {e}")))
    }
}

/// `--no-input`: every prompt is answered with a blank.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInputPrompter;

impl Prompter for NoInputPrompter {
    fn text(&self, _label: &str, _default: Option<&str>) -> Result<String> {
        Ok(String::new())
    }

    fn secret(&self, _label: &str) -> Result<String> {
        Ok(String::new())
    }
}

/// `[target]` in the deploy file; CLI flags are merged into the same table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetConfig {
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub ssh_user: Option<String>,
    pub ssh_host: Option<String>,
    pub ssh_key: Option<String>,
    pub app_port: Option<toml::Value>,
}

fn preset(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
}

fn port_preset(v: &Option<toml::Value>) -> Option<String> {
    match v {
        Some(toml::Value::Integer(i)) => Some(i.to_string()),
        Some(toml::Value::String(s)) => preset(&Some(s.clone())),
        Some(other) => Some(other.to_string()),
        None => None,
    }
}

fn ask(
    prompter: &dyn Prompter,
    preset_value: Option<String>,
    label: &str,
    default: Option<&str>,
) -> Result<String> {
    match preset_value {
        Some(v) => Ok(v),
        None => prompter.text(label, default),
    }
}

/// Gather the seven run parameters in prompt order: repository URL, access
/// token, branch, SSH user, SSH host, SSH key path, application port.
/// Preset values skip their prompt; the token is only ever taken from
/// `env_token` or a masked prompt.
pub fn collect(
    target: &TargetConfig,
    env_token: Option<String>,
    prompter: &dyn Prompter,
) -> Result<RunParameters> {
    let repo_url = ask(prompter, preset(&target.repo_url), "Repository URL", None)?;
    let token = match env_token.filter(|t| !t.trim().is_empty()) {
        Some(t) => t,
        None => prompter.secret("Access token")?,
    };
    let branch = ask(prompter, preset(&target.branch), "Branch", Some(DEFAULT_BRANCH))?;
    let ssh_user = ask(prompter, preset(&target.ssh_user), "SSH user", None)?;
    let ssh_host = ask(prompter, preset(&target.ssh_host), "SSH host", None)?;
    let ssh_key = ask(
        prompter,
        preset(&target.ssh_key),
        "SSH key path",
        Some(DEFAULT_SSH_KEY),
    )?;
    let default_port = DEFAULT_APP_PORT.to_string();
    let app_port = ask(
        prompter,
        port_preset(&target.app_port),
        "Application port",
        Some(default_port.as_str()),
    )?;

    RawInputs {
        repo_url,
        token,
        branch,
        ssh_user,
        ssh_host,
        ssh_key,
        app_port,
    }
    .resolve()
}
