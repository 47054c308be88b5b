//! SSH plumbing: how a remote session is opened and how a logical remote
//! procedure is turned into one fail-fast shell script.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::executor::runner::{CmdOutput, CmdSpec};
use crate::params::RunParameters;

// ssh reserves 255 for its own failures (connect, auth, host key).
const SSH_FAILURE_CODE: i32 = 255;

pub fn shell_quote(raw: &str) -> String {
    if !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c))
    {
        return raw.to_string();
    }
    format!("'{}'", raw.replace('\'', "'\\''"))
}

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub key: PathBuf,
}

impl SshTarget {
    pub fn from_params(p: &RunParameters) -> Self {
        Self {
            user: p.ssh_user.clone(),
            host: p.ssh_host.clone(),
            key: p.ssh_key.clone(),
        }
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn options(&self, connect_timeout: Option<u64>) -> Vec<String> {
        let mut out = vec![
            "-i".to_string(),
            self.key.display().to_string(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=accept-new".into(),
        ];
        if let Some(secs) = connect_timeout {
            out.push("-o".into());
            out.push(format!("ConnectTimeout={secs}"));
        }
        out
    }

    /// One remote command in its own session.
    pub fn command(&self, remote_cmd: &str, connect_timeout: Option<u64>) -> CmdSpec {
        CmdSpec::new("ssh")
            .args(self.options(connect_timeout))
            .arg(self.destination())
            .arg(remote_cmd)
    }

    /// One session that runs `script` through `bash -s`.
    pub fn script(&self, script: &RemoteScript) -> CmdSpec {
        CmdSpec::new("ssh")
            .args(self.options(None))
            .arg(self.destination())
            .arg("bash -s")
            .stdin(script.render())
    }

    /// The `-e` argument rsync uses to reach the host.
    pub fn rsync_shell(&self) -> String {
        let mut parts = vec!["ssh".to_string()];
        parts.extend(self.options(None).iter().map(|s| shell_quote(s)));
        parts.join(" ")
    }

    /// Mirror the contents of `local` into `remote_dir`. Never deletes on the remote side.
    pub fn rsync(&self, local: &Path, remote_dir: &str, excludes: &[String]) -> CmdSpec {
        let mut spec = CmdSpec::new("rsync").arg("-az");
        for ex in excludes {
            spec = spec.arg("--exclude").arg(ex.clone());
        }
        spec.arg("-e")
            .arg(self.rsync_shell())
            .arg(format!("{}/", local.display()))
            .arg(format!(
                "{}:{}/",
                self.destination(),
                remote_dir.trim_end_matches('/')
            ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepMode {
    /// Failure aborts the rest of the session.
    Required,
    /// Failure is reported and ignored.
    BestEffort,
    /// Runs only when the probe command fails.
    Unless(String),
}

#[derive(Debug, Clone)]
pub struct RemoteStep {
    pub label: String,
    pub command: String,
    pub mode: StepMode,
}

impl RemoteStep {
    pub fn required(label: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            command: command.into(),
            mode: StepMode::Required,
        }
    }

    pub fn best_effort(label: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            command: command.into(),
            mode: StepMode::BestEffort,
        }
    }

    pub fn unless(
        label: impl Into<String>,
        probe: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            command: command.into(),
            mode: StepMode::Unless(probe.into()),
        }
    }
}

/// An ordered list of remote commands executed in a single SSH session.
#[derive(Debug, Clone, Default)]
pub struct RemoteScript {
    pub name: String,
    steps: Vec<RemoteStep>,
}

impl RemoteScript {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: RemoteStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(&self) -> &[RemoteStep] {
        &self.steps
    }

    pub fn render(&self) -> String {
        let total = self.steps.len();
        let mut out = String::from("set -euo pipefail\nexport DEBIAN_FRONTEND=noninteractive\n");
        for (i, step) in self.steps.iter().enumerate() {
            let head = shell_quote(&format!("==> [{}/{}] {}", i + 1, total, step.label));
            let ok = shell_quote(&format!("==> ok: {}", step.label));
            out.push_str(&format!("echo {head}\n"));
            match &step.mode {
                StepMode::Required => {
                    out.push_str(&step.command);
                    out.push('\n');
                    out.push_str(&format!("echo {ok}\n"));
                }
                StepMode::BestEffort => {
                    let ignored = shell_quote(&format!("==> ignored failure: {}", step.label));
                    out.push_str(&format!(
                        "if {{ {}\n}}; then echo {ok}; else echo {ignored}; fi\n",
                        step.command
                    ));
                }
                StepMode::Unless(probe) => {
                    let skip = shell_quote(&format!("==> skip: {} (already present)", step.label));
                    out.push_str(&format!(
                        "if {{ {probe}; }} >/dev/null 2>&1; then\n  echo {skip}\nelse\n{}\n  echo {ok}\nfi\n",
                        step.command
                    ));
                }
            }
        }
        out
    }
}

/// Run a script on the host. An ssh-level failure is a transport error no
/// matter which stage asked; any other non-zero exit carries the stage's class.
pub fn run_script(ctx: &ExecCtx, target: &SshTarget, script: &RemoteScript) -> Result<CmdOutput> {
    ctx.log(&format!(
        "remote session '{}' on {} ({} steps)",
        script.name,
        target.destination(),
        script.steps().len()
    ));
    let out = ctx.run(&target.script(script))?;
    check_remote(&out, &script.name, target)?;
    Ok(out)
}

pub fn check_remote(out: &CmdOutput, what: &str, target: &SshTarget) -> Result<()> {
    match out.code {
        Some(0) => Ok(()),
        Some(SSH_FAILURE_CODE) => Err(Error::transport(format!(
            "ssh session '{what}' to {} failed; check network and credentials",
            target.destination()
        ))),
        _ => Err(Error::msg(format!(
            "remote session '{what}' failed ({})",
            out.status_text()
        ))),
    }
}

/// Runs a rendered script with local bash; `prelude` defines stub commands.
#[cfg(all(test, unix))]
pub(crate) fn run_locally(prelude: &str, script: &RemoteScript) -> (Option<i32>, String) {
    let out = std::process::Command::new("bash")
        .arg("-c")
        .arg(format!("{prelude}\n{}", script.render()))
        .output()
        .expect("spawn bash");
    (
        out.status.code(),
        String::from_utf8_lossy(&out.stdout).into_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SshTarget {
        SshTarget {
            user: "deploy".into(),
            host: "203.0.113.10".into(),
            key: PathBuf::from("/home/op/.ssh/id rsa"),
        }
    }

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(shell_quote("web-app"), "web-app");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn script_runs_fail_fast_with_markers() {
        let script = RemoteScript::new("demo")
            .step(RemoteStep::required("update", "sudo apt-get update"))
            .step(RemoteStep::best_effort("stop old", "docker stop app"))
            .step(RemoteStep::unless(
                "install docker",
                "command -v docker",
                "curl -fsSL https://get.docker.com | sudo sh",
            ));
        let text = script.render();
        assert!(text.starts_with("set -euo pipefail\n"));
        assert!(text.contains("echo '==> [1/3] update'\nsudo apt-get update\necho '==> ok: update'"));
        assert!(text.contains("if { docker stop app\n}; then echo '==> ok: stop old'; else echo '==> ignored failure: stop old'; fi"));
        assert!(text.contains("if { command -v docker; } >/dev/null 2>&1; then"));
        assert!(text.contains("==> skip: install docker (already present)"));
    }

    #[test]
    fn probe_command_uses_connect_timeout_and_batch_mode() {
        let spec = target().command("echo ok", Some(10));
        assert_eq!(spec.program, "ssh");
        assert!(spec.args.contains(&"ConnectTimeout=10".to_string()));
        assert!(spec.args.contains(&"BatchMode=yes".to_string()));
        assert_eq!(spec.args.last().map(String::as_str), Some("echo ok"));
    }

    #[test]
    fn rsync_excludes_metadata_and_never_deletes() {
        let spec = target().rsync(Path::new("/work/web-app"), "web-app", &[".git".into()]);
        assert_eq!(spec.program, "rsync");
        assert!(!spec.args.iter().any(|a| a.starts_with("--delete")));
        assert!(spec.args.windows(2).any(|w| w[0] == "--exclude" && w[1] == ".git"));
        assert!(spec.args.contains(&"/work/web-app/".to_string()));
        assert!(spec.args.contains(&"deploy@203.0.113.10:web-app/".to_string()));
        assert!(spec.args.contains(&
            "ssh -i '/home/op/.ssh/id rsa' -o BatchMode=yes -o StrictHostKeyChecking=accept-new"
                .to_string()));
    }

    #[test]
    fn ssh_exit_255_is_a_transport_error() {
        let out = CmdOutput {
            code: Some(255),
            lines: vec![],
        };
        let err = check_remote(&out, "probe", &target()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);

        let out = CmdOutput {
            code: Some(1),
            lines: vec![],
        };
        let err = check_remote(&out, "deploy", &target()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Other);
    }

    #[cfg(unix)]
    #[test]
    fn failed_required_step_ends_the_session() {
        let script = RemoteScript::new("demo")
            .step(RemoteStep::required("first", "echo MARK_FIRST"))
            .step(RemoteStep::required("broken", "false"))
            .step(RemoteStep::required("never", "echo MARK_NEVER"));
        let (code, out) = run_locally("", &script);
        assert_ne!(code, Some(0));
        assert!(out.contains("MARK_FIRST"));
        assert!(!out.contains("MARK_NEVER"), "{out}");
    }

    #[cfg(unix)]
    #[test]
    fn best_effort_failure_and_guard_let_the_session_continue() {
        let script = RemoteScript::new("demo")
            .step(RemoteStep::best_effort("stop old", "false"))
            .step(RemoteStep::unless("install", "true", "echo MARK_INSTALL"))
            .step(RemoteStep::unless("configure", "false", "echo MARK_CONFIGURE"))
            .step(RemoteStep::required("last", "echo MARK_LAST"));
        let (code, out) = run_locally("", &script);
        assert_eq!(code, Some(0), "{out}");
        assert!(out.contains("==> ignored failure: stop old"));
        assert!(out.contains("==> skip: install (already present)"));
        assert!(!out.contains("MARK_INSTALL"));
        assert!(out.contains("MARK_CONFIGURE"));
        assert!(out.contains("MARK_LAST"));
    }
}
