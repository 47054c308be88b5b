use serde::Deserialize;

use dockhand_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::modules::repo;
use crate::modules::util::{self, default_true};
use crate::params::RunParameters;
use crate::remote::{check_remote, shell_quote};
use crate::{Error, Result};

#[Task(
    id = "sync.files",
    module = "sync",
    phase = "sync",
    provides = ["remote:files"],
    after = ["host.provision", "working-copy"],
    failure = Transport,
    default_label = "Synchronize files"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilesTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    /// Parent of the project directory on the host; empty means the login directory.
    pub remote_root: String,
    pub excludes: Vec<String>,
}

impl Default for FilesTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            remote_root: String::new(),
            excludes: vec![".git".into()],
        }
    }
}

impl FilesTask {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let (params, target) = util::ssh_target(ctx)?;
        let local = repo::working_copy_dir(doc, &params)?;
        if !local.is_dir() {
            return Err(Error::msg(format!(
                "working copy {} is missing",
                local.display()
            )));
        }
        let remote_dir = join_remote(&cfg.remote_root, &params.project_dir_name()?);

        let mkdir = target.command(&format!("mkdir -p {}", shell_quote(&remote_dir)), None);
        let out = ctx.run(&mkdir)?;
        check_remote(&out, "create remote directory", &target)?;

        ctx.log(&format!(
            "syncing {} -> {}:{}",
            local.display(),
            target.destination(),
            remote_dir
        ));
        let out = ctx.run(&target.rsync(&local, &remote_dir, &cfg.excludes))?;
        if !out.success() {
            return Err(Error::transport(format!(
                "rsync to {} failed ({})",
                target.destination(),
                out.status_text()
            )));
        }
        ctx.log("files synchronized");
        Ok(())
    }
}

fn join_remote(root: &str, project: &str) -> String {
    let root = root.trim().trim_end_matches('/');
    if root.is_empty() {
        project.to_string()
    } else {
        format!("{root}/{project}")
    }
}

/// Project directory on the host, as later stages `cd` into it.
pub fn remote_project_dir(doc: &ConfigDoc, params: &RunParameters) -> Result<String> {
    let cfg: FilesTask = doc
        .deserialize_path(FilesTask::CONFIG_PATH)?
        .unwrap_or_default();
    Ok(join_remote(&cfg.remote_root, &params.project_dir_name()?))
}

#[Module(id = "sync", tasks = [FilesTask])]
pub struct SyncModule;
