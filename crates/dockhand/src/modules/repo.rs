use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use dockhand_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::executor::runner::CmdSpec;
use crate::modules::util::default_true;
use crate::params::{Descriptor, RunParameters};
use crate::{Error, Result};

/// Checked in this order; the first hit wins and any of them beats a Dockerfile.
pub const COMPOSE_FILES: [&str; 4] = [
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];
pub const DOCKERFILE: &str = "Dockerfile";

#[Task(
    id = "repo.fetch",
    module = "repo",
    phase = "fetch",
    provides = ["working-copy"],
    after = ["params"],
    failure = Transport,
    default_label = "Fetch repository"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    /// Directory the working copy is created in.
    pub base_dir: String,
}

impl Default for FetchTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            base_dir: ".".into(),
        }
    }
}

impl FetchTask {
    pub fn run(cfg: &Self, _doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let params = ctx.params()?;
        let base = PathBuf::from(cfg.base_dir.trim());
        let dir = base.join(params.project_dir_name()?);

        let auth = params.authenticated_url()?;
        let fetch_url = match &auth {
            Some(a) => {
                ctx.register_secret(&a.userinfo);
                a.url.clone()
            }
            None => {
                ctx.warn(&format!(
                    "repository URL is not http(s); fetching {} without the access token",
                    params.repo_url
                ));
                params.repo_url.clone()
            }
        };

        if dir.join(".git").exists() {
            ctx.log(&format!("updating working copy {}", dir.display()));
            update(ctx, &dir, &fetch_url, &params.branch)
        } else {
            ctx.log(&format!("cloning into {}", dir.display()));
            fs::create_dir_all(&base)
                .map_err(|e| Error::msg(format!("create {} failed: {e}", base.display())))?;
            clone(ctx, &dir, &fetch_url, &params)
        }
    }
}

fn git(dir: &Path) -> CmdSpec {
    CmdSpec::new("git").cwd(dir)
}

fn update(ctx: &ExecCtx, dir: &Path, url: &str, branch: &str) -> Result<()> {
    let refspec = format!("+refs/heads/{branch}:refs/remotes/origin/{branch}");
    ctx.run_checked(&git(dir).args(["fetch", url, refspec.as_str()]), "git fetch")?;
    ctx.run_checked(&git(dir).args(["checkout", branch]), "git checkout")?;
    let upstream = format!("origin/{branch}");
    let merged = ctx.run(&git(dir).args(["merge", "--ff-only", upstream.as_str()]))?;
    if !merged.success() {
        return Err(Error::precondition(format!(
            "working copy {} has diverged from {upstream}; reconcile or remove it and rerun",
            dir.display()
        )));
    }
    Ok(())
}

fn clone(ctx: &ExecCtx, dir: &Path, url: &str, params: &RunParameters) -> Result<()> {
    let spec = CmdSpec::new("git")
        .arg("clone")
        .arg(url)
        .arg(dir.display().to_string());
    ctx.run_checked(&spec, "git clone")?;
    // The clone URL carries the token; keep it out of .git/config.
    ctx.run_checked(
        &git(dir).args(["remote", "set-url", "origin", params.repo_url.as_str()]),
        "git remote set-url",
    )?;
    ctx.run_checked(
        &git(dir).args(["checkout", params.branch.as_str()]),
        "git checkout",
    )?;
    Ok(())
}

/// Where the working copy for `params` lives on this machine.
pub fn working_copy_dir(doc: &ConfigDoc, params: &RunParameters) -> Result<PathBuf> {
    let cfg: FetchTask = doc
        .deserialize_path(FetchTask::CONFIG_PATH)?
        .unwrap_or_default();
    Ok(PathBuf::from(cfg.base_dir.trim()).join(params.project_dir_name()?))
}

#[Task(
    id = "repo.verify",
    module = "repo",
    phase = "verify",
    provides = ["descriptor"],
    after = ["repo.fetch"],
    failure = Precondition,
    default_label = "Verify build descriptor"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerifyTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for VerifyTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl VerifyTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let params = ctx.params()?;
        let dir = working_copy_dir(doc, &params)?;
        let descriptor = detect_descriptor(&dir)?;
        ctx.log(&format!("build descriptor: {}", descriptor.describe()));
        ctx.set_descriptor(descriptor);
        Ok(())
    }
}

pub fn detect_descriptor(dir: &Path) -> Result<Descriptor> {
    if let Some(file) = COMPOSE_FILES.iter().find(|f| dir.join(f).is_file()) {
        return Ok(Descriptor::Compose {
            file: (*file).to_string(),
        });
    }
    if dir.join(DOCKERFILE).is_file() {
        return Ok(Descriptor::Dockerfile);
    }
    Err(Error::precondition(format!(
        "no build descriptor in {}: expected {} or one of {}",
        dir.display(),
        DOCKERFILE,
        COMPOSE_FILES.join(", ")
    )))
}

#[Module(id = "repo", tasks = [FetchTask, VerifyTask])]
pub struct RepoModule;
