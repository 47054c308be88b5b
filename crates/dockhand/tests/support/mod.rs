#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dockhand::config::ConfigDoc;
use dockhand::executor::runner::{CmdOutput, CmdSpec, CommandRunner};
use dockhand::executor::{self, ExecCtx};
use dockhand::input::Prompter;
use dockhand::runlog::RunLogSink;

pub const TOKEN: &str = "ghp_TESTSECRET123";
pub const REPO_URL: &str = "https://github.com/acme/web-app.git";

type Respond = Box<dyn Fn(&CmdSpec) -> CmdOutput + Send + Sync>;

/// Records every command and answers from a closure instead of spawning.
pub struct FakeRunner {
    calls: Mutex<Vec<CmdSpec>>,
    respond: Respond,
}

impl FakeRunner {
    pub fn new(respond: impl Fn(&CmdSpec) -> CmdOutput + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::default(),
            respond: Box::new(respond),
        })
    }

    pub fn calls(&self) -> Vec<CmdSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ssh_calls(&self) -> Vec<CmdSpec> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == "ssh")
            .collect()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, spec: &CmdSpec, on_line: &mut dyn FnMut(&str)) -> dockhand::Result<CmdOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        let out = (self.respond)(spec);
        for line in &out.lines {
            on_line(line);
        }
        Ok(out)
    }
}

pub fn ok() -> CmdOutput {
    exit(0)
}

pub fn exit(code: i32) -> CmdOutput {
    CmdOutput {
        code: Some(code),
        lines: Vec::new(),
    }
}

pub fn is_git(spec: &CmdSpec, sub: &str) -> bool {
    spec.program == "git" && spec.args.first().map(String::as_str) == Some(sub)
}

pub fn is_probe(spec: &CmdSpec) -> bool {
    spec.program == "ssh" && spec.args.last().map(String::as_str) == Some("echo ok")
}

/// A remote script session whose script contains `needle`.
pub fn script_contains(spec: &CmdSpec, needle: &str) -> bool {
    spec.program == "ssh" && spec.stdin.as_deref().is_some_and(|s| s.contains(needle))
}

/// Simulates `git clone` by creating the target directory with the given files.
pub fn fake_clone(spec: &CmdSpec, files: &[&str]) {
    let Some(dir) = spec.args.get(2) else {
        return;
    };
    let dir = Path::new(dir);
    fs::create_dir_all(dir.join(".git")).unwrap();
    for f in files {
        fs::write(dir.join(f), "x\n").unwrap();
    }
}

/// Answers the text prompts with blanks and the secret prompt with [`TOKEN`].
pub struct TokenOnly;

impl Prompter for TokenOnly {
    fn text(&self, _label: &str, _default: Option<&str>) -> dockhand::Result<String> {
        Ok(String::new())
    }

    fn secret(&self, _label: &str) -> dockhand::Result<String> {
        Ok(TOKEN.to_string())
    }
}

pub struct Fixture {
    pub tmp: tempfile::TempDir,
    pub key: PathBuf,
    pub base: PathBuf,
    pub logs: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let key = tmp.path().join("id_test");
        fs::write(&key, "key\n").expect("write key");
        let base = tmp.path().join("work");
        let logs = tmp.path().join("logs");
        Self {
            tmp,
            key,
            base,
            logs,
        }
    }

    pub fn working_copy(&self) -> PathBuf {
        self.base.join("web-app")
    }

    pub fn doc(&self) -> ConfigDoc {
        let raw = format!(
            r#"
[target]
repo_url = "{REPO_URL}"
ssh_user = "deploy"
ssh_host = "203.0.113.10"
ssh_key = '{}'

[core.steps.collect]
token_env = "DOCKHAND_TEST_TOKEN_NOT_SET"

[repo.steps.fetch]
base_dir = '{}'

[container.steps.deploy]
settle_secs = 1

[validate.steps.reachability]
external_url = "http://127.0.0.1:9/"
external_timeout_secs = 1
"#,
            self.key.display(),
            self.base.display()
        );
        ConfigDoc {
            path: PathBuf::from("<mem>"),
            value: toml::from_str(&raw).expect("parse fixture toml"),
        }
    }

    /// Run the whole pipeline; returns the result and the run log contents.
    pub fn run(
        &self,
        doc: &ConfigDoc,
        runner: Arc<FakeRunner>,
        prompter: Arc<dyn Prompter>,
    ) -> (dockhand::Result<()>, String) {
        let plan = dockhand::modules::build_plan(doc).expect("plan");
        let reg = executor::builtin_registry().expect("registry");
        let log = Arc::new(RunLogSink::create(&self.logs).expect("run log"));
        let mut ctx = ExecCtx::new(false, log.clone())
            .with_runner(runner)
            .with_prompter(prompter);
        let res = executor::execute_plan(doc, &plan, &reg, &mut ctx);
        let text = fs::read_to_string(log.path()).expect("read run log");
        (res, text)
    }
}
