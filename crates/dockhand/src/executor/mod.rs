use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::input::{Prompter, TerminalPrompter};
use crate::log_sanitize::{redact, sanitize_log_line};
use crate::params::{Descriptor, RunParameters};
use crate::planner::Plan;

pub mod runner;

use runner::{CmdOutput, CmdSpec, CommandRunner, SystemRunner};

pub type TaskExecFn = fn(&ConfigDoc, &mut ExecCtx) -> Result<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn label(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

// Run state written by one stage and read by later ones.
#[derive(Default)]
struct SharedRunState {
    params: Mutex<Option<Arc<RunParameters>>>,
    descriptor: Mutex<Option<Descriptor>>,
    secrets: Mutex<Vec<String>>,
}

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskStarted {
        id: String,
        label: String,
    },
    TaskLog {
        id: String,
        level: LogLevel,
        line: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Console progress plus an end-of-run summary.
#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    tasks_started: usize,
    tasks_ok: usize,
    tasks_failed: usize,
    log_lines: usize,
    failed_tasks: Vec<String>,
    warnings: Vec<String>,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::TaskStarted { id, label } => {
                if let Ok(mut s) = self.state.lock() {
                    s.tasks_started = s.tasks_started.saturating_add(1);
                    if s.started_at.is_none() {
                        s.started_at = Some(Instant::now());
                    }
                }
                println!("RUN: {id} ({label})");
            }
            ExecEvent::TaskLog { id, level, line } => {
                if let Ok(mut s) = self.state.lock() {
                    s.log_lines = s.log_lines.saturating_add(1);
                    if level == LogLevel::Warn {
                        s.warnings.push(format!("[{id}] {line}"));
                    }
                }
                match level {
                    LogLevel::Info => println!("[{id}] {line}"),
                    other => println!("{}: [{id}] {line}", other.label()),
                }
            }
            ExecEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                if let Ok(mut s) = self.state.lock() {
                    if ok {
                        s.tasks_ok = s.tasks_ok.saturating_add(1);
                    } else {
                        s.tasks_failed = s.tasks_failed.saturating_add(1);
                        s.failed_tasks.push(id.clone());
                    }
                }
                if ok {
                    println!("DONE: {id} ({elapsed_ms}ms)");
                } else {
                    println!("FAIL: {id} ({elapsed_ms}ms) {}", error.unwrap_or_default());
                }
            }
            ExecEvent::ExecutorDone { ok, error } => {
                let Ok(mut s) = self.state.lock() else {
                    return;
                };
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                let mut summary = String::from("SUMMARY:\n");
                summary.push_str(&format!("  status: {}\n", if ok { "ok" } else { "failed" }));
                summary.push_str(&format!(
                    "  stages: started={} ok={} failed={}\n",
                    s.tasks_started, s.tasks_ok, s.tasks_failed
                ));
                summary.push_str(&format!("  logs: {}\n", s.log_lines));
                summary.push_str(&format!(
                    "  elapsed: {}\n",
                    format_elapsed_hms(wall.as_secs())
                ));
                if !s.failed_tasks.is_empty() {
                    summary.push_str(&format!("  failed_stages: {}\n", s.failed_tasks.join(", ")));
                }
                if !s.warnings.is_empty() {
                    summary.push_str("  warnings:\n");
                    for w in &s.warnings {
                        summary.push_str(&format!("    {w}\n"));
                    }
                }
                if let Some(e) = error.filter(|_| !ok) {
                    summary.push_str(&format!("  error: {e}\n"));
                }
                *s = StdoutSinkState::default();
                print!("{summary}");
            }
        }
    }
}

/// Fans every event out to several sinks (console and run log).
#[derive(Default, Clone)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn ExecSink>>,
}

impl MultiSink {
    pub fn new(sinks: Vec<Arc<dyn ExecSink>>) -> Self {
        Self { sinks }
    }
}

impl ExecSink for MultiSink {
    fn emit(&self, ev: ExecEvent) {
        for sink in &self.sinks {
            sink.emit(ev.clone());
        }
    }
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub current_task_id: Option<String>,
    runner: Arc<dyn CommandRunner>,
    prompter: Arc<dyn Prompter>,
    shared: Arc<SharedRunState>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            sink,
            current_task_id: None,
            runner: Arc::new(SystemRunner),
            prompter: Arc::new(TerminalPrompter),
            shared: Arc::new(SharedRunState::default()),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = prompter;
        self
    }

    pub fn prompter(&self) -> &dyn Prompter {
        self.prompter.as_ref()
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    /// Parameters are set exactly once per run.
    pub fn set_params(&self, params: RunParameters) -> Result<()> {
        let mut g = self
            .shared
            .params
            .lock()
            .map_err(|_| Error::msg("run state lock poisoned"))?;
        if g.is_some() {
            return Err(Error::msg("run parameters were already collected"));
        }
        *g = Some(Arc::new(params));
        Ok(())
    }

    pub fn params(&self) -> Result<Arc<RunParameters>> {
        self.shared
            .params
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .ok_or_else(|| Error::msg("run parameters have not been collected"))
    }

    pub fn set_descriptor(&self, descriptor: Descriptor) {
        if let Ok(mut g) = self.shared.descriptor.lock() {
            *g = Some(descriptor);
        }
    }

    pub fn descriptor(&self) -> Result<Descriptor> {
        self.shared
            .descriptor
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .ok_or_else(|| Error::msg("build descriptor has not been verified"))
    }

    /// Anything registered here is replaced by `***` in every log line.
    pub fn register_secret(&self, secret: &str) {
        if secret.is_empty() {
            return;
        }
        if let Ok(mut g) = self.shared.secrets.lock() {
            if !g.iter().any(|s| s == secret) {
                g.push(secret.to_string());
                // Longest first so a secret that contains another is fully masked.
                g.sort_by_key(|s| std::cmp::Reverse(s.len()));
            }
        }
    }

    pub fn redact(&self, text: &str) -> String {
        match self.shared.secrets.lock() {
            Ok(g) => redact(text, &g),
            Err(_) => text.to_string(),
        }
    }

    fn emit_log(&self, level: LogLevel, msg: &str) {
        let id = self
            .current_task_id
            .clone()
            .unwrap_or_else(|| "<none>".into());
        let line = match self.shared.secrets.lock() {
            Ok(g) => sanitize_log_line(msg, &g),
            Err(_) => sanitize_log_line(msg, &[]),
        };
        if line.is_empty() {
            return;
        }
        self.sink.emit(ExecEvent::TaskLog { id, level, line });
    }

    pub fn log(&self, msg: &str) {
        self.emit_log(LogLevel::Info, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.emit_log(LogLevel::Warn, msg);
    }

    pub fn error(&self, msg: &str) {
        self.emit_log(LogLevel::Error, msg);
    }

    /// Run a command, echoing it and streaming its output into the log.
    /// The exit status is returned, not judged.
    pub fn run(&self, spec: &CmdSpec) -> Result<CmdOutput> {
        if self.dry_run {
            self.log(&format!("DRY-RUN: {}", spec.display()));
            return Ok(CmdOutput {
                code: Some(0),
                lines: Vec::new(),
            });
        }
        self.log(&format!("$ {}", spec.display()));
        let runner = Arc::clone(&self.runner);
        runner.run(spec, &mut |line| self.log(line))
    }

    /// Like [`ExecCtx::run`], but a non-zero exit becomes an error naming `what`.
    pub fn run_checked(&self, spec: &CmdSpec, what: &str) -> Result<CmdOutput> {
        let out = self.run(spec)?;
        if !out.success() {
            return Err(Error::msg(format!("{what} failed ({})", out.status_text())));
        }
        Ok(out)
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    exec: BTreeMap<&'static str, TaskExecFn>,
}

impl TaskRegistry {
    pub fn add(&mut self, id: &'static str, f: TaskExecFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::msg(format!("duplicate task executor for '{id}'")));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskExecFn> {
        self.exec.get(id).copied()
    }
}

pub trait ModuleExec {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()>;
}

/// Run every stage in plan order; the first failure stops the run.
pub fn execute_plan(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    let ordered = plan.ordered()?;
    for task in &ordered {
        if reg.get(&task.id).is_none() {
            return Err(Error::msg(format!(
                "no executor registered for task '{}'",
                task.id
            )));
        }
    }

    for task in ordered {
        let Some(exec) = reg.get(&task.id) else {
            continue;
        };
        ctx.sink.emit(ExecEvent::TaskStarted {
            id: task.id.clone(),
            label: task.label.clone(),
        });
        ctx.set_task(task.id.clone());
        if ctx.dry_run {
            ctx.log(&format!(
                "DRY-RUN: {} ({}/{})",
                task.id, task.module, task.phase
            ));
            ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms: 0,
            });
            continue;
        }

        let start = Instant::now();
        let res = exec(doc, ctx);
        let elapsed_ms = start.elapsed().as_millis();
        match res {
            Ok(()) => ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms,
            }),
            Err(e) => {
                let e = e.context(format!("stage '{}'", task.id));
                let text = ctx.redact(&e.to_string());
                ctx.sink.emit(ExecEvent::TaskFinished {
                    id: task.id.clone(),
                    ok: false,
                    error: Some(text.clone()),
                    elapsed_ms,
                });
                ctx.sink.emit(ExecEvent::ExecutorDone {
                    ok: false,
                    error: Some(text),
                });
                return Err(e);
            }
        }
    }
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: true,
        error: None,
    });
    Ok(())
}

pub fn builtin_registry() -> Result<TaskRegistry> {
    use crate::modules::{container, core, host, proxy, repo, sync, validate};

    let mut reg = TaskRegistry::default();
    // Keep this list explicit (compiled-in modules).
    core::CoreModule::register_tasks(&mut reg)?;
    repo::RepoModule::register_tasks(&mut reg)?;
    host::HostModule::register_tasks(&mut reg)?;
    sync::SyncModule::register_tasks(&mut reg)?;
    container::ContainerModule::register_tasks(&mut reg)?;
    proxy::ProxyModule::register_tasks(&mut reg)?;
    validate::ValidateModule::register_tasks(&mut reg)?;
    Ok(reg)
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
