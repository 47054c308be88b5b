use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use dockhand::config::{self, ConfigDoc};
use dockhand::executor::{self, ExecCtx, ExecSink, MultiSink, StdoutSink};
use dockhand::input::{NoInputPrompter, Prompter, TOKEN_ENV, TerminalPrompter};
use dockhand::log_sanitize::redact;
use dockhand::modules;
use dockhand::runlog::RunLogSink;
use dockhand::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Deploy a repository to a remote host
    Run {
        /// Optional deploy definition TOML
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        target: TargetArgs,
        /// Directory for the deploy_<timestamp>.log run log
        #[arg(long, default_value = ".")]
        log_dir: PathBuf,
        /// Never prompt; values that are not preset count as blank
        #[arg(long)]
        no_input: bool,
        /// Print what would run without executing stage bodies
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the ordered deploy stages
    Plan {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long, conflicts_with = "json")]
        dot: bool,
        /// Print the ordered stages as JSON
        #[arg(long)]
        json: bool,
    },
    /// Load config and print the fully-resolved TOML (after imports/extends)
    Resolve {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Debug, clap::Args)]
struct TargetArgs {
    /// Repository URL (https)
    #[arg(long)]
    repo: Option<String>,
    /// Branch to deploy [default: main]
    #[arg(long)]
    branch: Option<String>,
    /// SSH login user on the target host
    #[arg(long)]
    user: Option<String>,
    /// Target host name or address
    #[arg(long)]
    host: Option<String>,
    /// SSH private key [default: ~/.ssh/id_rsa]
    #[arg(long)]
    key: Option<String>,
    /// Port the application listens on [default: 3000]
    #[arg(long)]
    port: Option<u16>,
}

impl TargetArgs {
    /// `[target]` table holding only the flags that were given.
    fn overlay(&self) -> toml::Value {
        let mut target = toml::Table::new();
        let strings = [
            ("repo_url", &self.repo),
            ("branch", &self.branch),
            ("ssh_user", &self.user),
            ("ssh_host", &self.host),
            ("ssh_key", &self.key),
        ];
        for (key, v) in strings {
            if let Some(v) = v {
                target.insert(key.into(), toml::Value::String(v.clone()));
            }
        }
        if let Some(port) = self.port {
            target.insert("app_port".into(), toml::Value::Integer(i64::from(port)));
        }
        let mut root = toml::Table::new();
        if !target.is_empty() {
            root.insert("target".into(), toml::Value::Table(target));
        }
        toml::Value::Table(root)
    }
}

fn main() -> ExitCode {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("DOCKHAND_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let res = match args.cmd {
        Command::Run {
            config,
            target,
            log_dir,
            no_input,
            dry_run,
        } => cmd_run(config.as_deref(), &target, &log_dir, no_input, dry_run),
        Command::Plan { config, dot, json } => cmd_plan(config.as_deref(), dot, json),
        Command::Resolve { config } => cmd_resolve(&config),
    };
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("dockhand: {e}");
            ExitCode::from(e.kind().exit_code())
        }
    }
}

fn load_doc(path: Option<&Path>) -> Result<ConfigDoc> {
    match path {
        Some(p) => config::load(p),
        None => Ok(ConfigDoc::empty()),
    }
}

fn cmd_plan(path: Option<&Path>, dot: bool, json: bool) -> Result<()> {
    let doc = load_doc(path)?;
    let plan = modules::build_plan(&doc)?;

    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }

    let ordered = plan.ordered()?;
    if json {
        let stages: Vec<serde_json::Value> = ordered
            .iter()
            .map(|t| {
                serde_json::json!({
                    "id": t.id,
                    "label": t.label,
                    "module": t.module,
                    "phase": t.phase,
                    "after": t.after,
                })
            })
            .collect();
        let s = serde_json::to_string_pretty(&stages)
            .map_err(|e| Error::msg(format!("failed to render plan: {e}")))?;
        println!("{s}");
        return Ok(());
    }

    for (i, task) in ordered.iter().enumerate() {
        println!(
            "{:>2}. {:<22}  {:<10} {:<10}  {}",
            i + 1,
            task.id,
            task.module,
            task.phase,
            task.label
        );
    }
    Ok(())
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let doc = config::load(path)?;
    let s = toml::to_string_pretty(&doc.value)
        .map_err(|e| Error::msg(format!("failed to render config: {e}")))?;
    print!("{s}");
    Ok(())
}

fn cmd_run(
    path: Option<&Path>,
    target: &TargetArgs,
    log_dir: &Path,
    no_input: bool,
    dry_run: bool,
) -> Result<()> {
    let run_log = Arc::new(RunLogSink::create(log_dir)?);
    println!("run log: {}", run_log.path().display());
    let env_secrets: Vec<String> = std::env::var(TOKEN_ENV)
        .ok()
        .filter(|t| !t.trim().is_empty())
        .into_iter()
        .collect();

    let prepared = load_doc(path).and_then(|mut doc| {
        doc.apply_overlay(target.overlay());
        let plan = modules::build_plan(&doc)?;
        Ok((doc, plan))
    });
    let (doc, plan) = match prepared {
        Ok(v) => v,
        Err(e) => {
            run_log.setup_failed(&e, &env_secrets);
            return Err(Error::new(e.kind(), redact(e.message(), &env_secrets)));
        }
    };
    let reg = executor::builtin_registry()?;

    let sinks: Vec<Arc<dyn ExecSink>> = vec![Arc::new(StdoutSink::default()), run_log];
    let prompter: Arc<dyn Prompter> = if no_input {
        Arc::new(NoInputPrompter)
    } else {
        Arc::new(TerminalPrompter)
    };
    let mut ctx =
        ExecCtx::new(dry_run, Arc::new(MultiSink::new(sinks))).with_prompter(prompter);

    executor::execute_plan(&doc, &plan, &reg, &mut ctx)
        .map_err(|e| Error::new(e.kind(), ctx.redact(e.message())))
}
