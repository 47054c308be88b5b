use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc;

use crate::error::{Error, Result};
use crate::remote::shell_quote;

// Keep the tail of a command's output; stages only ever look at the end.
const MAX_CAPTURED_LINES: usize = 4000;

/// A process invocation, described as data so it can be logged, faked in tests
/// and executed by a [`CommandRunner`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<String>,
}

impl CmdSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Shell-like rendering for logs. Stdin content is summarized, not shown.
    pub fn display(&self) -> String {
        let mut out = shell_quote(&self.program);
        for a in &self.args {
            out.push(' ');
            out.push_str(&shell_quote(a));
        }
        if let Some(input) = &self.stdin {
            out.push_str(&format!(" <<< [script, {} lines]", input.lines().count()));
        }
        if let Some(dir) = &self.cwd {
            out.push_str(&format!("  (in {})", dir.display()));
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub lines: Vec<String>,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn status_text(&self) -> String {
        match self.code {
            Some(c) => format!("exit status {c}"),
            None => "terminated by signal".into(),
        }
    }
}

pub trait CommandRunner: Send + Sync {
    /// Run to completion, handing every output line (stdout and stderr
    /// interleaved) to `on_line` as it arrives. A non-zero exit is not an
    /// error here; callers decide what a failure means.
    fn run(&self, spec: &CmdSpec, on_line: &mut dyn FnMut(&str)) -> Result<CmdOutput>;
}

/// Spawns real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CmdSpec, on_line: &mut dyn FnMut(&str)) -> Result<CmdOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        tracing::debug!(program = %spec.program, args = spec.args.len(), "spawning");
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::msg(format!("failed to start {}: {e}", spec.program)))?;

        // Feed stdin from its own thread so a chatty child cannot deadlock us.
        let feeder = match (child.stdin.take(), spec.stdin.clone()) {
            (Some(mut pipe), Some(input)) => Some(std::thread::spawn(move || {
                let _ = pipe.write_all(input.as_bytes());
            })),
            _ => None,
        };

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        let mut lines = Vec::new();
        for line in rx {
            on_line(&line);
            if lines.len() >= MAX_CAPTURED_LINES {
                lines.remove(0);
            }
            lines.push(line);
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait for {} failed: {e}", spec.program)))?;
        if let Some(h) = feeder {
            let _ = h.join();
        }
        tracing::debug!(program = %spec.program, code = ?status.code(), "exited");
        Ok(CmdOutput {
            code: status.code(),
            lines,
        })
    }
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    let flush = |pending: &mut Vec<u8>| {
        let line = String::from_utf8_lossy(pending).into_owned();
        pending.clear();
        let _ = tx.send(line);
    };

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for b in &buf[..n] {
            match *b {
                b'\n' | b'\r' if pending.is_empty() => {}
                b'\n' | b'\r' => flush(&mut pending),
                other => {
                    pending.push(other);
                    if pending.len() >= MAX_PENDING_BYTES {
                        flush(&mut pending);
                    }
                }
            }
        }
    }

    if !pending.is_empty() {
        flush(&mut pending);
    }
}
