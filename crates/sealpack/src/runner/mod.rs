use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use crate::pipeline::events::{PackEvent, PackSink};
use crate::pipeline::{Stage, StageArtifact};
use crate::targets::Target;

mod output;

pub use output::clean_line;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program name, or the full command line when `shell` is set.
    pub program: String,
    pub args: Vec<String>,
    pub shell: bool,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            shell: false,
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn shell(line: impl Into<String>) -> Self {
        Self {
            shell: true,
            ..Self::new(line)
        }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
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

    pub fn to_command(&self) -> Command {
        let mut cmd = if self.shell {
            shell_command(&self.program)
        } else {
            let mut c = Command::new(&self.program);
            c.args(&self.args);
            c
        };
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }
}

#[cfg(unix)]
fn shell_command(line: &str) -> Command {
    let mut c = Command::new("sh");
    c.arg("-c").arg(line);
    c
}

#[cfg(not(unix))]
fn shell_command(line: &str) -> Command {
    let mut c = Command::new("cmd");
    c.arg("/C").arg(line);
    c
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.shell {
            return f.write_str(&self.program);
        }
        f.write_str(&self.program)?;
        for a in &self.args {
            if a.is_empty() || a.chars().any(char::is_whitespace) {
                write!(f, " {}", sh_quote(a))?;
            } else {
                write!(f, " {a}")?;
            }
        }
        Ok(())
    }
}

/// Quote for the host shell used by [`CommandSpec::shell`].
#[cfg(unix)]
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(not(unix))]
pub fn sh_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\\\""))
}

/// One external command issued on behalf of a target stage.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub target: Target,
    pub stage: Stage,
    pub command: &'a CommandSpec,
    pub artifacts: &'a StageArtifact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolFailure {
    Spawn { command: String, message: String },
    /// `code` is `None` when the process was terminated by a signal.
    Exit { command: String, code: Option<i32> },
    TimedOut { command: String, secs: u64 },
    Wait { command: String, message: String },
}

impl ToolFailure {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ToolFailure::Exit { code, .. } => *code,
            _ => None,
        }
    }

    pub fn command(&self) -> &str {
        match self {
            ToolFailure::Spawn { command, .. }
            | ToolFailure::Exit { command, .. }
            | ToolFailure::TimedOut { command, .. }
            | ToolFailure::Wait { command, .. } => command,
        }
    }
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolFailure::Spawn { command, message } => {
                write!(f, "failed to launch `{command}`: {message}")
            }
            ToolFailure::Exit {
                command,
                code: Some(code),
            } => write!(f, "`{command}` exited with code {code}"),
            ToolFailure::Exit {
                command,
                code: None,
            } => write!(f, "`{command}` was terminated by a signal"),
            ToolFailure::TimedOut { command, secs } => {
                write!(f, "`{command}` timed out after {secs}s")
            }
            ToolFailure::Wait { command, message } => {
                write!(f, "failed to wait for `{command}`: {message}")
            }
        }
    }
}

impl std::error::Error for ToolFailure {}

pub trait CommandRunner: Send + Sync {
    fn run(&self, inv: &Invocation<'_>) -> Result<(), ToolFailure>;
}

/// Runs commands as child processes, streaming their output to the sink as
/// stage log lines.
pub struct SystemRunner {
    timeout: Duration,
    sink: Arc<dyn PackSink>,
}

impl SystemRunner {
    pub fn new(timeout: Duration, sink: Arc<dyn PackSink>) -> Self {
        Self { timeout, sink }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, inv: &Invocation<'_>) -> Result<(), ToolFailure> {
        let command = inv.command.to_string();
        tracing::debug!(platform = %inv.target, stage = %inv.stage, %command, "spawn");

        let mut cmd = inv.command.to_command();

        // Own process group, so a timeout takes down the whole subtree
        // (`sh -c`, `npx`, ...).
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ToolFailure::Spawn {
                command: command.clone(),
                message: e.to_string(),
            })?;
        let pgid = child.id();

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || output::forward_lines(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || output::forward_lines(err, tx));
        }
        drop(tx);

        // A timeout too large to represent as an instant means no deadline.
        let deadline = Instant::now().checked_add(self.timeout);

        loop {
            let next = match deadline {
                Some(d) => rx.recv_timeout(d.saturating_duration_since(Instant::now())),
                None => rx.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected),
            };
            match next {
                Ok(line) => {
                    let line = clean_line(&line);
                    if line.is_empty() {
                        continue;
                    }
                    self.sink.emit(PackEvent::StageLog {
                        target: inv.target,
                        stage: inv.stage,
                        line,
                    });
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(self.abort(&mut child, pgid, &command));
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        // Both streams are closed; the process is exiting or already gone.
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => return Ok(()),
                Ok(Some(status)) => {
                    return Err(ToolFailure::Exit {
                        command,
                        code: status.code(),
                    });
                }
                Ok(None) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(self.abort(&mut child, pgid, &command));
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    return Err(ToolFailure::Wait {
                        command,
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

impl SystemRunner {
    fn abort(&self, child: &mut Child, pgid: u32, command: &str) -> ToolFailure {
        kill_pgroup(pgid);
        let _ = child.kill();
        let _ = child.wait();
        ToolFailure::TimedOut {
            command: command.to_string(),
            secs: self.timeout.as_secs(),
        }
    }
}

fn kill_pgroup(pgid: u32) {
    #[cfg(unix)]
    {
        // Negative PID targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), libc::SIGKILL) };
    }
    #[cfg(not(unix))]
    {
        let _ = pgid;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::pipeline::events::ChannelSink;
    use std::path::Path;

    fn artifacts() -> StageArtifact {
        StageArtifact::new(Path::new("/tmp/sealpack-runner-test"), Target::Linux, "app")
    }

    fn run_with(spec: CommandSpec, timeout: Duration) -> (Result<(), ToolFailure>, Vec<String>) {
        let (tx, rx) = mpsc::channel();
        let runner = SystemRunner::new(timeout, Arc::new(ChannelSink::new(tx)));
        let art = artifacts();
        let inv = Invocation {
            target: Target::Linux,
            stage: Stage::GeneratePayload,
            command: &spec,
            artifacts: &art,
        };
        let res = runner.run(&inv);
        drop(runner);
        let lines = rx
            .try_iter()
            .filter_map(|ev| match ev {
                PackEvent::StageLog { line, .. } => Some(line),
                _ => None,
            })
            .collect();
        (res, lines)
    }

    #[test]
    fn zero_exit_succeeds_and_streams_output() {
        let (res, lines) = run_with(
            CommandSpec::shell("echo blob written; echo warn >&2"),
            DEFAULT_TIMEOUT,
        );
        res.expect("command should succeed");
        assert!(lines.contains(&"blob written".to_string()), "{lines:?}");
        assert!(lines.contains(&"warn".to_string()), "{lines:?}");
    }

    #[test]
    fn non_zero_exit_reports_code() {
        let (res, _) = run_with(CommandSpec::shell("exit 3"), DEFAULT_TIMEOUT);
        let err = res.expect_err("should fail");
        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(err.command(), "exit 3");
    }

    #[test]
    fn missing_program_is_spawn_failure() {
        let (res, _) = run_with(
            CommandSpec::new("sealpack-definitely-not-a-program"),
            DEFAULT_TIMEOUT,
        );
        assert!(matches!(res, Err(ToolFailure::Spawn { .. })));
    }

    #[test]
    fn timeout_kills_the_process_group() {
        let start = Instant::now();
        let (res, _) = run_with(CommandSpec::shell("sleep 30"), Duration::from_millis(300));
        assert!(matches!(res, Err(ToolFailure::TimedOut { .. })), "{res:?}");
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn huge_timeout_runs_without_a_deadline() {
        let (res, lines) = run_with(
            CommandSpec::shell("echo done"),
            Duration::from_secs(i64::MAX as u64),
        );
        res.expect("command should succeed");
        assert_eq!(lines, vec!["done".to_string()]);
    }

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let spec = CommandSpec::new("codesign").args(["--sign", "-", "/tmp/my app"]);
        assert_eq!(spec.to_string(), "codesign --sign - '/tmp/my app'");
    }
}
