//! Bounded execution of external commands.
use std::{
    fmt,
    io::Read,
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    sync::mpsc::{self, Receiver},
    thread,
    time::{Duration, Instant},
};

use nix::{sys::signal, unistd::Pid};
use tracing::{debug, error, warn};

use crate::{
    constants::{CHILD_POLL_INTERVAL, DEFAULT_SHELL, SHELL_COMMAND_FLAG},
    error::CommandError,
    wait::Wait,
};

/// How long to keep draining output after the child exits. Commands that leave
/// background jobs holding the pipes open would otherwise block forever.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// A command to execute, either through the shell or as an argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// Interpreted by `sh -c`.
    Shell(String),
    /// Executed directly; the first element is the program.
    Args(Vec<String>),
}

impl CommandLine {
    /// Shell command shorthand.
    pub fn shell(command: impl Into<String>) -> Self {
        CommandLine::Shell(command.into())
    }

    /// Argument vector shorthand.
    pub fn args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandLine::Args(args.into_iter().map(Into::into).collect())
    }

    fn to_command(&self) -> Option<Command> {
        match self {
            CommandLine::Shell(script) => {
                let mut cmd = Command::new(DEFAULT_SHELL);
                cmd.arg(SHELL_COMMAND_FLAG).arg(script);
                Some(cmd)
            }
            CommandLine::Args(args) => {
                let (program, rest) = args.split_first()?;
                let mut cmd = Command::new(program);
                cmd.args(rest);
                Some(cmd)
            }
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandLine::Shell(script) => write!(f, "{script}"),
            CommandLine::Args(args) => write!(f, "{}", args.join(" ")),
        }
    }
}

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or `None` when the child was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes external commands with a hard deadline.
pub trait CommandRunner {
    /// Runs `command`, never blocking past `timeout`. The command is killed early
    /// once `wait` reports an interrupt.
    fn run(
        &self,
        command: &CommandLine,
        timeout: Duration,
        wait: &dyn Wait,
    ) -> Result<CommandOutput, CommandError>;
}

/// Runner that spawns real OS processes.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl ShellRunner {
    /// Creates a runner inheriting the current directory and environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every command from `dir`.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable to every command.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl CommandRunner for ShellRunner {
    fn run(
        &self,
        command: &CommandLine,
        timeout: Duration,
        wait: &dyn Wait,
    ) -> Result<CommandOutput, CommandError> {
        if timeout.is_zero() {
            return Err(CommandError::InvalidTimeout);
        }

        let rendered = command.to_string();
        let mut cmd = command.to_command().ok_or_else(|| CommandError::Launch {
            command: rendered.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty argument vector",
            ),
        })?;

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        // A dedicated process group lets a timeout take down the whole tree and keeps
        // terminal interrupts aimed at redeploy away from the child.
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        debug!("Running `{rendered}` with timeout {:?}", timeout);
        let mut child = cmd.spawn().map_err(|source| {
            error!("Failed to launch `{rendered}`: {source}");
            CommandError::Launch {
                command: rendered.clone(),
                source,
            }
        })?;

        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let status = match wait_for_child(&mut child, timeout, wait) {
            Ok(ChildExit::Exited(status)) => status,
            Ok(ChildExit::TimedOut) => {
                error!("Command `{rendered}` timed out after {:?}", timeout);
                terminate_tree(&mut child);
                return Err(CommandError::TimedOut {
                    command: rendered,
                    timeout,
                });
            }
            Ok(ChildExit::Interrupted) => {
                warn!("Interrupted while running `{rendered}`; killing it");
                terminate_tree(&mut child);
                return Err(CommandError::Interrupted { command: rendered });
            }
            Err(source) => {
                terminate_tree(&mut child);
                return Err(CommandError::Launch {
                    command: rendered,
                    source,
                });
            }
        };

        let output = CommandOutput {
            exit_code: status.code(),
            stdout: stdout.map(collect_output).unwrap_or_default(),
            stderr: stderr.map(collect_output).unwrap_or_default(),
        };

        if output.success() {
            debug!("Command `{rendered}` completed successfully");
        } else {
            warn!(
                "Command `{rendered}` failed with exit code {:?}",
                output.exit_code
            );
            if !output.stderr.trim().is_empty() {
                warn!("stderr: {}", output.stderr.trim());
            }
        }

        Ok(output)
    }
}

enum ChildExit {
    Exited(ExitStatus),
    TimedOut,
    Interrupted,
}

/// Polls the child until it exits, the deadline passes or `wait` is interrupted.
fn wait_for_child(
    child: &mut Child,
    timeout: Duration,
    wait: &dyn Wait,
) -> std::io::Result<ChildExit> {
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(ChildExit::Exited(status));
        }
        if wait.interrupted() {
            return Ok(ChildExit::Interrupted);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(ChildExit::TimedOut);
        }
        thread::sleep(CHILD_POLL_INTERVAL.min(deadline - now));
    }
}

/// Kills the child's process group (falling back to the child itself) and reaps it.
fn terminate_tree(child: &mut Child) {
    let pgid = Pid::from_raw(child.id() as i32);
    if let Err(err) = signal::killpg(pgid, signal::SIGKILL)
        && err != nix::errno::Errno::ESRCH
    {
        warn!("Failed to signal process group {pgid}: {err}");
        if let Err(err) = child.kill() {
            error!("Failed to kill command (PID {}): {err}", child.id());
        }
    }
    let _ = child.wait();
}

fn spawn_reader<R>(mut stream: R) -> Receiver<String>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = stream.read_to_end(&mut buffer);
        let _ = tx.send(String::from_utf8_lossy(&buffer).into_owned());
    });
    rx
}

fn collect_output(rx: Receiver<String>) -> String {
    rx.recv_timeout(OUTPUT_DRAIN_TIMEOUT).unwrap_or_else(|_| {
        debug!("Output stream still held open by a background process; not waiting");
        String::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::{CancelToken, ThreadWait};

    fn no_cancel() -> ThreadWait {
        ThreadWait::uninterruptible()
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let runner = ShellRunner::new();
        let output = runner
            .run(&CommandLine::shell("echo hello"), Duration::from_secs(5), &no_cancel())
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn nonzero_exit_is_not_an_error() {
        let runner = ShellRunner::new();
        let output = runner
            .run(
                &CommandLine::shell("echo oops >&2; exit 3"),
                Duration::from_secs(5),
                &no_cancel(),
            )
            .unwrap();
        assert!(!output.success());
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[test]
    fn missing_binary_is_a_launch_error() {
        let runner = ShellRunner::new();
        let result = runner.run(
            &CommandLine::args(["/definitely/not/a/binary"]),
            Duration::from_secs(5),
            &no_cancel(),
        );
        assert!(matches!(result, Err(CommandError::Launch { .. })));
    }

    #[test]
    fn empty_argument_vector_is_a_launch_error() {
        let runner = ShellRunner::new();
        let result = runner.run(
            &CommandLine::Args(Vec::new()),
            Duration::from_secs(5),
            &no_cancel(),
        );
        assert!(matches!(result, Err(CommandError::Launch { .. })));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let runner = ShellRunner::new();
        let result = runner.run(&CommandLine::shell("true"), Duration::ZERO, &no_cancel());
        assert!(matches!(result, Err(CommandError::InvalidTimeout)));
    }

    #[test]
    fn slow_command_times_out_without_blocking() {
        let runner = ShellRunner::new();
        let started = Instant::now();
        let result = runner.run(
            &CommandLine::shell("sleep 30"),
            Duration::from_millis(200),
            &no_cancel(),
        );
        assert!(matches!(result, Err(CommandError::TimedOut { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn background_job_holding_pipes_does_not_block() {
        let runner = ShellRunner::new();
        let started = Instant::now();
        let output = runner
            .run(
                &CommandLine::shell("sleep 5 & echo started"),
                Duration::from_secs(10),
                &no_cancel(),
            )
            .unwrap();
        assert!(output.success());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn working_dir_and_env_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new()
            .with_working_dir(dir.path())
            .with_env("REDEPLOY_TEST_VALUE", "42");
        let output = runner
            .run(
                &CommandLine::shell("pwd; echo $REDEPLOY_TEST_VALUE"),
                Duration::from_secs(5),
                &no_cancel(),
            )
            .unwrap();
        let lines: Vec<_> = output.stdout.lines().collect();
        assert_eq!(
            std::fs::canonicalize(lines[0]).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
        assert_eq!(lines[1], "42");
    }

    #[test]
    fn cancellation_kills_the_command_promptly() {
        let token = CancelToken::new();
        let canceller = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            canceller.cancel();
        });

        let runner = ShellRunner::new();
        let started = Instant::now();
        let result = runner.run(
            &CommandLine::shell("sleep 3"),
            Duration::from_secs(10),
            &ThreadWait::interruptible(token),
        );
        assert!(matches!(result, Err(CommandError::Interrupted { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn uninterruptible_wait_ignores_a_cancelled_token() {
        let token = CancelToken::new();
        token.cancel();
        let runner = ShellRunner::new();
        let output = runner
            .run(
                &CommandLine::shell("sleep 0.2; echo done"),
                Duration::from_secs(5),
                &ThreadWait::uninterruptible(),
            )
            .unwrap();
        assert_eq!(output.stdout.trim(), "done");
    }
}
