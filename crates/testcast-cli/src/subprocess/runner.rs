//! Test process runner.
//!
//! Spawns one command, feeds its stdout and stderr through separate
//! [`LineReassembler`]s and hands every completed line to a callback as soon
//! as it is read. Once both pipes close and the child has exited, the run is
//! summarized in a [`RunResult`]. Every failure after this point, including a
//! failed spawn, is reported in the result rather than as an error.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use testcast_core::{Channel, OutputLine};

use super::reassembler::LineReassembler;

/// Exit code reported when the process could not be started or has no code.
pub const NO_EXIT_CODE: i32 = -1;

const READ_CHUNK: usize = 8 * 1024;

/// How the command string is turned into a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShellMode {
    /// Run through the platform shell (`sh -c` / `cmd /C`).
    #[default]
    Shell,
    /// Split on whitespace and execute the program directly.
    Direct,
}

/// How many lines a [`RunResult`] keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineRetention {
    #[default]
    Unbounded,
    /// Keep only the most recent `n` lines.
    Last(usize),
    /// Keep nothing; lines only reach the callback.
    StreamOnly,
}

impl LineRetention {
    /// `None` means unbounded; `Some(0)` means stream only.
    pub const fn from_cap(cap: Option<usize>) -> Self {
        match cap {
            None => Self::Unbounded,
            Some(0) => Self::StreamOnly,
            Some(n) => Self::Last(n),
        }
    }
}

/// Runner configuration.
#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    pub shell: ShellMode,
    pub working_directory: Option<PathBuf>,
    pub retention: LineRetention,
    /// Extra environment variables for the child.
    pub env: Vec<(String, String)>,
}

/// Final outcome of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub succeeded: bool,
    pub exit_code: i32,
    /// Retained lines, in delivery order.
    pub lines: Vec<OutputLine>,
    /// Number of lines delivered to the callback, retained or not.
    pub total_lines: usize,
    pub error_detail: Option<String>,
}

/// Collects delivered lines under a retention policy.
struct LineLog {
    retention: LineRetention,
    lines: VecDeque<OutputLine>,
    total: usize,
}

impl LineLog {
    const fn new(retention: LineRetention) -> Self {
        Self {
            retention,
            lines: VecDeque::new(),
            total: 0,
        }
    }

    fn deliver<F: FnMut(&OutputLine)>(&mut self, line: OutputLine, on_line: &mut F) {
        on_line(&line);
        self.total += 1;
        match self.retention {
            LineRetention::Unbounded => self.lines.push_back(line),
            LineRetention::Last(cap) => {
                if self.lines.len() == cap {
                    self.lines.pop_front();
                }
                self.lines.push_back(line);
            }
            LineRetention::StreamOnly => {}
        }
    }

    fn finish(self, succeeded: bool, exit_code: i32, error_detail: Option<String>) -> RunResult {
        RunResult {
            succeeded,
            exit_code,
            lines: self.lines.into(),
            total_lines: self.total,
            error_detail,
        }
    }
}

/// Spawns commands and streams their output line by line.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    config: RunnerConfig,
}

impl ProcessRunner {
    pub const fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub const fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run `command` to completion, calling `on_line` for every output line.
    ///
    /// `on_line` runs inline, before the next chunk is read: a slow callback
    /// delays later lines but never loses them. Dropping the returned future
    /// kills the child.
    pub async fn run<F>(&self, command: &str, mut on_line: F) -> RunResult
    where
        F: FnMut(&OutputLine),
    {
        let mut log = LineLog::new(self.config.retention);

        let spawned = self
            .build_command(command)
            .and_then(|mut cmd| cmd.spawn().map_err(|e| e.to_string()));
        let mut child = match spawned {
            Ok(child) => child,
            Err(reason) => {
                error!(command, error = %reason, "Failed to spawn test process");
                log.deliver(
                    OutputLine::now(format!("Process error: {reason}"), Channel::Error),
                    &mut on_line,
                );
                return log.finish(false, NO_EXIT_CODE, Some(reason));
            }
        };
        info!(command, pid = ?child.id(), "Spawned test process");

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut stdout_lines = LineReassembler::new(Channel::Primary);
        let mut stderr_lines = LineReassembler::new(Channel::Error);
        let mut stdout_buf = vec![0u8; READ_CHUNK];
        let mut stderr_buf = vec![0u8; READ_CHUNK];
        let mut io_errors = Vec::new();

        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                read = read_chunk(&mut stdout, &mut stdout_buf), if stdout.is_some() => match read {
                    Ok(0) => {
                        debug!("stdout closed");
                        stdout = None;
                    }
                    Ok(n) => {
                        for line in stdout_lines.push(&stdout_buf[..n]) {
                            log.deliver(line, &mut on_line);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read stdout");
                        io_errors.push(format!("stdout read failed: {e}"));
                        stdout = None;
                    }
                },
                read = read_chunk(&mut stderr, &mut stderr_buf), if stderr.is_some() => match read {
                    Ok(0) => {
                        debug!("stderr closed");
                        stderr = None;
                    }
                    Ok(n) => {
                        for line in stderr_lines.push(&stderr_buf[..n]) {
                            log.deliver(line, &mut on_line);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read stderr");
                        io_errors.push(format!("stderr read failed: {e}"));
                        stderr = None;
                    }
                },
            }
        }

        for line in [stdout_lines.flush(), stderr_lines.flush()].into_iter().flatten() {
            log.deliver(line, &mut on_line);
        }

        let (succeeded, exit_code, mut detail) = match child.wait().await {
            Ok(status) if status.success() => (true, 0, None),
            Ok(status) => match status.code() {
                Some(code) => (
                    false,
                    code,
                    Some(format!("Command failed with exit code {code}: {command}")),
                ),
                None => (false, NO_EXIT_CODE, Some(describe_abnormal_exit(status))),
            },
            Err(e) => (
                false,
                NO_EXIT_CODE,
                Some(format!("Failed to wait for process: {e}")),
            ),
        };

        let succeeded = succeeded && io_errors.is_empty();
        if !io_errors.is_empty() {
            let io_detail = io_errors.join("; ");
            detail = Some(match detail {
                Some(d) => format!("{d}; {io_detail}"),
                None => io_detail,
            });
        }

        info!(
            command,
            succeeded,
            exit_code,
            lines = log.total,
            "Test process finished"
        );
        log.finish(succeeded, exit_code, detail)
    }

    fn build_command(&self, command: &str) -> Result<Command, String> {
        let command = command.trim();
        if command.is_empty() {
            return Err("empty command".to_string());
        }

        let mut cmd = match self.config.shell {
            ShellMode::Shell => shell_command(command),
            ShellMode::Direct => {
                let mut parts = command.split_whitespace();
                let program = parts.next().ok_or_else(|| "empty command".to_string())?;
                let mut cmd = Command::new(program);
                cmd.args(parts);
                cmd
            }
        };

        if let Some(dir) = &self.config.working_directory {
            cmd.current_dir(dir);
        }
        cmd.envs(self.config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(not(windows))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

async fn read_chunk<R>(reader: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn describe_abnormal_exit(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map_or_else(
        || format!("Process exited without an exit code ({status})"),
        |signal| format!("Process terminated by signal {signal}"),
    )
}

#[cfg(not(unix))]
fn describe_abnormal_exit(status: ExitStatus) -> String {
    format!("Process exited without an exit code ({status})")
}
