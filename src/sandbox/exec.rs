//! Subprocess execution with a wall-clock deadline and bounded output.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

/// Program plus arguments. No shell is involved unless asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Run `script` through `/bin/sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh", ["-c".to_string(), script.into()])
    }
}

impl TryFrom<Vec<String>> for CommandLine {
    type Error = String;

    fn try_from(mut argv: Vec<String>) -> Result<Self, Self::Error> {
        if argv.is_empty() || argv[0].trim().is_empty() {
            return Err("command must name a program".to_string());
        }
        let program = argv.remove(0);
        Ok(Self {
            program,
            args: argv,
        })
    }
}

impl From<CommandLine> for Vec<String> {
    fn from(command: CommandLine) -> Self {
        std::iter::once(command.program)
            .chain(command.args)
            .collect()
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Outcome of one command. `ok` iff exit code 0 and no timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandResult {
    fn spawn_failed(command: &CommandLine, error: &std::io::Error) -> Self {
        Self {
            ok: false,
            exit_code: None,
            stdout: String::new(),
            stderr: format!("failed to spawn `{command}`: {error}"),
            timed_out: false,
        }
    }
}

/// Deadline and output caps for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecLimits {
    pub timeout: Duration,
    /// Per stream
    pub max_output_bytes: usize,
    /// How long to wait for the OS to reap a killed process
    pub kill_grace: Duration,
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_output_bytes: 20_000,
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// Byte accumulator that keeps the first `cap` bytes and counts the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBuffer {
    cap: usize,
    data: Vec<u8>,
    dropped: usize,
}

impl OutputBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            data: Vec::new(),
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        let take = room.min(chunk.len());
        self.data.extend_from_slice(&chunk[..take]);
        self.dropped += chunk.len() - take;
    }

    pub fn is_truncated(&self) -> bool {
        self.dropped > 0
    }

    /// Lossy UTF-8 text, with a marker appended when bytes were dropped.
    pub fn into_string(self) -> String {
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        if self.dropped > 0 {
            text.push_str(&format!("\n...[truncated {} bytes]", self.dropped));
        }
        text
    }
}

type SharedBuffer = Arc<Mutex<OutputBuffer>>;

fn lock(buffer: &SharedBuffer) -> MutexGuard<'_, OutputBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reads `reader` to EOF, pushing every chunk into `sink` as it arrives.
async fn drain<R: AsyncRead + Unpin>(mut reader: R, sink: SharedBuffer) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            // Keep reading past the cap so the child never blocks on a full pipe
            Ok(n) => {
                lock(&sink).push(&chunk[..n]);
            }
            Err(e) => {
                tracing::debug!(error = %e, "output stream read failed");
                break;
            }
        }
    }
}

/// One captured stream. The buffer outlives the reader task, so output
/// read before an abort is kept.
struct Capture {
    buffer: SharedBuffer,
    task: JoinHandle<()>,
}

impl Capture {
    fn spawn<R>(reader: Option<R>, cap: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(OutputBuffer::new(cap)));
        let sink = Arc::clone(&buffer);
        let task = tokio::spawn(async move {
            if let Some(reader) = reader {
                drain(reader, sink).await;
            }
        });
        Self { buffer, task }
    }

    /// Waits for EOF until `deadline`. False if something still holds the pipe.
    async fn closed_by(&mut self, deadline: tokio::time::Instant) -> bool {
        match tokio::time::timeout_at(deadline, &mut self.task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "output reader task failed");
                true
            }
            Err(_) => false,
        }
    }

    fn into_string(self) -> String {
        self.task.abort();
        let buffer = std::mem::replace(&mut *lock(&self.buffer), OutputBuffer::new(0));
        buffer.into_string()
    }
}

/// SIGKILL the process group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; a vanished group yields ESRCH
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        tracing::debug!(error = %std::io::Error::last_os_error(), pgid, "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// Runs one command in a working directory.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &CommandLine, cwd: &Path, limits: &ExecLimits)
        -> CommandResult;
}

/// [`CommandExecutor`] on `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioExecutor;

#[async_trait]
impl CommandExecutor for TokioExecutor {
    async fn execute(
        &self,
        command: &CommandLine,
        cwd: &Path,
        limits: &ExecLimits,
    ) -> CommandResult {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout can take down every descendant
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::debug!(%command, error = %e, "spawn failed");
                return CommandResult::spawn_failed(command, &e);
            }
        };

        let pid = child.id();
        let mut stdout = Capture::spawn(child.stdout.take(), limits.max_output_bytes);
        let mut stderr = Capture::spawn(child.stderr.take(), limits.max_output_bytes);
        let started = Instant::now();

        let (status, timed_out) = match tokio::time::timeout(limits.timeout, child.wait()).await {
            Ok(Ok(status)) => (Some(status), false),
            Ok(Err(e)) => {
                tracing::warn!(%command, error = %e, "failed to wait for command");
                (None, false)
            }
            Err(_) => {
                tracing::warn!(%command, timeout_ms = limits.timeout.as_millis() as u64, "command timed out, killing");
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                if let Err(e) = child.start_kill() {
                    tracing::debug!(error = %e, "kill failed (already exited?)");
                }
                let reaped = tokio::time::timeout(limits.kill_grace, child.wait()).await;
                (reaped.ok().and_then(Result::ok), true)
            }
        };

        let deadline = tokio::time::Instant::now() + limits.kill_grace;
        let (stdout_closed, stderr_closed) =
            tokio::join!(stdout.closed_by(deadline), stderr.closed_by(deadline));
        if !(stdout_closed && stderr_closed) {
            // A descendant outlived the child and still holds a pipe
            tracing::debug!(%command, "output still open after exit, killing process group");
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
        }
        let stdout = stdout.into_string();
        let stderr = stderr.into_string();

        let exit_code = if timed_out {
            None
        } else {
            status.and_then(|s| s.code())
        };
        tracing::debug!(
            %command,
            ?exit_code,
            timed_out,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "command finished"
        );

        CommandResult {
            ok: exit_code == Some(0) && !timed_out,
            exit_code,
            stdout,
            stderr,
            timed_out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_buffer_under_cap() {
        let mut buffer = OutputBuffer::new(10);
        buffer.push(b"hello");
        assert!(!buffer.is_truncated());
        assert_eq!(buffer.into_string(), "hello");
    }

    #[test]
    fn test_output_buffer_truncates_across_chunks() {
        let mut buffer = OutputBuffer::new(8);
        buffer.push(b"12345");
        buffer.push(b"67890");
        buffer.push(b"abc");
        assert!(buffer.is_truncated());
        assert_eq!(buffer.into_string(), "12345678\n...[truncated 5 bytes]");
    }

    #[test]
    fn test_output_buffer_zero_cap() {
        let mut buffer = OutputBuffer::new(0);
        buffer.push(b"x");
        assert_eq!(buffer.into_string(), "\n...[truncated 1 bytes]");
    }

    #[test]
    fn test_command_line_argv_roundtrip() {
        let command: CommandLine =
            serde_json::from_str(r#"["cargo", "test", "--quiet"]"#).unwrap();
        assert_eq!(command, CommandLine::new("cargo", ["test", "--quiet"]));
        assert_eq!(command.to_string(), "cargo test --quiet");
        assert!(serde_json::from_str::<CommandLine>("[]").is_err());
    }

    #[tokio::test]
    async fn test_drain_reads_everything() {
        let data = vec![b'x'; 50_000];
        let sink = Arc::new(Mutex::new(OutputBuffer::new(100)));
        drain(&data[..], Arc::clone(&sink)).await;
        let buffer = lock(&sink).clone();
        assert!(buffer.is_truncated());
        assert!(buffer.into_string().ends_with("[truncated 49900 bytes]"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_captures_exit_and_streams() {
        let dir = tempfile::tempdir().unwrap();
        let result = TokioExecutor
            .execute(
                &CommandLine::shell("echo out; echo err >&2; exit 3"),
                dir.path(),
                &ExecLimits::default(),
            )
            .await;
        assert!(!result.ok);
        assert!(!result.timed_out);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_runs_in_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let result = TokioExecutor
            .execute(
                &CommandLine::new("cat", ["marker.txt"]),
                dir.path(),
                &ExecLimits::default(),
            )
            .await;
        assert!(result.ok);
        assert_eq!(result.stdout, "here");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_times_out_and_kills() {
        let dir = tempfile::tempdir().unwrap();
        let limits = ExecLimits {
            timeout: Duration::from_millis(100),
            max_output_bytes: 1024,
            kill_grace: Duration::from_millis(500),
        };
        let started = Instant::now();
        let result = TokioExecutor
            .execute(&CommandLine::new("sleep", ["5"]), dir.path(), &limits)
            .await;
        assert!(result.timed_out);
        assert!(!result.ok);
        assert_eq!(result.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_execute_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let result = TokioExecutor
            .execute(
                &CommandLine::new("definitely-not-a-real-program-xyz", Vec::<String>::new()),
                dir.path(),
                &ExecLimits::default(),
            )
            .await;
        assert!(!result.ok);
        assert_eq!(result.exit_code, None);
        assert!(result.stderr.contains("failed to spawn"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_truncates_large_output() {
        let dir = tempfile::tempdir().unwrap();
        let limits = ExecLimits {
            max_output_bytes: 100,
            ..ExecLimits::default()
        };
        let result = TokioExecutor
            .execute(
                &CommandLine::shell("head -c 100000 /dev/zero | tr '\\0' 'a'"),
                dir.path(),
                &limits,
            )
            .await;
        assert!(result.ok);
        assert!(result.stdout.starts_with(&"a".repeat(100)));
        assert!(result.stdout.ends_with("[truncated 99900 bytes]"));
    }

    fn short_limits() -> ExecLimits {
        ExecLimits {
            timeout: Duration::from_millis(300),
            max_output_bytes: 1024,
            kill_grace: Duration::from_millis(300),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_keeps_output_read_so_far() {
        let dir = tempfile::tempdir().unwrap();
        let result = TokioExecutor
            .execute(
                &CommandLine::shell("echo before; echo oops >&2; sleep 5; echo after"),
                dir.path(),
                &short_limits(),
            )
            .await;
        assert!(result.timed_out);
        assert_eq!(result.stdout, "before\n");
        assert_eq!(result.stderr, "oops\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_descendant_does_not_lose_output() {
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();
        let result = TokioExecutor
            .execute(
                &CommandLine::shell("echo hello; (sleep 5 &)"),
                dir.path(),
                &short_limits(),
            )
            .await;
        assert!(result.ok);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "hello\n");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let result = TokioExecutor
            .execute(
                &CommandLine::shell("sh -c 'sleep 1; touch survivor'; echo done"),
                dir.path(),
                &short_limits(),
            )
            .await;
        assert!(result.timed_out);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("survivor").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_overshoot_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let limits = ExecLimits {
            kill_grace: Duration::from_millis(500),
            ..short_limits()
        };
        let started = Instant::now();
        let result = TokioExecutor
            .execute(
                &CommandLine::shell("sleep 5 & sleep 5 >&2 & wait"),
                dir.path(),
                &limits,
            )
            .await;
        assert!(result.timed_out);
        assert!(started.elapsed() < Duration::from_millis(1500));
    }
}
