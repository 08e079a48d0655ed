//! Process Executor
//!
//! Spawns the wrapped CLI as a child process with discrete argument tokens
//! (never through a shell), captures stdout and stderr up to a byte bound,
//! and enforces a wall-clock timeout by killing the whole process group.
//!
//! There are no retries: cloud operations are not idempotent, so a failed
//! command is reported as-is.

use crate::config::Config;
use crate::error::ErrorKind;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Default maximum output size per stream in bytes (1MB)
const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// How long to wait for output pipes to drain after the process exits
const READER_GRACE: Duration = Duration::from_secs(2);

/// Result of one CLI invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    /// Exit code 0 and no fatal stderr pattern
    Success {
        stdout: String,
        stderr: String,
        exit_code: i32,
    },

    /// Anything else
    Failure {
        kind: ErrorKind,
        message: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

impl ExecutionResult {
    /// Create a success result
    pub fn success(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::Success {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code: 0,
        }
    }

    /// Create a failure result with no captured output
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Create a `CommandError` result for a non-zero exit
    pub fn command_error(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        let stderr = stderr.into();
        Self::Failure {
            kind: ErrorKind::CommandError,
            message: failure_message(Some(exit_code), &stderr),
            exit_code: Some(exit_code),
            stdout: stdout.into(),
            stderr,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Failure kind, `None` on success
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }

    pub fn stdout(&self) -> &str {
        match self {
            Self::Success { stdout, .. } | Self::Failure { stdout, .. } => stdout,
        }
    }

    pub fn stderr(&self) -> &str {
        match self {
            Self::Success { stderr, .. } | Self::Failure { stderr, .. } => stderr,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Success { exit_code, .. } => Some(*exit_code),
            Self::Failure { exit_code, .. } => *exit_code,
        }
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        match self {
            Self::Success { stdout, .. } => format!("Success ({} bytes output)", stdout.len()),
            Self::Failure {
                kind, exit_code, ..
            } => format!("{} (exit code: {:?})", kind, exit_code),
        }
    }
}

fn failure_message(exit_code: Option<i32>, stderr: &str) -> String {
    let headline = stderr
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.chars().take(300).collect::<String>());
    match (exit_code, headline) {
        (Some(code), Some(line)) => format!("command failed with exit code {}: {}", code, line),
        (Some(code), None) => format!("command failed with exit code {}", code),
        (None, _) => "command was terminated by a signal".to_string(),
    }
}

/// Regexes that mark a zero-exit run as failed when they match stderr
#[derive(Debug, Clone, Default)]
pub struct OutputInspector {
    patterns: Vec<Regex>,
}

impl OutputInspector {
    /// Compile the given patterns, failing on the first invalid one
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// The first stderr line containing a fatal match
    pub fn fatal_line<'a>(&self, stderr: &'a str) -> Option<&'a str> {
        let m = self.patterns.iter().find_map(|re| re.find(stderr))?;
        let start = stderr[..m.start()].rfind('\n').map_or(0, |i| i + 1);
        let end = stderr[m.start()..]
            .find('\n')
            .map_or(stderr.len(), |i| m.start() + i);
        Some(&stderr[start..end])
    }
}

/// Seam between the gateway/auth manager and process spawning
///
/// `ProcessExecutor` is the production implementation; tests substitute
/// scripted runners.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the CLI with `args`, bounded by `timeout`
    async fn run(&self, args: &[String], timeout: Duration) -> ExecutionResult;

    /// Like `run`, additionally forwarding each output line as it arrives
    async fn run_streaming(
        &self,
        args: &[String],
        timeout: Duration,
        lines: mpsc::UnboundedSender<String>,
    ) -> ExecutionResult {
        let result = self.run(args, timeout).await;
        for line in result.stdout().lines().chain(result.stderr().lines()) {
            let _ = lines.send(line.to_string());
        }
        result
    }
}

/// Executor for the wrapped CLI binary
///
/// # Security
///
/// 1. Uses `tokio::process::Command` with an argument list, no shell
/// 2. stdin is closed; the child cannot prompt
/// 3. The child leads its own process group so a timeout kills descendants
/// 4. Output is bounded to prevent memory exhaustion
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    binary: String,
    env: BTreeMap<String, String>,
    max_output_bytes: usize,
    inspector: OutputInspector,
}

impl ProcessExecutor {
    /// Create an executor for `binary` with default limits
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            env: BTreeMap::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            inspector: OutputInspector::default(),
        }
    }

    /// Create an executor from the loaded configuration
    pub fn from_config(config: &Config) -> Result<Self, regex::Error> {
        Ok(Self {
            binary: config.cli.binary.clone(),
            env: config.cli.env.clone(),
            max_output_bytes: config.execution.max_output_bytes,
            inspector: OutputInspector::new(&config.execution.fatal_stderr_patterns)?,
        })
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_inspector(mut self, inspector: OutputInspector) -> Self {
        self.inspector = inspector;
        self
    }

    async fn execute(
        &self,
        args: &[String],
        timeout: Duration,
        lines: Option<mpsc::UnboundedSender<String>>,
    ) -> ExecutionResult {
        let start = Instant::now();
        debug!(binary = %self.binary, arg_count = args.len(), "Spawning CLI process");

        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(binary = %self.binary, "Failed to spawn CLI process: {}", e);
                return ExecutionResult::failure(
                    ErrorKind::ExecutionSetupError,
                    format!("failed to spawn '{}': {}", self.binary, e),
                );
            }
        };

        let pid = child.id();
        let stdout_task = tokio::spawn(capture_stream(
            child.stdout.take(),
            self.max_output_bytes,
            lines.clone(),
        ));
        let stderr_task = tokio::spawn(capture_stream(
            child.stderr.take(),
            self.max_output_bytes,
            lines,
        ));

        let status = match time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                terminate_tree(&mut child, pid).await;
                stdout_task.abort();
                stderr_task.abort();
                return ExecutionResult::failure(
                    ErrorKind::ExecutionSetupError,
                    format!("failed to wait for '{}': {}", self.binary, e),
                );
            }
            Err(_) => {
                warn!(pid = ?pid, "CLI command timed out after {:?}, terminating process tree", timeout);
                terminate_tree(&mut child, pid).await;
                let stdout = collect_output(stdout_task, pid).await.render();
                let stderr = collect_output(stderr_task, pid).await.render();
                return ExecutionResult::Failure {
                    kind: ErrorKind::Timeout,
                    message: format!(
                        "command timed out after {}s and was terminated",
                        timeout.as_secs_f64()
                    ),
                    exit_code: None,
                    stdout,
                    stderr,
                };
            }
        };

        let stdout = collect_output(stdout_task, pid).await.render();
        let stderr = collect_output(stderr_task, pid).await.render();

        let result = match status.code() {
            Some(0) => match self.inspector.fatal_line(&stderr) {
                Some(line) => ExecutionResult::Failure {
                    kind: ErrorKind::CommandError,
                    message: format!("command reported an error: {}", line.trim()),
                    exit_code: Some(0),
                    stdout,
                    stderr,
                },
                None => ExecutionResult::success(stdout, stderr),
            },
            Some(code) => ExecutionResult::command_error(code, stdout, stderr),
            None => ExecutionResult::Failure {
                kind: ErrorKind::CommandError,
                message: failure_message(None, &stderr),
                exit_code: None,
                stdout,
                stderr,
            },
        };

        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "CLI command finished: {}",
            result.summary()
        );
        result
    }
}

#[async_trait]
impl CommandRunner for ProcessExecutor {
    async fn run(&self, args: &[String], timeout: Duration) -> ExecutionResult {
        self.execute(args, timeout, None).await
    }

    async fn run_streaming(
        &self,
        args: &[String],
        timeout: Duration,
        lines: mpsc::UnboundedSender<String>,
    ) -> ExecutionResult {
        self.execute(args, timeout, Some(lines)).await
    }
}

/// Bounded capture of one output stream
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    total: usize,
}

impl Captured {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        self.total += chunk.len();
        let room = limit.saturating_sub(self.bytes.len());
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    /// Decode, appending a marker when bytes were dropped
    fn render(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        let dropped = self.total - self.bytes.len();
        if dropped > 0 {
            text.push_str(&format!("\n...[truncated {} bytes]", dropped));
        }
        text
    }
}

/// Read a stream to EOF, keeping at most `limit` bytes
///
/// Bytes past the limit are still drained so the child never blocks on a
/// full pipe.
async fn capture_stream<R>(
    reader: Option<R>,
    limit: usize,
    lines: Option<mpsc::UnboundedSender<String>>,
) -> Captured
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured::default();
    let Some(reader) = reader else {
        return captured;
    };
    let mut reader = BufReader::new(reader);

    match lines {
        Some(tx) => {
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        captured.push(&line, limit);
                        let _ = tx.send(String::from_utf8_lossy(&line).trim_end().to_string());
                    }
                    Err(e) => {
                        debug!("Output stream read failed: {}", e);
                        break;
                    }
                }
            }
        }
        None => {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => captured.push(&buf[..n], limit),
                    Err(e) => {
                        debug!("Output stream read failed: {}", e);
                        break;
                    }
                }
            }
        }
    }
    captured
}

/// Wait for a capture task, killing lingering descendants that hold the pipe
async fn collect_output(mut task: JoinHandle<Captured>, pid: Option<u32>) -> Captured {
    if let Ok(joined) = time::timeout(READER_GRACE, &mut task).await {
        return joined.unwrap_or_default();
    }
    debug!(pid = ?pid, "Output pipe still open after exit, killing process group");
    kill_process_group(pid);
    match time::timeout(READER_GRACE, &mut task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            task.abort();
            Captured::default()
        }
    }
}

/// Kill the child and its process group, then reap it
async fn terminate_tree(child: &mut Child, pid: Option<u32>) {
    kill_process_group(pid);
    if let Err(e) = child.kill().await {
        debug!("Child kill after group kill failed: {}", e);
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // The child was spawned with process_group(0), so its pgid is its pid
        let result = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if result == -1 {
            debug!(
                "killpg({}) failed: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_execute_echo() {
        let executor = ProcessExecutor::new("echo");
        let result = executor
            .run(&args(&["hello", "world"]), Duration::from_secs(5))
            .await;

        assert!(result.is_success());
        assert_eq!(result.exit_code(), Some(0));
        assert_eq!(result.stdout(), "hello world\n");
    }

    #[tokio::test]
    async fn test_arguments_are_not_shell_interpreted() {
        let executor = ProcessExecutor::new("echo");
        let result = executor
            .run(&args(&["$HOME; whoami"]), Duration::from_secs(5))
            .await;
        assert_eq!(result.stdout(), "$HOME; whoami\n");
    }

    #[tokio::test]
    async fn test_execute_failing_command() {
        let executor = ProcessExecutor::new("false");
        let result = executor.run(&[], Duration::from_secs(5)).await;

        assert_eq!(result.kind(), Some(ErrorKind::CommandError));
        assert_eq!(result.exit_code(), Some(1));
    }

    #[tokio::test]
    async fn test_nonzero_exit_message_includes_stderr() {
        let executor = ProcessExecutor::new("sh");
        let result = executor
            .run(
                &args(&["-c", "echo 'ERROR: resource group not found' >&2; exit 3"]),
                Duration::from_secs(5),
            )
            .await;

        match result {
            ExecutionResult::Failure {
                kind,
                message,
                exit_code,
                stderr,
                ..
            } => {
                assert_eq!(kind, ErrorKind::CommandError);
                assert_eq!(exit_code, Some(3));
                assert!(message.contains("exit code 3"));
                assert!(message.contains("resource group not found"));
                assert!(stderr.contains("resource group not found"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nonexistent_binary_is_setup_error() {
        let executor = ProcessExecutor::new("this-command-does-not-exist-12345");
        let result = executor.run(&[], Duration::from_secs(5)).await;

        assert_eq!(result.kind(), Some(ErrorKind::ExecutionSetupError));
        assert!(result.exit_code().is_none());
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let executor = ProcessExecutor::new("sleep");
        let start = Instant::now();
        let result = executor.run(&args(&["10"]), Duration::from_secs(1)).await;

        assert_eq!(result.kind(), Some(ErrorKind::Timeout));
        assert!(result.exit_code().is_none());
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_timeout_kills_whole_process_tree() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = format!("sleep 2 && touch {}", marker.display());

        let executor = ProcessExecutor::new("sh");
        let result = executor
            .run(&args(&["-c", &script]), Duration::from_millis(500))
            .await;
        assert_eq!(result.kind(), Some(ErrorKind::Timeout));

        // The grandchild would have created the marker by now if it survived
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_output_truncation() {
        let executor = ProcessExecutor::new("seq").with_max_output_bytes(100);
        let result = executor.run(&args(&["1000"]), Duration::from_secs(5)).await;

        assert!(result.is_success());
        let stdout = result.stdout();
        assert!(stdout.contains("...[truncated"));
        let (kept, _) = stdout.split_once("\n...[truncated").unwrap();
        assert_eq!(kept.len(), 100);
    }

    #[tokio::test]
    async fn test_fatal_stderr_pattern_on_zero_exit() {
        let inspector = OutputInspector::new(&["(?m)^ERROR:"]).unwrap();
        let executor = ProcessExecutor::new("sh").with_inspector(inspector);

        let result = executor
            .run(&args(&["-c", "echo '[]'; echo 'ERROR: partial failure' >&2"]), Duration::from_secs(5))
            .await;
        assert_eq!(result.kind(), Some(ErrorKind::CommandError));
        assert_eq!(result.exit_code(), Some(0));

        let result = executor
            .run(&args(&["-c", "echo '[]'; echo 'WARNING: preview command' >&2"]), Duration::from_secs(5))
            .await;
        assert!(result.is_success());
        assert!(result.stderr().contains("WARNING"));
    }

    #[tokio::test]
    async fn test_environment_is_applied() {
        let executor = ProcessExecutor::new("sh").with_env("AZURE_CORE_NO_COLOR", "true");
        let result = executor
            .run(&args(&["-c", "printf %s \"$AZURE_CORE_NO_COLOR\""]), Duration::from_secs(5))
            .await;
        assert_eq!(result.stdout(), "true");
    }

    #[tokio::test]
    async fn test_streaming_forwards_lines() {
        let executor = ProcessExecutor::new("sh");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = executor
            .run_streaming(
                &args(&["-c", "echo first; echo second >&2"]),
                Duration::from_secs(5),
                tx,
            )
            .await;
        assert!(result.is_success());

        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines.sort();
        assert_eq!(lines, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_inspector_reports_matching_line() {
        let inspector = OutputInspector::new(&["(?m)^ERROR:"]).unwrap();
        let stderr = "WARNING: x\nERROR: bad thing\ntrailer";
        assert_eq!(inspector.fatal_line(stderr), Some("ERROR: bad thing"));
        assert_eq!(inspector.fatal_line("all good"), None);
        assert!(OutputInspector::new(&["(bad"]).is_err());
    }

    #[test]
    fn test_execution_result_serialization() {
        let json = serde_json::to_value(ExecutionResult::success("[]", "")).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["exit_code"], 0);

        let json =
            serde_json::to_value(ExecutionResult::failure(ErrorKind::Timeout, "too slow")).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["kind"], "timeout");
    }
}
