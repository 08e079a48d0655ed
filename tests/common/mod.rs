//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use azure_cli_mcp::auth::AuthSessionManager;
use azure_cli_mcp::config::PolicyConfig;
use azure_cli_mcp::gateway::ToolGateway;
use azure_cli_mcp::tools::{CommandPolicy, CommandRunner, CommandValidator, ExecutionResult};
use azure_cli_mcp::ErrorKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const VALID_TOKEN: &str =
    r#"{"accessToken": "redacted", "expires_on": 4102444800, "subscription": "sub-test", "tenant": "tenant-test"}"#;

pub const DEVICE_PROMPT: &str = "To sign in, use a web browser to open the page https://microsoft.com/devicelogin and enter the code QWERTY12 to authenticate.";

type Handler = Box<dyn Fn(&[String]) -> ExecutionResult + Send + Sync>;

/// Scripted CLI that records every invocation
pub struct StubCli {
    handler: Handler,
    command_delay: Duration,
    login_delay: Duration,
    login_prompt: Option<&'static str>,
    calls: Mutex<Vec<Vec<String>>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl StubCli {
    pub fn new(handler: impl Fn(&[String]) -> ExecutionResult + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            command_delay: Duration::ZERO,
            login_delay: Duration::ZERO,
            login_prompt: None,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Already logged in; other commands echo their arguments
    pub fn authenticated() -> Self {
        Self::new(|args| {
            if is_probe(args) {
                ExecutionResult::success(VALID_TOKEN, "")
            } else {
                ExecutionResult::success(args.join(" "), "")
            }
        })
    }

    /// Not logged in; device-code login succeeds
    pub fn logged_out() -> Self {
        Self::new(|args| {
            if is_probe(args) {
                ExecutionResult::command_error(1, "", "ERROR: Please run 'az login' to setup account.")
            } else if args.first().map(String::as_str) == Some("login") {
                ExecutionResult::success(r#"[{"id": "sub-login", "isDefault": true}]"#, "")
            } else {
                ExecutionResult::success(args.join(" "), "")
            }
        })
    }

    pub fn with_command_delay(mut self, delay: Duration) -> Self {
        self.command_delay = delay;
        self
    }

    pub fn with_login(mut self, prompt: &'static str, delay: Duration) -> Self {
        self.login_prompt = Some(prompt);
        self.login_delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Invocations other than credential probes and logins
    pub fn command_calls(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|args| !is_probe(args) && args.first().map(String::as_str) != Some("login"))
            .collect()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub fn is_probe(args: &[String]) -> bool {
    args.len() >= 2 && args[0] == "account" && args[1] == "get-access-token"
}

#[async_trait]
impl CommandRunner for StubCli {
    async fn run(&self, args: &[String], timeout: Duration) -> ExecutionResult {
        self.calls.lock().unwrap().push(args.to_vec());

        let delay = if is_probe(args) {
            Duration::ZERO
        } else if args.first().map(String::as_str) == Some("login") {
            self.login_delay
        } else {
            self.command_delay
        };

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let result = if delay > timeout {
            tokio::time::sleep(timeout).await;
            ExecutionResult::failure(ErrorKind::Timeout, "timed out")
        } else {
            tokio::time::sleep(delay).await;
            (self.handler)(args)
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn run_streaming(
        &self,
        args: &[String],
        timeout: Duration,
        lines: mpsc::UnboundedSender<String>,
    ) -> ExecutionResult {
        if let Some(prompt) = self.login_prompt {
            let _ = lines.send(prompt.to_string());
        }
        self.run(args, timeout).await
    }
}

/// Gateway over a stub CLI with short timeouts
pub fn gateway(cli: Arc<StubCli>, policy: PolicyConfig) -> ToolGateway {
    let policy = CommandPolicy::from_config(&policy).unwrap();
    let validator = CommandValidator::new(policy, "az");
    let runner: Arc<dyn CommandRunner> = cli;
    let auth = AuthSessionManager::new(runner.clone(), Duration::from_secs(1));
    ToolGateway::new(validator, auth, runner).with_timeouts(
        Duration::from_secs(10),
        Duration::from_secs(60),
        Duration::from_secs(5),
    )
}

/// In-memory JSON log sink for asserting on audit events
#[derive(Clone, Default)]
pub struct AuditLog(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for AuditLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl AuditLog {
    /// Route events on this thread here until the guard drops
    ///
    /// Tasks spawned on a current-thread runtime are covered too.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::INFO)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    /// Events logged on the `audit` target, oldest first
    pub fn events(&self) -> Vec<serde_json::Value> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
            .filter(|event| event["target"] == "audit")
            .collect()
    }
}
