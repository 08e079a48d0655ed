//! Tool Gateway
//!
//! Entry point for one tool invocation: validate, authenticate, execute,
//! and shape the structured response. Validation always runs first, so a
//! rejected command never triggers a login or spawns a process.

use crate::audit;
use crate::auth::{is_auth_expired, AuthOutcome, AuthSession, AuthSessionManager, DeviceCodeChallenge};
use crate::config::Config;
use crate::error::{ErrorKind, ToolError};
use crate::metrics;
use crate::tools::{
    CommandAction, CommandPolicy, CommandRunner, CommandValidator, ExecutionResult,
    ExecutionTimeout, ProcessExecutor, ValidationVerdict,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// One command invocation from a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Correlation id, echoed in the response and audit log
    pub request_id: String,

    /// Raw command text, with or without the binary name
    pub command: String,

    /// Per-call timeout override
    pub timeout: Option<Duration>,

    /// Explicit confirmation for destructive commands
    pub confirm: bool,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            command: command.into(),
            timeout: None,
            confirm: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn confirmed(mut self) -> Self {
        self.confirm = true;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Build a request from tool-call arguments
    ///
    /// Expects `{"command": str, "timeout_seconds"?: int, "confirm"?: bool,
    /// "request_id"?: str}`.
    pub fn from_arguments(arguments: &Value) -> Result<Self, ToolError> {
        let object = arguments
            .as_object()
            .ok_or_else(|| ToolError::validation("tool arguments must be a JSON object"))?;

        let command = object
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::validation("missing required string argument 'command'"))?;
        let mut request = Self::new(command);

        match object.get("timeout_seconds") {
            None | Some(Value::Null) => {}
            Some(value) => {
                let secs = value.as_u64().filter(|s| *s > 0).ok_or_else(|| {
                    ToolError::validation("'timeout_seconds' must be a positive integer")
                })?;
                request.timeout = Some(Duration::from_secs(secs));
            }
        }

        match object.get("confirm") {
            None | Some(Value::Null) => {}
            Some(Value::Bool(confirm)) => request.confirm = *confirm,
            Some(_) => return Err(ToolError::validation("'confirm' must be a boolean")),
        }

        if let Some(id) = object.get("request_id").and_then(Value::as_str) {
            request.request_id = id.to_string();
        }
        Ok(request)
    }
}

/// What happened to a request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    /// The CLI ran
    Result(ExecutionResult),

    /// The request failed before the CLI ran
    Error(ToolError),

    /// Login is waiting on the user
    AuthPending(DeviceCodeChallenge),

    /// Current session, for login and status requests
    Session(AuthSession),
}

impl ToolOutcome {
    /// Failure classification, `None` when nothing failed
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Result(result) => result.kind(),
            Self::Error(err) => Some(err.kind),
            Self::AuthPending(_) | Self::Session(_) => None,
        }
    }

    /// Label used for metrics and audit records
    pub fn label(&self) -> &'static str {
        match self {
            Self::Result(ExecutionResult::Success { .. }) => "success",
            Self::AuthPending(_) => "auth_pending",
            Self::Session(_) => "session",
            other => other.kind().map_or("unknown", |k| k.as_str()),
        }
    }
}

/// Structured response for one request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolResponse {
    pub request_id: String,
    pub elapsed_ms: u64,

    /// Whether resending the same request may succeed
    #[serde(default)]
    pub retryable: bool,

    pub outcome: ToolOutcome,
}

impl ToolResponse {
    pub fn new(request_id: impl Into<String>, elapsed: Duration, outcome: ToolOutcome) -> Self {
        Self {
            request_id: request_id.into(),
            elapsed_ms: elapsed.as_millis() as u64,
            retryable: outcome.kind().is_some_and(|kind| kind.is_retryable()),
            outcome,
        }
    }

    pub fn is_error(&self) -> bool {
        self.outcome.kind().is_some()
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        self.outcome.kind()
    }

    /// Plain-text rendering for clients that only read text content
    pub fn to_text(&self) -> String {
        match &self.outcome {
            ToolOutcome::Result(ExecutionResult::Success { stdout, stderr, .. }) => {
                if stdout.trim().is_empty() {
                    if stderr.trim().is_empty() {
                        "Command completed successfully with no output.".to_string()
                    } else {
                        stderr.clone()
                    }
                } else {
                    stdout.clone()
                }
            }
            ToolOutcome::Result(ExecutionResult::Failure {
                kind,
                message,
                stderr,
                ..
            }) => {
                if stderr.trim().is_empty() {
                    format!("[{}] {}", kind, message)
                } else {
                    format!("[{}] {}\n\n{}", kind, message, stderr.trim_end())
                }
            }
            ToolOutcome::Error(err) => err.to_string(),
            ToolOutcome::AuthPending(challenge) => format!(
                "Authentication required. {}\n\nOpen {} and enter the code {}, then retry the command.",
                challenge.message, challenge.verification_uri, challenge.user_code
            ),
            ToolOutcome::Session(session) => match &session.account_identifier {
                Some(account) => format!("Authentication status: {} ({})", session.status, account),
                None => format!("Authentication status: {}", session.status),
            },
        }
    }
}

/// Validates, authenticates and executes CLI commands
pub struct ToolGateway {
    validator: CommandValidator,
    auth: AuthSessionManager,
    runner: Arc<dyn CommandRunner>,
    default_timeout: Duration,
    max_timeout: Duration,
    auth_timeout: Duration,
    permits: Arc<Semaphore>,
}

impl ToolGateway {
    /// Create a gateway with default timeouts and concurrency
    pub fn new(
        validator: CommandValidator,
        auth: AuthSessionManager,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let defaults = Config::default();
        Self {
            validator,
            auth,
            runner,
            default_timeout: defaults.execution.command_timeout(),
            max_timeout: defaults.execution.max_timeout(),
            auth_timeout: defaults.auth.auth_timeout(),
            permits: Arc::new(Semaphore::new(defaults.execution.max_concurrent_commands)),
        }
    }

    /// Wire the whole pipeline from configuration
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let policy = CommandPolicy::from_config(&config.policy).context("Invalid command policy")?;
        let validator = CommandValidator::new(policy, &config.cli.binary);
        let runner: Arc<dyn CommandRunner> = Arc::new(
            ProcessExecutor::from_config(config).context("Invalid fatal stderr pattern")?,
        );
        let auth = AuthSessionManager::from_config(config, runner.clone());

        Ok(Self::new(validator, auth, runner)
            .with_timeouts(
                config.execution.command_timeout(),
                config.execution.max_timeout(),
                config.auth.auth_timeout(),
            )
            .with_max_concurrent(config.execution.max_concurrent_commands))
    }

    pub fn with_timeouts(mut self, default: Duration, max: Duration, auth: Duration) -> Self {
        self.default_timeout = default;
        self.max_timeout = max;
        self.auth_timeout = auth;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
        self
    }

    pub fn auth(&self) -> &AuthSessionManager {
        &self.auth
    }

    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        self.runner.clone()
    }

    /// Handle one request end to end
    pub async fn handle(&self, request: CommandRequest) -> ToolResponse {
        let start = Instant::now();
        let outcome = self.dispatch(&request).await;
        finish(request.request_id, &request.command, outcome, start)
    }

    /// Handle raw tool-call arguments
    ///
    /// Arguments that do not form a [`CommandRequest`] are answered with a
    /// validation error and audited like any other request.
    pub async fn handle_arguments(&self, arguments: &Value) -> ToolResponse {
        let start = Instant::now();
        match CommandRequest::from_arguments(arguments) {
            Ok(request) => self.handle(request).await,
            Err(err) => {
                let request_id = arguments
                    .get("request_id")
                    .and_then(Value::as_str)
                    .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);
                let command = arguments
                    .get("command")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                debug!(request_id = %request_id, "Malformed tool arguments: {}", err.message);
                metrics::VALIDATION_REJECTIONS_TOTAL.inc();
                finish(request_id, command, ToolOutcome::Error(err), start)
            }
        }
    }

    /// Report the current session without running anything
    pub fn auth_status(&self, request_id: impl Into<String>) -> ToolResponse {
        ToolResponse::new(
            request_id,
            Duration::ZERO,
            ToolOutcome::Session(self.auth.session()),
        )
    }

    async fn dispatch(&self, request: &CommandRequest) -> ToolOutcome {
        let command = match self.validator.validate(&request.command, request.confirm) {
            ValidationVerdict::Allowed(command) => command,
            ValidationVerdict::Rejected { reason } => {
                debug!(request_id = %request.request_id, "Command rejected: {}", reason);
                metrics::VALIDATION_REJECTIONS_TOTAL.inc();
                return ToolOutcome::Error(ToolError::validation(reason));
            }
        };

        let action = command.action();
        if action == CommandAction::Login {
            info!(request_id = %request.request_id, "Routing login to the managed auth flow");
            return match self.auth.login(self.auth_timeout).await {
                Ok(AuthOutcome::Ready(session)) => ToolOutcome::Session(session),
                Ok(AuthOutcome::Pending(challenge)) => ToolOutcome::AuthPending(challenge),
                Err(e) => ToolOutcome::Error(e.into()),
            };
        }

        if command.requires_auth && action != CommandAction::Logout {
            match self.auth.ensure_authenticated(self.auth_timeout).await {
                Ok(AuthOutcome::Ready(_)) => {}
                Ok(AuthOutcome::Pending(challenge)) => return ToolOutcome::AuthPending(challenge),
                Err(e) => return ToolOutcome::Error(e.into()),
            }
        }

        let timeout =
            ExecutionTimeout::resolve(request.timeout, self.default_timeout, self.max_timeout);
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return ToolOutcome::Error(ToolError::new(
                    ErrorKind::ExecutionSetupError,
                    "command slots are closed",
                ))
            }
        };

        metrics::COMMANDS_IN_FLIGHT.inc();
        let result = self.runner.run(&command.args, timeout.duration()).await;
        metrics::COMMANDS_IN_FLIGHT.dec();

        if !result.is_success() && is_auth_expired(result.stderr()) {
            self.auth.mark_expired();
        }
        if action == CommandAction::Logout && result.is_success() {
            self.auth.reset();
        }
        ToolOutcome::Result(result)
    }
}

/// Audit, count and wrap a finished request
fn finish(request_id: String, command: &str, outcome: ToolOutcome, start: Instant) -> ToolResponse {
    let elapsed = start.elapsed();
    let label = outcome.label();
    let exit_code = match &outcome {
        ToolOutcome::Result(result) => result.exit_code(),
        _ => None,
    };
    audit::record(&request_id, command, label, exit_code, elapsed);
    metrics::COMMANDS_TOTAL.with_label_values(&[label]).inc();
    metrics::COMMAND_DURATION_SECONDS
        .with_label_values(&[label])
        .observe(elapsed.as_secs_f64());

    ToolResponse::new(request_id, elapsed, outcome)
}
