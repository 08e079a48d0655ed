//! Authentication Session Manager
//!
//! Owns the one CLI login shared by every command. At most one login
//! attempt runs at a time; concurrent callers join it through a watch
//! channel and all observe the same device-code challenge and result.

use super::parser::{self, LoginOutcome};
use super::session::{AuthSession, AuthStatus, DeviceCodeChallenge};
use crate::config::{Config, ServiceCredential};
use crate::error::{AuthError, ErrorKind};
use crate::metrics;
use crate::tools::{CommandRunner, ExecutionResult, ExecutionTimeout};
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// What `ensure_authenticated` hands back to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The session is usable
    Ready(AuthSession),

    /// Login is waiting on the user; relay the challenge and retry later
    Pending(DeviceCodeChallenge),
}

#[derive(Debug, Clone)]
enum AttemptState {
    Running,
    Challenge(DeviceCodeChallenge),
    Done(Result<AuthSession, AuthError>),
}

#[derive(Debug)]
struct Inner {
    session: AuthSession,
    attempt: Option<watch::Receiver<AttemptState>>,
}

/// Process-wide authentication manager
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AuthSessionManager {
    runner: Arc<dyn CommandRunner>,
    credential: Option<Arc<ServiceCredential>>,
    probe_timeout: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for AuthSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSessionManager")
            .field("service_principal", &self.credential.is_some())
            .field("probe_timeout", &self.probe_timeout)
            .field("session", &self.session())
            .finish()
    }
}

impl AuthSessionManager {
    /// Create a manager that logs in interactively with device codes
    pub fn new(runner: Arc<dyn CommandRunner>, probe_timeout: Duration) -> Self {
        Self {
            runner,
            credential: None,
            probe_timeout,
            inner: Arc::new(Mutex::new(Inner {
                session: AuthSession::unauthenticated(),
                attempt: None,
            })),
        }
    }

    /// Log in non-interactively with a service principal instead
    pub fn with_service_credential(mut self, credential: ServiceCredential) -> Self {
        self.credential = Some(Arc::new(credential));
        self
    }

    pub fn from_config(config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        let manager = Self::new(runner, config.auth.probe_timeout());
        match &config.auth.service_credential {
            Some(credential) => manager.with_service_credential(credential.clone()),
            None => manager,
        }
    }

    /// Snapshot of the current session
    pub fn session(&self) -> AuthSession {
        self.lock().session.clone()
    }

    pub fn status(&self) -> AuthStatus {
        self.lock().session.status
    }

    /// Make sure a usable session exists, logging in if needed
    ///
    /// Returns immediately when already authenticated and unexpired. When an
    /// attempt is already in flight the caller joins it rather than starting
    /// another.
    pub async fn ensure_authenticated(&self, timeout: Duration) -> Result<AuthOutcome, AuthError> {
        let rx = {
            let mut inner = self.lock();
            if inner.session.is_usable() {
                return Ok(AuthOutcome::Ready(inner.session.clone()));
            }
            if inner.session.status == AuthStatus::Authenticated {
                info!("Session token expired, re-authenticating");
                inner.session.status = AuthStatus::Expired;
            }
            self.join_or_start(&mut inner, timeout, false)
        };
        self.await_attempt(rx, timeout).await
    }

    /// Start a login even if the current session looks valid
    ///
    /// Joins an attempt that is already running.
    pub async fn login(&self, timeout: Duration) -> Result<AuthOutcome, AuthError> {
        let rx = {
            let mut inner = self.lock();
            self.join_or_start(&mut inner, timeout, true)
        };
        self.await_attempt(rx, timeout).await
    }

    /// Record that the CLI reported expired or revoked credentials
    pub fn mark_expired(&self) {
        let mut inner = self.lock();
        if inner.session.status == AuthStatus::Authenticated {
            warn!("CLI reported expired credentials, session marked expired");
            inner.session.status = AuthStatus::Expired;
            metrics::AUTH_STATUS.set(AuthStatus::Expired.as_gauge());
        }
    }

    /// Forget the session after a logout
    pub fn reset(&self) {
        let mut inner = self.lock();
        info!("Session reset");
        inner.session = AuthSession::unauthenticated();
        metrics::AUTH_STATUS.set(AuthStatus::Unauthenticated.as_gauge());
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn join_or_start(
        &self,
        inner: &mut Inner,
        timeout: Duration,
        force: bool,
    ) -> watch::Receiver<AttemptState> {
        if let Some(rx) = &inner.attempt {
            // An error means the attempt task is gone without reporting
            if rx.has_changed().is_ok() {
                debug!("Joining in-flight login attempt");
                return rx.clone();
            }
        }

        let (tx, rx) = watch::channel(AttemptState::Running);
        inner.attempt = Some(rx.clone());
        inner.session.status = AuthStatus::Authenticating;
        metrics::AUTH_STATUS.set(AuthStatus::Authenticating.as_gauge());

        let manager = self.clone();
        tokio::spawn(async move {
            let result = manager.run_attempt(&tx, timeout, force).await;
            manager.finish_attempt(&tx, result);
        });
        rx
    }

    async fn await_attempt(
        &self,
        mut rx: watch::Receiver<AttemptState>,
        timeout: Duration,
    ) -> Result<AuthOutcome, AuthError> {
        // The probe that follows a login gets its own allowance
        let limit = ExecutionTimeout::new(timeout + self.probe_timeout);
        let state = match limit
            .run(rx.wait_for(|s| !matches!(s, AttemptState::Running)))
            .await
        {
            Ok(Ok(state)) => state.clone(),
            Ok(Err(_)) => {
                return Err(AuthError::LoginFailed(
                    "login attempt ended without a result".to_string(),
                ))
            }
            Err(_) => return Err(AuthError::Timeout(timeout.as_secs())),
        };

        match state {
            AttemptState::Challenge(challenge) => Ok(AuthOutcome::Pending(challenge)),
            AttemptState::Done(Ok(session)) => Ok(AuthOutcome::Ready(session)),
            AttemptState::Done(Err(e)) => Err(e),
            AttemptState::Running => Err(AuthError::LoginFailed(
                "login attempt ended without a result".to_string(),
            )),
        }
    }

    async fn run_attempt(
        &self,
        tx: &watch::Sender<AttemptState>,
        timeout: Duration,
        force: bool,
    ) -> Result<AuthSession, AuthError> {
        if let Some(credential) = &self.credential {
            return self.service_principal_login(credential, timeout).await;
        }
        if !force {
            if let Some(session) = self.probe().await {
                info!("Existing CLI credentials are valid");
                return Ok(session);
            }
        }
        self.device_code_login(tx, timeout).await
    }

    fn finish_attempt(&self, tx: &watch::Sender<AttemptState>, result: Result<AuthSession, AuthError>) {
        {
            let mut inner = self.lock();
            inner.session = match &result {
                Ok(session) => session.clone(),
                Err(_) => AuthSession::unauthenticated(),
            };
            inner.attempt = None;
            metrics::AUTH_STATUS.set(inner.session.status.as_gauge());
        }

        let mode = if self.credential.is_some() {
            "service_principal"
        } else {
            "device_code"
        };
        let outcome = match &result {
            Ok(session) => {
                info!(
                    account = session.account_identifier.as_deref().unwrap_or("unknown"),
                    expires_at = ?session.expires_at,
                    "Authentication succeeded"
                );
                "success"
            }
            Err(e) => {
                warn!(kind = %e.kind(), "Authentication failed: {}", e);
                "failure"
            }
        };
        metrics::LOGIN_ATTEMPTS_TOTAL
            .with_label_values(&[mode, outcome])
            .inc();

        tx.send_replace(AttemptState::Done(result));
    }

    /// Check whether the CLI already holds a valid token
    ///
    /// The token itself is parsed away and never logged.
    async fn probe(&self) -> Option<AuthSession> {
        let args = to_args(&["account", "get-access-token", "--output", "json"]);
        let result = self.runner.run(&args, self.probe_timeout).await;
        if !result.is_success() {
            debug!("Credential probe failed: {}", result.summary());
            return None;
        }

        let info = parser::parse_probe_output(result.stdout())?;
        let session = AuthSession::authenticated(info.expires_at, info.account);
        if session.is_expired_at(Utc::now()) {
            debug!("Credential probe returned an expired token");
            return None;
        }
        Some(session)
    }

    async fn service_principal_login(
        &self,
        credential: &ServiceCredential,
        timeout: Duration,
    ) -> Result<AuthSession, AuthError> {
        info!(client_id = %credential.client_id, tenant_id = %credential.tenant_id, "Logging in with service principal");
        let args = vec![
            "login".to_string(),
            "--service-principal".to_string(),
            "--username".to_string(),
            credential.client_id.clone(),
            "--password".to_string(),
            credential.client_secret.clone(),
            "--tenant".to_string(),
            credential.tenant_id.clone(),
            "--output".to_string(),
            "json".to_string(),
        ];

        let result = self.runner.run(&args, timeout).await;
        let account = match result {
            ExecutionResult::Success { stdout, .. } => match parser::parse_login_output(&stdout) {
                LoginOutcome::Success { account } => account,
                _ => None,
            },
            failure => return Err(credential_failure(failure, timeout)),
        };

        let account = match &credential.subscription_id {
            Some(subscription) => {
                let args = to_args(&["account", "set", "--subscription", subscription]);
                let result = self.runner.run(&args, timeout).await;
                if !result.is_success() {
                    return Err(credential_failure(result, timeout));
                }
                Some(subscription.clone())
            }
            None => account,
        };

        Ok(match self.probe().await {
            Some(probed) => AuthSession {
                account_identifier: account.or(probed.account_identifier),
                ..probed
            },
            None => AuthSession::authenticated(None, account),
        })
    }

    async fn device_code_login(
        &self,
        tx: &watch::Sender<AttemptState>,
        timeout: Duration,
    ) -> Result<AuthSession, AuthError> {
        info!("Starting device code login");
        let args = to_args(&["login", "--use-device-code", "--output", "json"]);
        let (line_tx, mut line_rx) = mpsc::unbounded_channel();

        let run = self.runner.run_streaming(&args, timeout, line_tx);
        tokio::pin!(run);

        let mut transcript = String::new();
        let mut published = false;
        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                Some(line) = line_rx.recv() => {
                    if published {
                        continue;
                    }
                    transcript.push_str(&line);
                    transcript.push('\n');
                    if let Some(challenge) = parser::parse_device_code(&transcript) {
                        info!(
                            verification_uri = %challenge.verification_uri,
                            user_code = %challenge.user_code,
                            "Device code issued, waiting for user"
                        );
                        tx.send_replace(AttemptState::Challenge(challenge));
                        published = true;
                    }
                }
            }
        };

        match result {
            ExecutionResult::Success { stdout, .. } => {
                let account = match parser::parse_login_output(&stdout) {
                    LoginOutcome::Success { account } => account,
                    _ => None,
                };
                Ok(match self.probe().await {
                    Some(probed) => AuthSession {
                        account_identifier: probed.account_identifier.or(account),
                        ..probed
                    },
                    None => AuthSession::authenticated(None, account),
                })
            }
            ExecutionResult::Failure {
                kind: ErrorKind::Timeout,
                ..
            } => Err(AuthError::Timeout(timeout.as_secs())),
            ExecutionResult::Failure {
                kind: ErrorKind::ExecutionSetupError,
                message,
                ..
            } => Err(AuthError::Setup(message)),
            ExecutionResult::Failure {
                message, stderr, ..
            } => {
                let reason = match parser::parse_login_output(&stderr) {
                    LoginOutcome::Failed { reason } => reason,
                    _ => message,
                };
                Err(AuthError::LoginFailed(reason))
            }
        }
    }
}

fn credential_failure(result: ExecutionResult, timeout: Duration) -> AuthError {
    match result {
        ExecutionResult::Failure {
            kind: ErrorKind::Timeout,
            ..
        } => AuthError::Timeout(timeout.as_secs()),
        ExecutionResult::Failure {
            kind: ErrorKind::ExecutionSetupError,
            message,
            ..
        } => AuthError::Setup(message),
        ExecutionResult::Failure {
            message, stderr, ..
        } => {
            let reason = match parser::parse_login_output(&stderr) {
                LoginOutcome::Failed { reason } => reason,
                _ => message,
            };
            AuthError::CredentialRejected(reason)
        }
        ExecutionResult::Success { .. } => {
            AuthError::CredentialRejected("unexpected success".to_string())
        }
    }
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}
