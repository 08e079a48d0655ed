//! Execution Timeout Management
//!
//! This module picks the effective timeout for a call and bounds futures by it.

use std::time::Duration;
use tokio::time;

/// Returned when a future outlives its timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation timed out after {0:?}")]
pub struct TimedOut(pub Duration);

/// Execution timeout configuration
///
/// Timeouts are enforced to prevent commands from hanging indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionTimeout {
    /// The timeout duration
    duration: Duration,
}

impl Default for ExecutionTimeout {
    fn default() -> Self {
        Self::from_secs(300)
    }
}

impl ExecutionTimeout {
    /// Create a new execution timeout
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use azure_cli_mcp::tools::ExecutionTimeout;
    ///
    /// let timeout = ExecutionTimeout::new(Duration::from_secs(30));
    /// assert_eq!(timeout.duration(), Duration::from_secs(30));
    /// ```
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    /// Create a timeout from seconds
    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Resolve a per-call override against the configured default and cap
    ///
    /// A missing or zero override selects `default`; anything above `max` is
    /// clamped to `max`.
    pub fn resolve(requested: Option<Duration>, default: Duration, max: Duration) -> Self {
        let duration = match requested {
            Some(d) if !d.is_zero() => d.min(max),
            _ => default.min(max),
        };
        Self::new(duration)
    }

    /// Get the timeout duration
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Execute a future with a timeout
    ///
    /// Returns the future's output if it completes before the timeout.
    pub async fn run<F>(&self, future: F) -> Result<F::Output, TimedOut>
    where
        F: std::future::Future,
    {
        time::timeout(self.duration, future)
            .await
            .map_err(|_| TimedOut(self.duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_default() {
        assert_eq!(ExecutionTimeout::default().duration(), Duration::from_secs(300));
    }

    #[test]
    fn test_resolve_uses_default_without_override() {
        let t = ExecutionTimeout::resolve(None, Duration::from_secs(60), Duration::from_secs(3600));
        assert_eq!(t.duration(), Duration::from_secs(60));

        let t = ExecutionTimeout::resolve(
            Some(Duration::ZERO),
            Duration::from_secs(60),
            Duration::from_secs(3600),
        );
        assert_eq!(t.duration(), Duration::from_secs(60));
    }

    #[test]
    fn test_resolve_override_and_clamp() {
        let t = ExecutionTimeout::resolve(
            Some(Duration::from_secs(5)),
            Duration::from_secs(60),
            Duration::from_secs(3600),
        );
        assert_eq!(t.duration(), Duration::from_secs(5));

        let t = ExecutionTimeout::resolve(
            Some(Duration::from_secs(10_000)),
            Duration::from_secs(60),
            Duration::from_secs(3600),
        );
        assert_eq!(t.duration(), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_timeout_run_success() {
        let result = ExecutionTimeout::from_secs(1).run(async { 42 }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_timeout_run_timeout() {
        let timeout = ExecutionTimeout::new(Duration::from_millis(50));
        let result = timeout
            .run(tokio::time::sleep(Duration::from_secs(2)))
            .await;
        assert_eq!(result, Err(TimedOut(Duration::from_millis(50))));
        assert!(result.unwrap_err().to_string().contains("timed out"));
    }
}
