//! CLI Execution Subsystem
//!
//! This module turns an untrusted command string into a vetted argument list
//! and runs it against the wrapped CLI binary.
//!
//! # Security Features
//!
//! - **Metacharacter Rejection**: shell control characters fail validation outright
//! - **List Invocation**: Commands are executed as argument lists, never through a shell
//! - **Policy Patterns**: allow, deny (confirmation) and forbidden lists are matched on tokens
//! - **Timeout Enforcement**: Every execution is bounded and the process tree is killed on expiry
//! - **Resource Limits**: Captured output is bounded per stream
//!
//! # Architecture
//!
//! - `validator.rs`: Command tokenizing and policy checks
//! - `executor.rs`: Subprocess execution with bounded capture
//! - `timeout.rs`: Timeout resolution and enforcement
//!
//! # Example
//!
//! ```no_run
//! use azure_cli_mcp::config::PolicyConfig;
//! use azure_cli_mcp::tools::{CommandPolicy, CommandRunner, CommandValidator, ProcessExecutor, ValidationVerdict};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let policy = CommandPolicy::from_config(&PolicyConfig::default())?;
//!     let validator = CommandValidator::new(policy, "az");
//!
//!     if let ValidationVerdict::Allowed(command) = validator.validate("group list", false) {
//!         let result = ProcessExecutor::new("az")
//!             .run(&command.args, Duration::from_secs(60))
//!             .await;
//!         println!("{}", result.summary());
//!     }
//!     Ok(())
//! }
//! ```

mod executor;
mod timeout;
mod validator;

pub use executor::{CommandRunner, ExecutionResult, OutputInspector, ProcessExecutor};
pub use timeout::{ExecutionTimeout, TimedOut};
pub use validator::{
    CommandAction, CommandPattern, CommandPolicy, CommandValidator, PolicyError, SafeCommand,
    ValidationVerdict,
};
