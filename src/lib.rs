//! Azure CLI MCP Gateway Library
//!
//! Exposes the Azure CLI to MCP clients as a tool: commands are validated
//! against a policy, run under a shared authenticated session, and returned
//! as structured results.

pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod mcp;
pub mod metrics;
pub mod metrics_server;
pub mod tools;

pub use error::{AuthError, ErrorKind, ToolError};
pub use gateway::{CommandRequest, ToolGateway, ToolOutcome, ToolResponse};
