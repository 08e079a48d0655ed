//! MCP (Model Context Protocol) Server Implementation
//!
//! Exposes the tool gateway to MCP clients over stdio, built directly on
//! Tokio and Serde (no external SDK).
//!
//! # Architecture
//!
//! 1. **Protocol Layer** (`protocol`): JSON-RPC 2.0 message types
//! 2. **Server Layer** (`server`): line-delimited stdio framing and dispatch

// Protocol layer: JSON-RPC 2.0 message types
pub mod protocol;

// Server layer: request dispatch over stdio
pub mod server;

pub use protocol::{
    CallToolResult, Content, McpError, McpMethod, McpRequest, McpResponse, ServerCapabilities,
    ServerInfo, Tool, ToolCallParams,
};
pub use server::{McpServer, EXECUTE_TOOL, STATUS_TOOL};
