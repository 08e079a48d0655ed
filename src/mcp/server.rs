//! MCP Stdio Server
//!
//! Reads newline-delimited JSON-RPC messages and writes one response line
//! per request. Each `tools/call` runs on its own task so a long command
//! never blocks other requests; responses may therefore arrive out of order
//! and are matched by id.

use super::protocol::{
    CallToolResult, McpError, McpMethod, McpRequest, McpResponse, ServerCapabilities, ServerInfo,
    Tool, ToolCallParams, PROTOCOL_VERSION,
};
use crate::gateway::ToolGateway;
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Tool that runs a CLI command
pub const EXECUTE_TOOL: &str = "execute_azure_cli_command";

/// Tool that reports the current session
pub const STATUS_TOOL: &str = "get_auth_status";

/// MCP server exposing the gateway as tools
#[derive(Clone)]
pub struct McpServer {
    gateway: Arc<ToolGateway>,
}

impl McpServer {
    pub fn new(gateway: Arc<ToolGateway>) -> Self {
        Self { gateway }
    }

    /// Tool definitions advertised by `tools/list`
    pub fn tools() -> Vec<Tool> {
        vec![
            Tool {
                name: EXECUTE_TOOL.to_string(),
                description: "Execute an Azure CLI command. Pass the command with or without the \
                    leading 'az', e.g. 'group list --output json'. Shell operators are rejected. \
                    Destructive commands require \"confirm\": true. If authentication is needed, \
                    the result contains a device code to relay to the user; retry once they have \
                    signed in."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "command": {
                            "type": "string",
                            "description": "Azure CLI command to run"
                        },
                        "timeout_seconds": {
                            "type": "integer",
                            "minimum": 1,
                            "description": "Override the default command timeout"
                        },
                        "confirm": {
                            "type": "boolean",
                            "description": "Confirm a destructive command"
                        }
                    },
                    "required": ["command"]
                }),
            },
            Tool {
                name: STATUS_TOOL.to_string(),
                description: "Report whether the Azure CLI session is authenticated.".to_string(),
                input_schema: json!({"type": "object", "properties": {}}),
            },
        ]
    }

    /// Serve over the process's stdin and stdout
    pub async fn serve_stdio(self) -> Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve until `reader` reaches EOF, then drain in-flight calls
    pub async fn serve<R, W>(self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<McpResponse>();
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(response) = rx.recv().await {
                let json = serde_json::to_string(&response).context("Failed to serialize response")?;
                writer
                    .write_all(json.as_bytes())
                    .await
                    .context("Failed to write response")?;
                writer.write_all(b"\n").await.context("Failed to write newline")?;
                writer.flush().await.context("Failed to flush output")?;
            }
            Ok::<(), anyhow::Error>(())
        });

        let mut lines = BufReader::new(reader).lines();
        let mut calls = JoinSet::new();

        while let Some(line) = lines.next_line().await.context("Failed to read input")? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let request = match parse_request(line) {
                Ok(request) => request,
                Err(response) => {
                    warn!("Rejected malformed message: {:?}", response.error);
                    let _ = tx.send(response);
                    continue;
                }
            };
            debug!(method = %request.method, id = ?request.id, "Received request");

            let McpRequest {
                id, method, params, ..
            } = request;
            match (McpMethod::from(method.as_str()), id) {
                (McpMethod::ToolsCall, Some(id)) => {
                    let gateway = self.gateway.clone();
                    let tx = tx.clone();
                    calls.spawn(async move {
                        let response = call_tool(&gateway, id, params).await;
                        let _ = tx.send(response);
                    });
                }
                (method, id) => {
                    if let Some(response) = self.handle_request(method, id, params) {
                        let _ = tx.send(response);
                    }
                }
            }

            // Reap finished calls so the set does not grow unbounded
            while calls.try_join_next().is_some() {}
        }

        info!(in_flight = calls.len(), "Input closed, waiting for in-flight tool calls");
        while calls.join_next().await.is_some() {}
        drop(tx);
        writer_task.await.context("Writer task panicked")??;
        Ok(())
    }

    /// Handle methods that answer without running a command
    fn handle_request(&self, method: McpMethod, id: Option<Value>, params: Option<Value>) -> Option<McpResponse> {
        // Notifications never get a response
        let id = id?;
        let response = match method {
            McpMethod::Initialize => {
                let requested = params
                    .as_ref()
                    .and_then(|p| p.get("protocolVersion"))
                    .and_then(Value::as_str)
                    .unwrap_or(PROTOCOL_VERSION);
                info!(protocol_version = requested, "Client initialized session");
                let capabilities = ServerCapabilities {
                    protocol_version: requested.to_string(),
                    capabilities: json!({"tools": {"listChanged": false}}),
                    server_info: ServerInfo {
                        name: env!("CARGO_PKG_NAME").to_string(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                    },
                };
                match serde_json::to_value(capabilities) {
                    Ok(value) => McpResponse::ok(id, value),
                    Err(e) => McpResponse::err(id, McpError::internal_error(e.to_string())),
                }
            }
            McpMethod::Ping => McpResponse::ok(id, json!({})),
            McpMethod::ToolsList => match serde_json::to_value(Self::tools()) {
                Ok(tools) => McpResponse::ok(id, json!({ "tools": tools })),
                Err(e) => McpResponse::err(id, McpError::internal_error(e.to_string())),
            },
            other => McpResponse::err(id, McpError::method_not_found(other.as_str())),
        };
        Some(response)
    }
}

fn parse_request(line: &str) -> std::result::Result<McpRequest, McpResponse> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| McpResponse::err(Value::Null, McpError::parse_error(e.to_string())))?;
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| McpResponse::err(id, McpError::invalid_request(e.to_string())))
}

async fn call_tool(gateway: &ToolGateway, id: Value, params: Option<Value>) -> McpResponse {
    let params: ToolCallParams = match params.map(serde_json::from_value) {
        Some(Ok(params)) => params,
        Some(Err(e)) => return McpResponse::err(id, McpError::invalid_params(e.to_string())),
        None => return McpResponse::err(id, McpError::invalid_params("missing tool call params")),
    };

    let response = match params.name.as_str() {
        EXECUTE_TOOL => gateway.handle_arguments(&params.arguments).await,
        STATUS_TOOL => gateway.auth_status(uuid::Uuid::new_v4().to_string()),
        other => {
            return McpResponse::err(id, McpError::invalid_params(format!("Unknown tool: {}", other)))
        }
    };

    let result = match serde_json::to_value(&response) {
        Ok(structured) => {
            CallToolResult::text(response.to_text(), response.is_error()).with_structured(structured)
        }
        Err(e) => return McpResponse::err(id, McpError::internal_error(e.to_string())),
    };
    match serde_json::to_value(result) {
        Ok(value) => McpResponse::ok(id, value),
        Err(e) => McpResponse::err(id, McpError::internal_error(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_definitions() {
        let tools = McpServer::tools();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, EXECUTE_TOOL);
        assert_eq!(tools[0].input_schema["required"][0], "command");
        assert_eq!(tools[1].name, STATUS_TOOL);
    }

    #[test]
    fn test_parse_request_errors() {
        let err = parse_request("{not json").unwrap_err();
        assert_eq!(err.id, Value::Null);
        assert_eq!(err.error.unwrap().code, -32700);

        let err = parse_request(r#"{"jsonrpc":"2.0","id":7}"#).unwrap_err();
        assert_eq!(err.id, json!(7));
        assert_eq!(err.error.unwrap().code, -32600);
    }
}
