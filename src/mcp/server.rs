//! JSON-RPC 2.0 stdio server exposing the feedback tool
//!
//! Each line on the input is one request; each response is one line on the
//! output. Tool calls run on their own tasks and report back over a channel,
//! so the read loop keeps serving `ping` and `notifications/cancelled` while a
//! human is busy. Only the read loop writes to the output.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::session::{SessionError, SessionRequest};
use crate::tool::{tool_definition, FeedbackArguments, FeedbackTool, ToolError, TOOL_NAME};

/// MCP protocol revision answered when the client does not name one
const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

// ---------------------------------------------------------------------------
// JSON-RPC 2.0 types
// ---------------------------------------------------------------------------

/// A JSON-RPC 2.0 request or notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    /// Absent for notifications
    #[serde(default)]
    pub id: Option<Value>,
}

/// A JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

/// A JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }
}

// Standard JSON-RPC error codes.
pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

// Application-specific error codes.
pub const VALIDATION_ERROR: i64 = -32001;
pub const CONFIG_ERROR: i64 = -32002;
pub const ABORTED: i64 = -32003;

/// Map a tool failure onto a JSON-RPC error code
pub fn error_code(error: &ToolError) -> i64 {
    match error {
        ToolError::Validation(_) => VALIDATION_ERROR,
        ToolError::Session(SessionError::Validation(_)) => VALIDATION_ERROR,
        ToolError::Session(SessionError::Config(_)) => CONFIG_ERROR,
        ToolError::Session(SessionError::Aborted) => ABORTED,
        ToolError::Surface(_) => INTERNAL_ERROR,
    }
}

/// Abort senders of in-flight tool calls, keyed by serialized request id
type InFlight = Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>;

fn request_key(id: &Value) -> String {
    id.to_string()
}

// ---------------------------------------------------------------------------
// McpServer
// ---------------------------------------------------------------------------

/// MCP stdio server with a single tool, `interactive_feedback`
pub struct McpServer {
    tool: FeedbackTool,
    in_flight: InFlight,
}

impl McpServer {
    pub fn new(tool: FeedbackTool) -> Self {
        Self {
            tool,
            in_flight: Arc::default(),
        }
    }

    /// Serve until the input reaches EOF
    ///
    /// Tool calls still in flight at EOF are allowed to finish; their
    /// responses are written before this returns.
    pub async fn run(
        self,
        mut input: impl AsyncBufRead + Unpin,
        mut output: impl AsyncWrite + Unpin,
    ) -> std::io::Result<()> {
        // Partial reads stay in `line` when the other branch wins the select
        let mut line = Vec::new();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<JsonRpcResponse>();

        info!(tool = TOOL_NAME, "MCP server ready");

        loop {
            tokio::select! {
                read = input.read_until(b'\n', &mut line) => {
                    if read? == 0 {
                        break;
                    }
                    let response = match std::str::from_utf8(&line) {
                        Ok(text) => self.handle_line(text.trim(), &done_tx),
                        Err(e) => {
                            debug!(error = %e, "Input line is not UTF-8");
                            Some(JsonRpcResponse::failure(Value::Null, PARSE_ERROR, "Parse error"))
                        }
                    };
                    line.clear();
                    if let Some(response) = response {
                        write_response(&mut output, &response).await?;
                    }
                }
                Some(response) = done_rx.recv() => {
                    write_response(&mut output, &response).await?;
                }
            }
        }

        let pending = self.in_flight.lock().map(|calls| calls.len()).unwrap_or(0);
        if pending > 0 {
            info!(pending, "Input closed, waiting for tool calls in flight");
        }
        drop(done_tx);
        while let Some(response) = done_rx.recv().await {
            write_response(&mut output, &response).await?;
        }

        info!("MCP server input closed");
        Ok(())
    }

    /// Handle one input line; `None` when there is nothing to answer yet
    fn handle_line(
        &self,
        line: &str,
        done: &mpsc::UnboundedSender<JsonRpcResponse>,
    ) -> Option<JsonRpcResponse> {
        if line.is_empty() {
            return None;
        }

        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Unparseable JSON-RPC line");
                return Some(JsonRpcResponse::failure(Value::Null, PARSE_ERROR, "Parse error"));
            }
        };

        let Some(id) = request.id.clone() else {
            self.handle_notification(&request);
            return None;
        };

        debug!(method = %request.method, id = %id, "JSON-RPC request");
        match request.method.as_str() {
            "initialize" => Some(self.handle_initialize(id, request.params.as_ref())),
            "ping" => Some(JsonRpcResponse::success(id, serde_json::json!({}))),
            "tools/list" => Some(self.handle_tools_list(id)),
            "tools/call" => self.handle_tools_call(id, request.params, done),
            _ => Some(JsonRpcResponse::failure(
                id,
                METHOD_NOT_FOUND,
                format!("Method not found: {}", request.method),
            )),
        }
    }

    fn handle_notification(&self, request: &JsonRpcRequest) {
        if request.method != "notifications/cancelled" {
            debug!(method = %request.method, "Ignoring notification");
            return;
        }

        let Some(request_id) = request.params.as_ref().and_then(|p| p.get("requestId")) else {
            warn!("notifications/cancelled without requestId");
            return;
        };

        let sender = self
            .in_flight
            .lock()
            .ok()
            .and_then(|mut calls| calls.remove(&request_key(request_id)));
        match sender {
            Some(abort) => {
                info!(request_id = %request_id, "Cancelling tool call");
                let _ = abort.send(());
            }
            None => debug!(request_id = %request_id, "Cancellation for unknown or finished call"),
        }
    }

    fn handle_initialize(&self, id: Value, params: Option<&Value>) -> JsonRpcResponse {
        let protocol_version = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_PROTOCOL_VERSION);

        JsonRpcResponse::success(
            id,
            serde_json::json!({
                "protocolVersion": protocol_version,
                "capabilities": {
                    "tools": {}
                },
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION")
                }
            }),
        )
    }

    fn handle_tools_list(&self, id: Value) -> JsonRpcResponse {
        JsonRpcResponse::success(id, serde_json::json!({ "tools": [tool_definition()] }))
    }

    /// Validate params and start the call; the response arrives over `done`
    fn handle_tools_call(
        &self,
        id: Value,
        params: Option<Value>,
        done: &mpsc::UnboundedSender<JsonRpcResponse>,
    ) -> Option<JsonRpcResponse> {
        let Some(params) = params else {
            return Some(JsonRpcResponse::failure(
                id,
                INVALID_PARAMS,
                "Missing params for tools/call",
            ));
        };

        match params.get("name").and_then(Value::as_str) {
            Some(TOOL_NAME) => {}
            Some(other) => {
                return Some(JsonRpcResponse::failure(
                    id,
                    INVALID_PARAMS,
                    format!("Unknown tool: {}", other),
                ));
            }
            None => {
                return Some(JsonRpcResponse::failure(
                    id,
                    INVALID_PARAMS,
                    "Missing 'name' in tools/call params",
                ));
            }
        }

        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        let arguments: FeedbackArguments = match serde_json::from_value(arguments) {
            Ok(arguments) => arguments,
            Err(e) => {
                return Some(JsonRpcResponse::failure(
                    id,
                    INVALID_PARAMS,
                    format!("Invalid arguments: {}", e),
                ));
            }
        };

        let key = request_key(&id);
        let (abort_tx, abort_rx) = oneshot::channel::<()>();
        if let Ok(mut calls) = self.in_flight.lock() {
            calls.insert(key.clone(), abort_tx);
        }

        let tool = self.tool.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let done = done.clone();
        info!(id = %id, project = %arguments.project_directory, "Starting tool call");

        tokio::spawn(async move {
            let request = SessionRequest::new(arguments.project_directory, arguments.summary);
            let abort = async move {
                // A dropped sender means the call finished; only an explicit send aborts.
                if abort_rx.await.is_err() {
                    std::future::pending::<()>().await;
                }
            };

            let outcome = tool.invoke_until(request, abort).await;
            if let Ok(mut calls) = in_flight.lock() {
                calls.remove(&key);
            }

            let response = match outcome {
                Ok(result) => match serde_json::to_string(&result) {
                    Ok(text) => JsonRpcResponse::success(
                        id,
                        serde_json::json!({
                            "content": [{
                                "type": "text",
                                "text": text,
                            }]
                        }),
                    ),
                    Err(e) => JsonRpcResponse::failure(id, INTERNAL_ERROR, e.to_string()),
                },
                Err(e) => {
                    warn!(id = %id, error = %e, "Tool call failed");
                    JsonRpcResponse::failure(id, error_code(&e), e.to_string())
                }
            };
            let _ = done.send(response);
        });

        None
    }
}

/// Write a JSON-RPC response as a single line
async fn write_response(
    writer: &mut (impl AsyncWrite + Unpin),
    response: &JsonRpcResponse,
) -> std::io::Result<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
