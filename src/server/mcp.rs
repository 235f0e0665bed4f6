//! Line-delimited JSON-RPC 2.0 over stdio and the diagnosis tool catalogue.
//!
//! One request per line on stdin, one response per line on stdout.
//! Notifications never get a response.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

use super::{handle_tool_call, SharedState};

#[cfg(test)]
#[path = "mcp_tests.rs"]
mod mcp_tests;

/// MCP protocol revision this server speaks
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// Incoming message. A missing `id` marks a notification.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// Outgoing reply; exactly one of `result` and `error` is set
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    /// Echoes the request id, `null` when it could not be read.
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct Capabilities {
    pub tools: ToolCapabilities,
}

#[derive(Debug, Serialize)]
pub struct ToolCapabilities {
    /// Always false: the tool set is fixed at build time.
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// Reply to `initialize`
#[derive(Debug, Serialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: Capabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

/// A tool as advertised by `tools/list`
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// `params` of a `tools/call` request
#[derive(Debug, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ToolResultContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

/// `tools/call` result. Tool failures are reported here with `isError`,
/// not as JSON-RPC errors.
#[derive(Debug, Serialize)]
pub struct ToolCallResult {
    pub content: Vec<ToolResultContent>,
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl ToolCallResult {
    fn text(text: String, is_error: bool) -> Self {
        Self {
            content: vec![ToolResultContent {
                content_type: "text".to_string(),
                text,
            }],
            is_error: is_error.then_some(true),
        }
    }
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Serialize `value` as the result, or answer with an internal error
    fn from_serializable(id: Option<Value>, value: impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(result) => Self::success(id, result),
            Err(e) => {
                error!(error = %e, "Could not serialize result");
                Self::error(id, INTERNAL_ERROR, format!("Internal error: {}", e))
            }
        }
    }
}

/// Stdio MCP server for diagnosis sessions
pub struct McpServer {
    state: SharedState,
}

impl McpServer {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Serve stdin until EOF or shutdown
    pub async fn run(&self) -> std::io::Result<()> {
        info!("dx-refine MCP server listening on stdio");

        let mut reader = BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();
        let mut line = String::new();

        loop {
            line.clear();
            let read = tokio::select! {
                _ = self.state.shutdown.cancelled() => {
                    info!("Shutdown requested, stopping server");
                    break;
                }
                read = reader.read_line(&mut line) => read?,
            };
            if read == 0 {
                info!("stdin closed, stopping server");
                break;
            }

            let message = line.trim();
            if message.is_empty() {
                continue;
            }
            debug!(request = %message, "Received message");

            let response = match serde_json::from_str::<JsonRpcRequest>(message) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => {
                    warn!(error = %e, "Unparseable message");
                    Some(JsonRpcResponse::error(
                        None,
                        PARSE_ERROR,
                        format!("Parse error: {}", e),
                    ))
                }
            };

            if let Some(response) = response {
                write_response(&mut stdout, &response).await?;
            }
        }

        Ok(())
    }

    /// Dispatch one message; `None` when no reply is due
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;

        match method.as_str() {
            "initialize" => Some(self.handle_initialize(id)),
            "initialized" | "notifications/cancelled" => {
                debug!(method = %method, "Notification acknowledged");
                None
            }
            "tools/list" => Some(JsonRpcResponse::success(
                id,
                serde_json::json!({ "tools": all_tools() }),
            )),
            "tools/call" => Some(self.handle_tool_call(id, params).await),
            "ping" => Some(JsonRpcResponse::success(id, serde_json::json!({}))),
            _ if id.is_none() => {
                debug!(method = %method, "Ignoring unknown notification");
                None
            }
            _ => {
                warn!(method = %method, "Unknown method");
                Some(JsonRpcResponse::error(
                    id,
                    METHOD_NOT_FOUND,
                    format!("Method not found: {}", method),
                ))
            }
        }
    }

    fn handle_initialize(&self, id: Option<Value>) -> JsonRpcResponse {
        info!("Client initializing");

        JsonRpcResponse::from_serializable(
            id,
            InitializeResult {
                protocol_version: PROTOCOL_VERSION.to_string(),
                capabilities: Capabilities {
                    tools: ToolCapabilities {
                        list_changed: false,
                    },
                },
                server_info: ServerInfo {
                    name: "dx-refine".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
            },
        )
    }

    async fn handle_tool_call(&self, id: Option<Value>, params: Option<Value>) -> JsonRpcResponse {
        let Some(params) = params else {
            return JsonRpcResponse::error(id, INVALID_PARAMS, "Missing params");
        };
        let params: ToolCallParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => {
                return JsonRpcResponse::error(id, INVALID_PARAMS, format!("Invalid params: {}", e))
            }
        };

        let result = match handle_tool_call(&self.state, &params.name, params.arguments).await {
            Ok(output) => match serde_json::to_string_pretty(&output) {
                Ok(text) => ToolCallResult::text(text, false),
                Err(e) => ToolCallResult::text(format!("Error: {}", e), true),
            },
            Err(e) => {
                debug!(tool = %params.name, error = %e, "Tool call failed");
                ToolCallResult::text(format!("Error: {}", e), true)
            }
        };

        JsonRpcResponse::from_serializable(id, result)
    }
}

async fn write_response<W: AsyncWrite + Unpin>(
    out: &mut W,
    response: &JsonRpcResponse,
) -> std::io::Result<()> {
    let mut encoded = serde_json::to_vec(response)?;
    encoded.push(b'\n');
    out.write_all(&encoded).await?;
    out.flush().await
}

/// Every tool the server exposes, in listing order
pub fn all_tools() -> Vec<Tool> {
    vec![
        // Follow-up rounds
        get_start_tool(),
        get_follow_up_tool(),
        get_retry_final_round_tool(),
        get_status_tool(),
        get_archive_tool(),
        get_ask_tool(),
        // Rare-disease confirmation
        get_record_symptoms_tool(),
        get_select_tests_tool(),
        get_toggle_test_tool(),
        get_skip_tests_tool(),
        get_submit_results_tool(),
    ]
}

fn session_id_property() -> Value {
    serde_json::json!({
        "type": "string",
        "description": "Session ID returned by diagnosis_start"
    })
}

fn candidate_property() -> Value {
    serde_json::json!({
        "type": "string",
        "description": "Rare candidate diagnosis name, as listed in the session status"
    })
}

/// Get the session start tool definition
fn get_start_tool() -> Tool {
    Tool {
        name: "diagnosis_start".to_string(),
        description: "Submit a patient intake form to the diagnosis engine and open a refinement session. Returns the first candidate set, follow-up questions and any rare candidates.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "patient": {
                    "type": "object",
                    "description": "Patient intake form",
                    "properties": {
                        "patientName": { "type": "string" },
                        "age": { "type": ["integer", "string"], "description": "Age in years" },
                        "gender": { "type": "string" },
                        "symptoms": { "type": "string" },
                        "medicalHistory": { "type": "string" },
                        "allergies": { "type": "string" },
                        "currentMedications": { "type": "string" }
                    }
                }
            },
            "required": ["patient"]
        }),
    }
}

/// Get the follow-up round tool definition
fn get_follow_up_tool() -> Tool {
    Tool {
        name: "diagnosis_follow_up".to_string(),
        description: "Answer the current follow-up questions and run the next refinement round. At most three rounds; the third always ends with a single candidate.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_property(),
                "answers": {
                    "type": "object",
                    "description": "Answers keyed by question index (\"0\", \"1\", ...); unanswered questions are sent empty",
                    "additionalProperties": { "type": "string" }
                },
                "additional_info": {
                    "type": "string",
                    "description": "Free-text information beyond the questions"
                }
            },
            "required": ["session_id"]
        }),
    }
}

/// Get the final-round retry tool definition
fn get_retry_final_round_tool() -> Tool {
    Tool {
        name: "diagnosis_retry_final_round".to_string(),
        description: "Resend the final follow-up round after its engine call failed. Only valid while the session is stuck.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_property()
            },
            "required": ["session_id"]
        }),
    }
}

/// Get the status tool definition
fn get_status_tool() -> Tool {
    Tool {
        name: "diagnosis_status".to_string(),
        description: "Current candidates, questions, rare-disease progress and final diagnosis of a session.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_property()
            },
            "required": ["session_id"]
        }),
    }
}

/// Get the archive tool definition
fn get_archive_tool() -> Tool {
    Tool {
        name: "diagnosis_archive".to_string(),
        description: "Final diagnosis and every candidate it displaced, with the reason and time each was archived.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_property()
            },
            "required": ["session_id"]
        }),
    }
}

/// Get the free-form question tool definition
fn get_ask_tool() -> Tool {
    Tool {
        name: "diagnosis_ask".to_string(),
        description: "Ask the engine a free-form question about the session's current candidates. Earlier questions and answers are sent along; rounds and candidates are not changed.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_property(),
                "question": {
                    "type": "string",
                    "description": "The question to ask"
                }
            },
            "required": ["session_id", "question"]
        }),
    }
}

/// Get the symptom presence tool definition
fn get_record_symptoms_tool() -> Tool {
    Tool {
        name: "rare_record_symptoms".to_string(),
        description: "Record whether the discriminator symptoms of a rare candidate are present. Can only be recorded once; when present, test selection opens with the recommended tests.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_property(),
                "candidate": candidate_property(),
                "present": {
                    "type": "boolean",
                    "description": "Whether the discriminator symptoms are present"
                }
            },
            "required": ["session_id", "candidate", "present"]
        }),
    }
}

/// Get the test selection tool definition
fn get_select_tests_tool() -> Tool {
    Tool {
        name: "rare_select_tests".to_string(),
        description: "Replace the set of tests selected for a rare candidate.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_property(),
                "candidate": candidate_property(),
                "tests": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Test names"
                }
            },
            "required": ["session_id", "candidate", "tests"]
        }),
    }
}

/// Get the test toggle tool definition
fn get_toggle_test_tool() -> Tool {
    Tool {
        name: "rare_toggle_test".to_string(),
        description: "Add a test to, or remove it from, a rare candidate's selection.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_property(),
                "candidate": candidate_property(),
                "test": {
                    "type": "string",
                    "description": "Test name"
                }
            },
            "required": ["session_id", "candidate", "test"]
        }),
    }
}

/// Get the skip tests tool definition
fn get_skip_tests_tool() -> Tool {
    Tool {
        name: "rare_skip_tests".to_string(),
        description: "Close test selection for a rare candidate without submitting results. The candidate stays in the rare set.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_property(),
                "candidate": candidate_property()
            },
            "required": ["session_id", "candidate"]
        }),
    }
}

/// Get the test results tool definition
fn get_submit_results_tool() -> Tool {
    Tool {
        name: "rare_submit_results".to_string(),
        description: "Submit results for the selected tests of a rare candidate. Every selected test needs a non-empty result. The engine confirms, rules out or asks for more tests.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": session_id_property(),
                "candidate": candidate_property(),
                "results": {
                    "type": "object",
                    "description": "Result text keyed by test name",
                    "additionalProperties": { "type": "string" }
                }
            },
            "required": ["session_id", "candidate", "results"]
        }),
    }
}
