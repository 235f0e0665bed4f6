use serde::Serialize;
use serde_json::Value;
use tracing::info;

use super::SharedState;
use crate::error::{McpError, McpResult};
use crate::service::{
    AskParams, CandidateParams, FollowUpParams, SelectTestsParams, SessionParams, StartParams,
    SubmitResultsParams, SymptomParams, ToggleTestParams,
};

/// Route tool calls to appropriate handlers
pub async fn handle_tool_call(
    state: &SharedState,
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<Value> {
    info!(tool = %tool_name, "Routing tool call");

    let service = &state.diagnosis;

    match tool_name {
        // Follow-up rounds
        "diagnosis_start" => {
            execute_handler(tool_name, arguments, |p: StartParams| service.start(p)).await
        }
        "diagnosis_follow_up" => {
            execute_handler(tool_name, arguments, |p: FollowUpParams| service.follow_up(p)).await
        }
        "diagnosis_retry_final_round" => {
            execute_handler(tool_name, arguments, |p: SessionParams| {
                service.retry_final_round(p)
            })
            .await
        }
        "diagnosis_status" => {
            execute_handler(tool_name, arguments, |p: SessionParams| service.status(p)).await
        }
        "diagnosis_archive" => {
            execute_handler(tool_name, arguments, |p: SessionParams| service.archive(p)).await
        }
        "diagnosis_ask" => {
            execute_handler(tool_name, arguments, |p: AskParams| service.ask(p)).await
        }
        // Rare-disease confirmation
        "rare_record_symptoms" => {
            execute_handler(tool_name, arguments, |p: SymptomParams| {
                service.record_symptoms(p)
            })
            .await
        }
        "rare_select_tests" => {
            execute_handler(tool_name, arguments, |p: SelectTestsParams| {
                service.select_tests(p)
            })
            .await
        }
        "rare_toggle_test" => {
            execute_handler(tool_name, arguments, |p: ToggleTestParams| {
                service.toggle_test(p)
            })
            .await
        }
        "rare_skip_tests" => {
            execute_handler(tool_name, arguments, |p: CandidateParams| service.skip_tests(p))
                .await
        }
        "rare_submit_results" => {
            execute_handler(tool_name, arguments, |p: SubmitResultsParams| {
                service.submit_results(p)
            })
            .await
        }
        _ => Err(McpError::UnknownTool {
            tool_name: tool_name.to_string(),
        }),
    }
}

fn parse_arguments<T: serde::de::DeserializeOwned>(
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<T> {
    match arguments {
        Some(args) => serde_json::from_value(args).map_err(|e| McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: e.to_string(),
        }),
        None => Err(McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: "Missing arguments".to_string(),
        }),
    }
}

/// Parse arguments, run the operation and serialize its result.
///
/// Operation errors become [`McpError::ExecutionFailed`].
async fn execute_handler<P, R, E, F, Fut>(
    tool_name: &str,
    arguments: Option<Value>,
    operation: F,
) -> McpResult<Value>
where
    P: serde::de::DeserializeOwned,
    R: Serialize,
    E: std::fmt::Display,
    F: FnOnce(P) -> Fut,
    Fut: std::future::Future<Output = Result<R, E>>,
{
    let params: P = parse_arguments(tool_name, arguments)?;

    let result = operation(params)
        .await
        .map_err(|e| McpError::ExecutionFailed {
            message: e.to_string(),
        })?;

    serde_json::to_value(result).map_err(McpError::Json)
}
