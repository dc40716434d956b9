use std::time::Duration;

use trio_types::{FileMap, TokenUsage};
use trio_wire::{AgentResponse, DeveloperResponse, DeveloperState};

use crate::agents::AgentKind;
use crate::engine_loop::LoopResult;

/// Seconds rounded to millisecond precision.
pub fn round_seconds(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 1000.0).round() / 1000.0
}

pub fn agent_response(result: LoopResult, elapsed: Duration) -> AgentResponse {
    AgentResponse {
        response: result.final_text,
        time_taken_seconds: round_seconds(elapsed),
        tokens: result.usage,
    }
}

pub fn developer_response(result: LoopResult, elapsed: Duration) -> DeveloperResponse {
    let files_count = result.files.len();
    DeveloperResponse {
        response: result.final_text,
        state: DeveloperState {
            files: result.files,
            summary: None,
        },
        time_taken_seconds: round_seconds(elapsed),
        tokens: result.usage,
        files_count,
    }
}

/// Uniform body for a request that failed before a loop result existed.
pub fn agent_error_response(kind: AgentKind, detail: &str, elapsed: Duration) -> AgentResponse {
    AgentResponse {
        response: kind.error_response_text(detail),
        time_taken_seconds: round_seconds(elapsed),
        tokens: TokenUsage::default(),
    }
}

pub fn developer_error_response(detail: &str, elapsed: Duration) -> DeveloperResponse {
    DeveloperResponse {
        response: AgentKind::Developer.error_response_text(detail),
        state: DeveloperState {
            files: FileMap::new(),
            summary: None,
        },
        time_taken_seconds: round_seconds(elapsed),
        tokens: TokenUsage::default(),
        files_count: 0,
    }
}
