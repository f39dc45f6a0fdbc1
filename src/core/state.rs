//! 引擎阶段
//!
//! Idle → AwaitingModelResponse →（ExecutingTools ⇄ AwaitingModelResponse）→ Idle，
//! 通过 watch 通道发布给 UI。

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnginePhase {
    Idle,
    AwaitingModelResponse,
    ExecutingTools,
}

impl std::fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnginePhase::Idle => "idle",
            EnginePhase::AwaitingModelResponse => "awaiting_model_response",
            EnginePhase::ExecutingTools => "executing_tools",
        };
        f.write_str(s)
    }
}
