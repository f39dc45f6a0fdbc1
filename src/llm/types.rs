//! 后端无关的请求 / 响应类型

use std::pin::Pin;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ProviderError;

/// 模型请求的一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: new_call_id(),
            name: name.into(),
            arguments,
        }
    }
}

/// 后端未给出 id 时使用
pub fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// 工具执行结果（与 ToolCall 一一对应）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub result: String,
}

/// 非流式响应
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub content: Option<String>,
    pub function_calls: Vec<ToolCall>,
}

impl Response {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            function_calls: Vec::new(),
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            content: None,
            function_calls: calls,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.function_calls.is_empty()
    }
}

/// 流式响应片段：文本增量，或一轮结束时汇总的工具调用
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseChunk {
    Text(String),
    ToolCalls(Vec<ToolCall>),
}

pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<ResponseChunk, ProviderError>> + Send>>;

/// 由 format_tool_results 生成、只被生成它的后端消费的批量结果
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderPayload(Value);

impl ProviderPayload {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// 发给后端的一次输入
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderInput {
    Text(String),
    ToolResults(ProviderPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProviderCapabilities {
    pub streaming: bool,
    pub tool_calling: bool,
    pub system_instruction: bool,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            tool_calling: true,
            system_instruction: true,
        }
    }
}

/// `/info` 展示用
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderInfo {
    pub name: String,
    pub model: String,
    pub capabilities: ProviderCapabilities,
}
