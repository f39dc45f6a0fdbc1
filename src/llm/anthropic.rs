//! Anthropic Messages API 后端（reqwest 直连）
//!
//! 工具结果以一条 user 消息承载多个 tool_result 块（tool_use_id 对应调用 id）。
//! 流式以一次完整请求模拟：先产出文本，再产出工具调用。

use std::collections::HashSet;

use async_trait::async_trait;
use futures_util::stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::LlmConfig;
use crate::core::{ConfigurationError, ProviderError};
use crate::llm::retry::RetryPolicy;
use crate::llm::{
    ProviderAdapter, ProviderCapabilities, ProviderInput, ProviderPayload, Response,
    ResponseChunk, ResponseStream, ToolCall, ToolResult,
};
use crate::tools::ToolDeclaration;

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_API_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    retry: RetryPolicy,
    tools: Vec<AnthropicTool>,
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
}

impl AnthropicAdapter {
    pub fn new(config: &LlmConfig) -> Result<Self, ConfigurationError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| ConfigurationError::MissingApiKey {
                provider: "anthropic".to_string(),
                env_var: "ANTHROPIC_API_KEY".to_string(),
            })?;
        let base = config
            .base_url
            .clone()
            .unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string());
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ConfigurationError::Invalid(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/v1/messages", base.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_output_tokens,
            retry: RetryPolicy::from(&config.retry),
            tools: Vec::new(),
            system: None,
            messages: Vec::new(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn push_input(&mut self, input: ProviderInput) -> Result<(), ProviderError> {
        let content = match input {
            ProviderInput::Text(text) => AnthropicContent::Text(text),
            ProviderInput::ToolResults(payload) => AnthropicContent::Blocks(
                serde_json::from_value(payload.into_value()).map_err(|e| {
                    ProviderError::InvalidRequest(format!("tool result payload: {}", e))
                })?,
            ),
        };
        self.push_user(content);
        Ok(())
    }

    /// 连续的 user 内容合并进同一条消息，保持 user/assistant 交替
    fn push_user(&mut self, content: AnthropicContent) {
        match self.messages.last_mut() {
            Some(last) if last.role == "user" => last.content.append(content),
            _ => self.messages.push(AnthropicMessage {
                role: "user".to_string(),
                content,
            }),
        }
    }

    /// 最近一条 assistant 消息中还没有 tool_result 的 tool_use id
    fn pending_tool_uses(&self) -> Vec<String> {
        let Some(pos) = self.messages.iter().rposition(|m| m.role == "assistant") else {
            return Vec::new();
        };
        let answered: HashSet<&str> = self.messages[pos + 1..]
            .iter()
            .flat_map(|m| m.content.blocks())
            .filter_map(|b| match b {
                AnthropicBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect();
        self.messages[pos]
            .content
            .blocks()
            .iter()
            .filter_map(|b| match b {
                AnthropicBlock::ToolUse { id, .. } if !answered.contains(id.as_str()) => {
                    Some(id.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn build_request_body(
        &self,
        system: Option<&str>,
        messages: &[AnthropicMessage],
        with_tools: bool,
    ) -> AnthropicRequest {
        AnthropicRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system: system.map(String::from),
            messages: messages.to_vec(),
            tools: if with_tools && !self.tools.is_empty() {
                Some(self.tools.clone())
            } else {
                None
            },
        }
    }

    async fn post(&self, body: &AnthropicRequest) -> Result<AnthropicResponse, ProviderError> {
        self.retry
            .run("anthropic.messages", || async move {
                tracing::debug!(model = %body.model, messages = body.messages.len(), "anthropic request");
                let resp = self
                    .client
                    .post(&self.endpoint)
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", ANTHROPIC_API_VERSION)
                    .header("content-type", "application/json")
                    .json(body)
                    .send()
                    .await?;

                let status = resp.status();
                if !status.is_success() {
                    let error_body = resp.text().await.unwrap_or_default();
                    return Err(ProviderError::from_status(status.as_u16(), error_body));
                }
                resp.json::<AnthropicResponse>()
                    .await
                    .map_err(|e| ProviderError::Parse(e.to_string()))
            })
            .await
    }
}

/// 解析响应：文本块拼接，tool_use 块转为 ToolCall
fn parse_response(resp: &AnthropicResponse) -> Response {
    let mut text = String::new();
    let mut function_calls = Vec::new();
    for block in &resp.content {
        match block {
            AnthropicBlock::Text { text: t } => text.push_str(t),
            AnthropicBlock::ToolUse { id, name, input } => function_calls.push(ToolCall {
                id: id.clone(),
                name: name.clone(),
                arguments: input.clone(),
            }),
            AnthropicBlock::ToolResult { .. } => {}
        }
    }
    Response {
        content: if text.is_empty() { None } else { Some(text) },
        function_calls,
    }
}

fn response_chunks(response: Response) -> ResponseStream {
    let mut chunks = Vec::new();
    if let Some(text) = response.content {
        chunks.push(Ok(ResponseChunk::Text(text)));
    }
    if !response.function_calls.is_empty() {
        chunks.push(Ok(ResponseChunk::ToolCalls(response.function_calls)));
    }
    Box::pin(stream::iter(chunks))
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::default()
    }

    async fn initialize(
        &mut self,
        tools: &[ToolDeclaration],
        system_instruction: Option<&str>,
    ) -> Result<(), ProviderError> {
        self.tools = tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect();
        self.system = system_instruction.map(String::from);
        self.messages.clear();
        tracing::info!(model = %self.model, tools = self.tools.len(), "anthropic adapter initialized");
        Ok(())
    }

    async fn send(&mut self, input: ProviderInput) -> Result<Response, ProviderError> {
        self.push_input(input)?;
        let body = self.build_request_body(self.system.as_deref(), &self.messages, true);
        let resp = self.post(&body).await?;
        tracing::debug!(
            input_tokens = resp.usage.input_tokens,
            output_tokens = resp.usage.output_tokens,
            stop_reason = resp.stop_reason.as_deref().unwrap_or("unknown"),
            "anthropic usage"
        );
        let response = parse_response(&resp);
        self.messages.push(AnthropicMessage {
            role: "assistant".to_string(),
            content: AnthropicContent::Blocks(resp.content),
        });
        Ok(response)
    }

    async fn send_stream(&mut self, input: ProviderInput) -> Result<ResponseStream, ProviderError> {
        let response = self.send(input).await?;
        Ok(response_chunks(response))
    }

    async fn complete_stream(
        &self,
        system_instruction: &str,
        prompt: &str,
    ) -> Result<ResponseStream, ProviderError> {
        let messages = [AnthropicMessage {
            role: "user".to_string(),
            content: AnthropicContent::Text(prompt.to_string()),
        }];
        let body = self.build_request_body(Some(system_instruction), &messages, false);
        let resp = self.post(&body).await?;
        let mut response = parse_response(&resp);
        response.function_calls.clear();
        Ok(response_chunks(response))
    }

    fn format_tool_results(&self, results: &[ToolResult]) -> ProviderPayload {
        let blocks: Vec<AnthropicBlock> = results
            .iter()
            .map(|r| AnthropicBlock::ToolResult {
                tool_use_id: r.id.clone(),
                content: r.result.clone(),
            })
            .collect();
        ProviderPayload::new(serde_json::to_value(blocks).unwrap_or(Value::Array(Vec::new())))
    }

    async fn settle_pending_calls(&mut self, completed: &[ToolResult], reason: &str) -> usize {
        let blocks: Vec<AnthropicBlock> = self
            .pending_tool_uses()
            .into_iter()
            .map(|id| {
                let content = completed
                    .iter()
                    .find(|r| r.id == id)
                    .map_or_else(|| reason.to_string(), |r| r.result.clone());
                AnthropicBlock::ToolResult {
                    tool_use_id: id,
                    content,
                }
            })
            .collect();
        let settled = blocks.len();
        if settled > 0 {
            self.push_user(AnthropicContent::Blocks(blocks));
        }
        settled
    }

    async fn clear_history(&mut self) {
        self.messages.clear();
    }

    fn history_len(&self) -> usize {
        self.messages.len()
    }
}

// ── Anthropic API types ─────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
}

#[derive(Debug, Clone, Serialize)]
struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicBlock>),
}

impl AnthropicContent {
    fn blocks(&self) -> &[AnthropicBlock] {
        match self {
            AnthropicContent::Text(_) => &[],
            AnthropicContent::Blocks(blocks) => blocks,
        }
    }

    fn into_blocks(self) -> Vec<AnthropicBlock> {
        match self {
            AnthropicContent::Text(text) => vec![AnthropicBlock::Text { text }],
            AnthropicContent::Blocks(blocks) => blocks,
        }
    }

    fn append(&mut self, other: AnthropicContent) {
        let mut blocks = std::mem::replace(self, AnthropicContent::Blocks(Vec::new())).into_blocks();
        blocks.extend(other.into_blocks());
        *self = AnthropicContent::Blocks(blocks);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum AnthropicBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: Value },
    #[serde(rename = "tool_result")]
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Clone, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}
