//! OpenAI 兼容后端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）：OpenAI、DeepSeek、Ollama、自建代理等。
//! 工具结果以 role=tool 消息（带 tool_call_id）回传；流式响应中的工具调用增量按 index 累积，流结束时一次性产出。

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionMessageToolCall, ChatCompletionMessageToolCallChunk,
    ChatCompletionMessageToolCalls, ChatCompletionRequestAssistantMessageArgs,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionResponseStream, ChatCompletionTool, ChatCompletionToolChoiceOption,
    ChatCompletionTools, CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    FunctionCall, FunctionObject, ToolChoiceOptions,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::LlmConfig;
use crate::core::{ConfigurationError, ProviderError};
use crate::llm::retry::RetryPolicy;
use crate::llm::{
    new_call_id, ProviderAdapter, ProviderCapabilities, ProviderInput, ProviderPayload, Response,
    ResponseChunk, ResponseStream, ToolCall, ToolResult,
};
use crate::tools::ToolDeclaration;

const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";
const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";

type SharedMessages = Arc<Mutex<Vec<ChatCompletionRequestMessage>>>;

/// format_tool_results 的单条结果
#[derive(Debug, Serialize, Deserialize)]
struct ToolReply {
    tool_call_id: String,
    content: String,
}

pub struct OpenAiAdapter {
    client: Client<OpenAIConfig>,
    provider: String,
    model: String,
    max_output_tokens: u32,
    retry: RetryPolicy,
    tools: Vec<ChatCompletionTools>,
    system_instruction: Option<String>,
    messages: SharedMessages,
}

impl OpenAiAdapter {
    pub fn new(config: &LlmConfig) -> Result<Self, ConfigurationError> {
        let provider = config.provider.to_lowercase();
        let base_url = config.base_url.clone().or_else(|| match provider.as_str() {
            "ollama" => Some(OLLAMA_BASE_URL.to_string()),
            "deepseek" => Some(DEEPSEEK_BASE_URL.to_string()),
            _ => None,
        });
        // Ollama 不校验 key，但 OpenAI 客户端要求非空
        let api_key = config
            .api_key
            .clone()
            .unwrap_or_else(|| "ollama".to_string());

        let mut openai_config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(url) = base_url {
            openai_config = openai_config.with_api_base(url);
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ConfigurationError::Invalid(format!("http client: {}", e)))?;

        Ok(Self {
            client: Client::with_config(openai_config).with_http_client(http),
            provider,
            model: config.model.clone(),
            max_output_tokens: config.max_output_tokens,
            retry: RetryPolicy::from(&config.retry),
            tools: Vec::new(),
            system_instruction: None,
            messages: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn messages(&self) -> MutexGuard<'_, Vec<ChatCompletionRequestMessage>> {
        lock(&self.messages)
    }

    /// 系统指令 + 会话上下文
    fn request_messages(&self) -> Result<Vec<ChatCompletionRequestMessage>, ProviderError> {
        let mut out = Vec::new();
        if let Some(system) = &self.system_instruction {
            out.push(system_message(system)?);
        }
        out.extend(self.messages().iter().cloned());
        Ok(out)
    }

    fn push_input(&self, input: ProviderInput) -> Result<(), ProviderError> {
        let new_messages = match input {
            ProviderInput::Text(text) => vec![ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(text)
                    .build()
                    .map_err(map_openai_error)?,
            )],
            ProviderInput::ToolResults(payload) => {
                let replies: Vec<ToolReply> = serde_json::from_value(payload.into_value())
                    .map_err(|e| ProviderError::InvalidRequest(format!("tool result payload: {}", e)))?;
                replies
                    .iter()
                    .map(|r| tool_message(&r.tool_call_id, &r.content).map_err(map_openai_error))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        self.messages().extend(new_messages);
        Ok(())
    }

    fn build_request(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        with_tools: bool,
    ) -> Result<CreateChatCompletionRequest, ProviderError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .messages(messages)
            .max_completion_tokens(self.max_output_tokens);
        if with_tools && !self.tools.is_empty() {
            args.tools(self.tools.clone())
                .tool_choice(ChatCompletionToolChoiceOption::Mode(ToolChoiceOptions::Auto));
        }
        args.build().map_err(map_openai_error)
    }

    async fn open_stream(
        &self,
        request: CreateChatCompletionRequest,
    ) -> Result<ChatCompletionResponseStream, ProviderError> {
        let client = &self.client;
        self.retry
            .run("openai.chat.stream", || {
                let request = request.clone();
                async move {
                    client
                        .chat()
                        .create_stream(request)
                        .await
                        .map_err(map_openai_error)
                }
            })
            .await
    }
}

fn lock(messages: &Mutex<Vec<ChatCompletionRequestMessage>>) -> MutexGuard<'_, Vec<ChatCompletionRequestMessage>> {
    messages.lock().unwrap_or_else(PoisonError::into_inner)
}

fn system_message(text: &str) -> Result<ChatCompletionRequestMessage, ProviderError> {
    ChatCompletionRequestSystemMessageArgs::default()
        .content(text)
        .build()
        .map(ChatCompletionRequestMessage::System)
        .map_err(map_openai_error)
}

fn assistant_message(
    text: &str,
    calls: &[ToolCall],
) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    let mut args = ChatCompletionRequestAssistantMessageArgs::default();
    if !text.is_empty() {
        args.content(text);
    }
    if !calls.is_empty() {
        args.tool_calls(
            calls
                .iter()
                .map(|c| {
                    ChatCompletionMessageToolCalls::Function(ChatCompletionMessageToolCall {
                        id: c.id.clone(),
                        function: FunctionCall {
                            name: c.name.clone(),
                            arguments: c.arguments.to_string(),
                        },
                    })
                })
                .collect::<Vec<_>>(),
        );
    }
    args.build().map(ChatCompletionRequestMessage::Assistant)
}

/// 最近一条助手消息中还没有 role=tool 回复的调用 id
fn pending_call_ids(messages: &[ChatCompletionRequestMessage]) -> Vec<String> {
    let Some(pos) = messages
        .iter()
        .rposition(|m| matches!(m, ChatCompletionRequestMessage::Assistant(_)))
    else {
        return Vec::new();
    };
    let ChatCompletionRequestMessage::Assistant(assistant) = &messages[pos] else {
        return Vec::new();
    };
    let answered: HashSet<&str> = messages[pos + 1..]
        .iter()
        .filter_map(|m| match m {
            ChatCompletionRequestMessage::Tool(t) => Some(t.tool_call_id.as_str()),
            _ => None,
        })
        .collect();
    assistant
        .tool_calls
        .iter()
        .flatten()
        .filter_map(|c| match c {
            ChatCompletionMessageToolCalls::Function(f) => Some(f.id.as_str()),
            ChatCompletionMessageToolCalls::Custom(c) => Some(c.id.as_str()),
        })
        .filter(|id| !answered.contains(id))
        .map(String::from)
        .collect()
}

fn tool_message(tool_call_id: &str, content: &str) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    ChatCompletionRequestToolMessageArgs::default()
        .content(content)
        .tool_call_id(tool_call_id)
        .build()
        .map(ChatCompletionRequestMessage::Tool)
}

fn to_openai_tool(decl: &ToolDeclaration) -> ChatCompletionTools {
    ChatCompletionTools::Function(ChatCompletionTool {
        function: FunctionObject {
            name: decl.name.clone(),
            description: Some(decl.description.clone()),
            parameters: Some(decl.parameters.clone()),
            strict: None,
        },
    })
}

/// 参数不是合法 JSON 时原样保留为字符串，由工具层报告校验错误
fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn from_openai_calls(calls: Vec<ChatCompletionMessageToolCalls>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .filter_map(|call| match call {
            ChatCompletionMessageToolCalls::Function(f) => Some(ToolCall {
                id: if f.id.is_empty() { new_call_id() } else { f.id },
                name: f.function.name,
                arguments: parse_arguments(&f.function.arguments),
            }),
            ChatCompletionMessageToolCalls::Custom(c) => {
                tracing::warn!(id = %c.id, "ignoring custom tool call");
                None
            }
        })
        .collect()
}

pub(crate) fn map_openai_error(e: OpenAIError) -> ProviderError {
    match e {
        OpenAIError::Reqwest(e) => ProviderError::from(e),
        OpenAIError::ApiError(api) => {
            let code = api.code.clone().unwrap_or_default();
            let kind = api.r#type.clone().unwrap_or_default();
            let message = api.to_string();
            if code.contains("rate_limit") || kind.contains("rate_limit") {
                ProviderError::RateLimited(message)
            } else if code == "invalid_api_key" || kind.contains("authentication") {
                ProviderError::PermissionDenied(message)
            } else if kind == "invalid_request_error" {
                ProviderError::InvalidRequest(message)
            } else {
                ProviderError::Api(message)
            }
        }
        OpenAIError::JSONDeserialize(e, _) => ProviderError::Parse(e.to_string()),
        OpenAIError::StreamError(e) => ProviderError::Connection(e.to_string()),
        OpenAIError::InvalidArgument(msg) => ProviderError::InvalidRequest(msg),
        other => ProviderError::Api(other.to_string()),
    }
}

/// 流式工具调用的累积状态
#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

fn accumulate(calls: &mut BTreeMap<u32, PartialCall>, deltas: Vec<ChatCompletionMessageToolCallChunk>) {
    for delta in deltas {
        let entry = calls.entry(delta.index).or_default();
        if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
            entry.id = id;
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name.filter(|n| !n.is_empty()) {
                entry.name = name;
            }
            if let Some(args) = function.arguments {
                entry.arguments.push_str(&args);
            }
        }
    }
}

fn finish_calls(calls: BTreeMap<u32, PartialCall>) -> Vec<ToolCall> {
    calls
        .into_values()
        .filter(|c| !c.name.is_empty())
        .map(|c| ToolCall {
            id: if c.id.is_empty() { new_call_id() } else { c.id },
            name: c.name,
            arguments: parse_arguments(&c.arguments),
        })
        .collect()
}

struct StreamState {
    inner: ChatCompletionResponseStream,
    text: String,
    calls: BTreeMap<u32, PartialCall>,
    messages: SharedMessages,
    finished: bool,
}

impl StreamState {
    /// 流结束：汇总工具调用并把助手消息写回上下文
    fn finish(&mut self) -> Vec<ToolCall> {
        let calls = finish_calls(std::mem::take(&mut self.calls));
        if !self.text.is_empty() || !calls.is_empty() {
            match assistant_message(&self.text, &calls) {
                Ok(message) => lock(&self.messages).push(message),
                Err(e) => tracing::warn!(error = %e, "failed to record assistant message"),
            }
        }
        calls
    }
}

fn response_stream(state: StreamState) -> ResponseStream {
    Box::pin(stream::unfold(state, |mut st| async move {
        if st.finished {
            return None;
        }
        loop {
            match st.inner.next().await {
                Some(Ok(chunk)) => {
                    let mut text = String::new();
                    for choice in chunk.choices {
                        if let Some(content) = choice.delta.content {
                            text.push_str(&content);
                        }
                        if let Some(deltas) = choice.delta.tool_calls {
                            accumulate(&mut st.calls, deltas);
                        }
                    }
                    if !text.is_empty() {
                        st.text.push_str(&text);
                        return Some((Ok(ResponseChunk::Text(text)), st));
                    }
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(map_openai_error(e)), st));
                }
                None => {
                    st.finished = true;
                    let calls = st.finish();
                    if calls.is_empty() {
                        return None;
                    }
                    return Some((Ok(ResponseChunk::ToolCalls(calls)), st));
                }
            }
        }
    }))
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.provider
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
        self.tools = tools.iter().map(to_openai_tool).collect();
        self.system_instruction = system_instruction.map(String::from);
        self.messages().clear();
        tracing::info!(
            provider = %self.provider,
            model = %self.model,
            tools = self.tools.len(),
            "openai-compatible adapter initialized"
        );
        Ok(())
    }

    async fn send(&mut self, input: ProviderInput) -> Result<Response, ProviderError> {
        self.push_input(input)?;
        let request = self.build_request(self.request_messages()?, true)?;
        let client = &self.client;
        let response = self
            .retry
            .run("openai.chat", || {
                let request = request.clone();
                async move { client.chat().create(request).await.map_err(map_openai_error) }
            })
            .await?;

        if let Some(usage) = &response.usage {
            tracing::debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "openai usage"
            );
        }
        let message = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| ProviderError::Parse("response has no choices".to_string()))?;

        let function_calls = from_openai_calls(message.tool_calls.unwrap_or_default());
        let content = message.content.filter(|c| !c.is_empty());
        let assistant = assistant_message(content.as_deref().unwrap_or(""), &function_calls)
            .map_err(map_openai_error)?;
        self.messages().push(assistant);

        Ok(Response {
            content,
            function_calls,
        })
    }

    async fn send_stream(&mut self, input: ProviderInput) -> Result<ResponseStream, ProviderError> {
        self.push_input(input)?;
        let request = self.build_request(self.request_messages()?, true)?;
        let inner = self.open_stream(request).await?;
        Ok(response_stream(StreamState {
            inner,
            text: String::new(),
            calls: BTreeMap::new(),
            messages: self.messages.clone(),
            finished: false,
        }))
    }

    async fn complete_stream(
        &self,
        system_instruction: &str,
        prompt: &str,
    ) -> Result<ResponseStream, ProviderError> {
        let messages = vec![
            system_message(system_instruction)?,
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(prompt)
                    .build()
                    .map_err(map_openai_error)?,
            ),
        ];
        let request = self.build_request(messages, false)?;
        let inner = self.open_stream(request).await?;
        // 独立的上下文，不写回会话
        Ok(response_stream(StreamState {
            inner,
            text: String::new(),
            calls: BTreeMap::new(),
            messages: Arc::new(Mutex::new(Vec::new())),
            finished: false,
        }))
    }

    fn format_tool_results(&self, results: &[ToolResult]) -> ProviderPayload {
        let replies: Vec<ToolReply> = results
            .iter()
            .map(|r| ToolReply {
                tool_call_id: r.id.clone(),
                content: r.result.clone(),
            })
            .collect();
        ProviderPayload::new(serde_json::to_value(replies).unwrap_or(Value::Array(Vec::new())))
    }

    async fn settle_pending_calls(&mut self, completed: &[ToolResult], reason: &str) -> usize {
        let mut messages = self.messages();
        let mut settled = 0;
        for id in pending_call_ids(&messages) {
            let content = completed
                .iter()
                .find(|r| r.id == id)
                .map_or(reason, |r| r.result.as_str());
            match tool_message(&id, content) {
                Ok(message) => {
                    messages.push(message);
                    settled += 1;
                }
                Err(e) => tracing::warn!(id = %id, error = %e, "failed to settle tool call"),
            }
        }
        settled
    }

    async fn clear_history(&mut self) {
        self.messages().clear();
    }

    fn history_len(&self) -> usize {
        self.messages().len()
    }
}
