//! 脚本化后端（用于测试与离线运行，无需 API）
//!
//! 按顺序回放预先写好的响应；脚本耗尽后回显输入。所有输入记录在共享的 ScriptLog 中，
//! 适配器交给引擎后仍可在测试里检查。
//!
//! 与真实后端一样要求工具调用成对：响应里的调用全部得到结果之前，再发文本会被拒绝。

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::core::ProviderError;
use crate::llm::{
    ProviderAdapter, ProviderCapabilities, ProviderInput, ProviderPayload, Response,
    ResponseChunk, ResponseStream, ToolResult,
};
use crate::tools::ToolDeclaration;

/// 一步脚本
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Respond(Response),
    Fail(ProviderError),
    /// 流式：先产出 text，再产出错误
    FailMidStream { text: String, error: ProviderError },
}

/// format_tool_results 的单条结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptedReply {
    pub id: String,
    pub name: String,
    pub result: String,
}

/// 适配器收到的全部调用
#[derive(Debug, Default, Clone)]
pub struct ScriptLog {
    pub inputs: Vec<ProviderInput>,
    pub completions: Vec<String>,
    pub initialize_calls: usize,
    pub tool_names: Vec<String>,
    pub system_instruction: Option<String>,
    /// settle_pending_calls 补写的结果
    pub settled: Vec<ScriptedReply>,
}

impl ScriptLog {
    /// 收到的工具结果批次数
    pub fn tool_result_batches(&self) -> usize {
        self.result_batches().len()
    }

    /// 每批工具结果，按收到顺序
    pub fn result_batches(&self) -> Vec<Vec<ScriptedReply>> {
        self.inputs
            .iter()
            .filter_map(|i| match i {
                ProviderInput::ToolResults(payload) => Some(replies(payload.as_value())),
                ProviderInput::Text(_) => None,
            })
            .collect()
    }
}

fn replies(value: &Value) -> Vec<ScriptedReply> {
    serde_json::from_value(value.clone()).unwrap_or_default()
}

pub struct ScriptedAdapter {
    model: String,
    steps: Mutex<VecDeque<ScriptStep>>,
    log: Arc<Mutex<ScriptLog>>,
    history_len: usize,
    pending: Vec<String>,
}

impl ScriptedAdapter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            steps: Mutex::new(VecDeque::new()),
            log: Arc::new(Mutex::new(ScriptLog::default())),
            history_len: 0,
            pending: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: ScriptStep) -> Self {
        self.steps.get_mut().push_back(step);
        self
    }

    pub fn with_response(self, response: Response) -> Self {
        self.with_step(ScriptStep::Respond(response))
    }

    /// 共享日志句柄
    pub fn log(&self) -> Arc<Mutex<ScriptLog>> {
        self.log.clone()
    }

    async fn next_step(&self, input: &ProviderInput) -> ScriptStep {
        match self.steps.lock().await.pop_front() {
            Some(step) => step,
            None => ScriptStep::Respond(Response::text(echo(input))),
        }
    }

    /// 上一条响应的工具调用必须恰好由这一批结果回答
    fn check_pairing(&self, input: &ProviderInput) -> Result<(), ProviderError> {
        match input {
            ProviderInput::Text(_) if !self.pending.is_empty() => Err(ProviderError::InvalidRequest(
                "assistant tool_calls must be followed by tool messages".to_string(),
            )),
            ProviderInput::Text(_) => Ok(()),
            ProviderInput::ToolResults(payload) => {
                let answered: Vec<String> = replies(payload.as_value()).into_iter().map(|r| r.id).collect();
                if let Some(id) = answered.iter().find(|id| !self.pending.contains(id)) {
                    return Err(ProviderError::InvalidRequest(format!(
                        "tool result {} does not answer a pending tool call",
                        id
                    )));
                }
                if let Some(id) = self.pending.iter().find(|id| !answered.contains(id)) {
                    return Err(ProviderError::InvalidRequest(format!(
                        "tool call {} has no result",
                        id
                    )));
                }
                Ok(())
            }
        }
    }

    async fn record(&mut self, input: ProviderInput) -> Result<ScriptStep, ProviderError> {
        self.check_pairing(&input)?;
        self.pending.clear();
        let step = self.next_step(&input).await;
        self.log.lock().await.inputs.push(input);
        self.history_len += 1;
        if let ScriptStep::Respond(response) = &step {
            self.history_len += 1;
            self.pending = response.function_calls.iter().map(|c| c.id.clone()).collect();
        }
        Ok(step)
    }
}

fn echo(input: &ProviderInput) -> String {
    match input {
        ProviderInput::Text(text) => format!("Echo: {}", text),
        ProviderInput::ToolResults(payload) => {
            let lines: Vec<String> = replies(payload.as_value())
                .iter()
                .map(|r| format!("{}: {}", r.name, r.result))
                .collect();
            format!("Tool results received:\n{}", lines.join("\n"))
        }
    }
}

fn into_chunks(response: Response) -> Vec<Result<ResponseChunk, ProviderError>> {
    let mut chunks = Vec::new();
    if let Some(text) = response.content.filter(|t| !t.is_empty()) {
        chunks.push(Ok(ResponseChunk::Text(text)));
    }
    if !response.function_calls.is_empty() {
        chunks.push(Ok(ResponseChunk::ToolCalls(response.function_calls)));
    }
    chunks
}

fn step_stream(step: ScriptStep) -> Result<ResponseStream, ProviderError> {
    let chunks = match step {
        ScriptStep::Respond(response) => into_chunks(response),
        ScriptStep::Fail(error) => return Err(error),
        ScriptStep::FailMidStream { text, error } => {
            vec![Ok(ResponseChunk::Text(text)), Err(error)]
        }
    };
    Ok(Box::pin(stream::iter(chunks)))
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
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
        let mut log = self.log.lock().await;
        log.initialize_calls += 1;
        log.tool_names = tools.iter().map(|t| t.name.clone()).collect();
        log.system_instruction = system_instruction.map(String::from);
        self.history_len = 0;
        self.pending.clear();
        Ok(())
    }

    async fn send(&mut self, input: ProviderInput) -> Result<Response, ProviderError> {
        match self.record(input).await? {
            ScriptStep::Respond(response) => Ok(response),
            ScriptStep::Fail(error) | ScriptStep::FailMidStream { error, .. } => Err(error),
        }
    }

    async fn send_stream(&mut self, input: ProviderInput) -> Result<ResponseStream, ProviderError> {
        let step = self.record(input).await?;
        step_stream(step)
    }

    async fn complete_stream(
        &self,
        _system_instruction: &str,
        prompt: &str,
    ) -> Result<ResponseStream, ProviderError> {
        let input = ProviderInput::Text(prompt.to_string());
        let step = self.next_step(&input).await;
        self.log.lock().await.completions.push(prompt.to_string());
        step_stream(step)
    }

    fn format_tool_results(&self, results: &[ToolResult]) -> ProviderPayload {
        let batch: Vec<ScriptedReply> = results
            .iter()
            .map(|r| ScriptedReply {
                id: r.id.clone(),
                name: r.name.clone(),
                result: r.result.clone(),
            })
            .collect();
        ProviderPayload::new(serde_json::to_value(batch).unwrap_or(Value::Array(Vec::new())))
    }

    async fn settle_pending_calls(&mut self, completed: &[ToolResult], reason: &str) -> usize {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return 0;
        }
        let settled: Vec<ScriptedReply> = pending
            .into_iter()
            .map(|id| {
                let done = completed.iter().find(|r| r.id == id);
                ScriptedReply {
                    name: done.map(|r| r.name.clone()).unwrap_or_default(),
                    result: done.map_or_else(|| reason.to_string(), |r| r.result.clone()),
                    id,
                }
            })
            .collect();
        let count = settled.len();
        self.history_len += 1;
        self.log.lock().await.settled.extend(settled);
        count
    }

    async fn clear_history(&mut self) {
        self.history_len = 0;
        self.pending.clear();
    }

    fn history_len(&self) -> usize {
        self.history_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolCall;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_replays_then_echoes() {
        let mut adapter = ScriptedAdapter::new("script-1")
            .with_response(Response::tool_calls(vec![ToolCall::new("bash", serde_json::json!({"command": "ls"}))]));
        let first = adapter.send(ProviderInput::Text("hi".into())).await.unwrap();
        assert_eq!(first.function_calls[0].name, "bash");

        // 调用未回答前不接受新的文本
        let rejected = adapter.send(ProviderInput::Text("again".into())).await.unwrap_err();
        assert!(matches!(rejected, ProviderError::InvalidRequest(_)));

        let payload = adapter.format_tool_results(&[ToolResult {
            id: first.function_calls[0].id.clone(),
            name: "bash".into(),
            result: "listing".into(),
        }]);
        let second = adapter.send(ProviderInput::ToolResults(payload)).await.unwrap();
        assert_eq!(second.content.as_deref(), Some("Tool results received:\nbash: listing"));

        let third = adapter.send(ProviderInput::Text("again".into())).await.unwrap();
        assert_eq!(third.content.as_deref(), Some("Echo: again"));
        assert_eq!(adapter.log().lock().await.inputs.len(), 3);
        assert_eq!(adapter.history_len(), 6);
    }

    #[tokio::test]
    async fn test_settle_unblocks_next_message() {
        let calls = vec![
            ToolCall::new("read_file", serde_json::json!({})),
            ToolCall::new("write_file", serde_json::json!({})),
        ];
        let ids: Vec<String> = calls.iter().map(|c| c.id.clone()).collect();
        let mut adapter = ScriptedAdapter::new("m").with_response(Response::tool_calls(calls));
        adapter.send(ProviderInput::Text("go".into())).await.unwrap();

        let done = [ToolResult { id: ids[0].clone(), name: "read_file".into(), result: "abc".into() }];
        assert_eq!(adapter.settle_pending_calls(&done, "stopped").await, 2);
        assert_eq!(adapter.settle_pending_calls(&done, "stopped").await, 0);

        let log = adapter.log();
        let settled = log.lock().await.settled.clone();
        assert_eq!(settled[0].result, "abc");
        assert_eq!(settled[1].id, ids[1]);
        assert_eq!(settled[1].result, "stopped");
        assert!(adapter.send(ProviderInput::Text("next".into())).await.is_ok());
    }

    #[tokio::test]
    async fn test_partial_results_rejected() {
        let calls = vec![ToolCall::new("bash", serde_json::json!({})), ToolCall::new("bash", serde_json::json!({}))];
        let first_id = calls[0].id.clone();
        let mut adapter = ScriptedAdapter::new("m").with_response(Response::tool_calls(calls));
        adapter.send(ProviderInput::Text("go".into())).await.unwrap();

        let payload = adapter.format_tool_results(&[ToolResult { id: first_id, name: "bash".into(), result: "x".into() }]);
        let err = adapter.send(ProviderInput::ToolResults(payload)).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest(m) if m.contains("has no result")));
    }

    #[tokio::test]
    async fn test_stream_and_format() {
        let mut adapter = ScriptedAdapter::new("m").with_step(ScriptStep::FailMidStream {
            text: "partial".into(),
            error: ProviderError::Connection("reset".into()),
        });
        let mut stream = adapter.send_stream(ProviderInput::Text("x".into())).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), ResponseChunk::Text("partial".into()));
        assert!(stream.next().await.unwrap().is_err());

        let payload = adapter.format_tool_results(&[
            ToolResult { id: "1".into(), name: "read_file".into(), result: "a".into() },
            ToolResult { id: "2".into(), name: "bash".into(), result: "b".into() },
        ]);
        let batch = replies(payload.as_value());
        assert_eq!(batch.len(), 2);
        assert_eq!((batch[0].id.as_str(), batch[0].name.as_str()), ("1", "read_file"));
        assert_eq!((batch[1].id.as_str(), batch[1].result.as_str()), ("2", "b"));
    }
}
