//! 对话编排引擎
//!
//! 一轮对话：用户消息（可附上下文文件）→ 模型 → 若请求工具则逐个鉴权并执行 →
//! 整批结果回灌 → 直到模型只返回文本。阶段通过 watch 通道发布，过程事件通过
//! mpsc 发给前端；历史在轮次边界写入。获批的 write_file / edit_file 执行前
//! 先为目标文件建检查点。

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::core::events::{preview, send_event, EngineEvent};
use crate::core::permission::{PermissionGate, PermissionPolicy};
use crate::core::state::EnginePhase;
use crate::core::{CheckpointError, ConfigurationError, EngineError, ToolError};
use crate::llm::{
    ProviderAdapter, ProviderInfo, ProviderInput, ResponseChunk, ToolCall, ToolResult,
};
use crate::memory::{Checkpoint, CheckpointKind, CheckpointStore, HistoryStore, Role};
use crate::prompts::{build_fim_prompt, FimRequest, INLINE_SYSTEM_INSTRUCTION};
use crate::tools::{PathSandbox, ToolDeclaration, ToolRegistry};

/// 被拒绝的工具调用回灌给模型的结果
pub const PERMISSION_DENIED_RESULT: &str = "Operation cancelled by user";

/// 上下文文件的默认大小上限，与 read_file 一致
pub const DEFAULT_CONTEXT_MAX_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TurnMode {
    Streaming,
    Blocking,
}

pub struct Engine {
    provider: Box<dyn ProviderAdapter>,
    registry: Arc<ToolRegistry>,
    history: Option<HistoryStore>,
    checkpoints: Option<CheckpointStore>,
    auto_snapshot: bool,
    permission: Option<PermissionPolicy>,
    system_instruction: Option<String>,
    workspace: PathSandbox,
    context_max_bytes: u64,
    config: EngineConfig,
    history_budget: usize,
    phase_tx: watch::Sender<EnginePhase>,
    event_tx: Option<mpsc::UnboundedSender<EngineEvent>>,
    cancel: CancellationToken,
    initialized: bool,
}

pub struct EngineBuilder {
    config: EngineConfig,
    provider: Option<Box<dyn ProviderAdapter>>,
    registry: Option<Arc<ToolRegistry>>,
    history: Option<HistoryStore>,
    checkpoints: Option<CheckpointStore>,
    auto_snapshot: bool,
    gate: Option<Arc<dyn PermissionGate>>,
    auto_approve_read_only: bool,
    system_instruction: Option<String>,
    workspace: Option<PathSandbox>,
    context_max_bytes: u64,
    history_budget: usize,
    event_tx: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            provider: None,
            registry: None,
            history: None,
            checkpoints: None,
            auto_snapshot: true,
            gate: None,
            auto_approve_read_only: false,
            system_instruction: None,
            workspace: None,
            context_max_bytes: DEFAULT_CONTEXT_MAX_BYTES,
            history_budget: 0,
            event_tx: None,
        }
    }

    pub fn with_provider(mut self, provider: Box<dyn ProviderAdapter>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_history(mut self, history: HistoryStore) -> Self {
        self.history = Some(history);
        self
    }

    /// 未设置时不建检查点
    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// 关闭后只保留手动检查点
    pub fn with_auto_snapshot(mut self, enabled: bool) -> Self {
        self.auto_snapshot = enabled;
        self
    }

    /// 未设置时所有工具调用直接放行
    pub fn with_permission(mut self, gate: Arc<dyn PermissionGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_auto_approve_read_only(mut self, enabled: bool) -> Self {
        self.auto_approve_read_only = enabled;
        self
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    /// 上下文文件的解析基准，必填
    pub fn with_workspace(mut self, workspace: PathSandbox) -> Self {
        self.workspace = Some(workspace);
        self
    }

    /// 超过该字节数的上下文文件告警后跳过
    pub fn with_context_limit(mut self, max_bytes: u64) -> Self {
        self.context_max_bytes = max_bytes;
        self
    }

    /// 每轮结束后把历史裁剪到该 token 数；0 不裁剪
    pub fn with_history_budget(mut self, max_tokens: usize) -> Self {
        self.history_budget = max_tokens;
        self
    }

    pub fn with_event_tx(mut self, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        let provider = self.provider.ok_or_else(|| {
            ConfigurationError::Invalid("engine requires a provider adapter".to_string())
        })?;
        let workspace = self.workspace.ok_or_else(|| {
            ConfigurationError::Invalid("engine requires a workspace".to_string())
        })?;
        let permission = self.gate.map(|gate| {
            PermissionPolicy::new(gate).with_auto_approve_read_only(self.auto_approve_read_only)
        });
        let (phase_tx, _) = watch::channel(EnginePhase::Idle);

        Ok(Engine {
            provider,
            registry: self.registry.unwrap_or_default(),
            history: self.history,
            checkpoints: self.checkpoints,
            auto_snapshot: self.auto_snapshot,
            permission,
            system_instruction: self.system_instruction,
            workspace,
            context_max_bytes: self.context_max_bytes,
            config: self.config,
            history_budget: self.history_budget,
            phase_tx,
            event_tx: self.event_tx,
            cancel: CancellationToken::new(),
            initialized: false,
        })
    }
}

/// 中断的轮次里未执行的工具调用回灌给模型的结果
fn interrupted_result(error: &EngineError) -> String {
    match error {
        EngineError::ToolLoopLimit(max) => {
            format!("Operation cancelled: tool round limit ({}) reached", max)
        }
        EngineError::Cancelled => "Operation cancelled: turn interrupted".to_string(),
        other => format!("Operation aborted: {}", other),
    }
}

/// 取消令牌触发时以 Cancelled 结束
async fn guarded<T>(token: &CancellationToken, fut: impl Future<Output = T>) -> Result<T, EngineError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(EngineError::Cancelled),
        value = fut => Ok(value),
    }
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// 向后端声明工具与系统指令，并开启历史会话
    pub async fn initialize(&mut self) -> Result<(), EngineError> {
        self.initialize_provider().await?;
        let model = self.provider.model().to_string();
        if let Some(history) = self.history.as_mut() {
            history.start_session(&model);
        }
        self.initialized = true;
        tracing::info!(
            provider = %self.provider.name(),
            model = %model,
            tools = self.registry.tool_names().len(),
            "engine initialized"
        );
        Ok(())
    }

    async fn initialize_provider(&mut self) -> Result<(), EngineError> {
        let declarations = self.registry.declarations();
        self.provider
            .initialize(&declarations, self.system_instruction.as_deref())
            .await?;
        Ok(())
    }

    /// 流式发送：文本片段以 TextChunk 事件实时转发，返回整轮累积文本
    pub async fn send(&mut self, message: &str, context_files: &[PathBuf]) -> Result<String, EngineError> {
        self.run_turn(message, context_files, TurnMode::Streaming).await
    }

    /// 非流式发送，循环语义与 send 相同
    pub async fn send_sync(&mut self, message: &str, context_files: &[PathBuf]) -> Result<String, EngineError> {
        self.run_turn(message, context_files, TurnMode::Blocking).await
    }

    async fn run_turn(
        &mut self,
        message: &str,
        context_files: &[PathBuf],
        mode: TurnMode,
    ) -> Result<String, EngineError> {
        if !self.initialized {
            return Err(EngineError::NotInitialized);
        }
        tracing::info!(chars = message.len(), context_files = context_files.len(), "turn started");

        let full_message = self.with_context(message, context_files).await;
        self.record(Role::User, message, None);

        let token = self.cancel.clone();
        let mut text = String::new();
        let outcome = self.drive(full_message, mode, &token, &mut text).await;
        self.set_phase(EnginePhase::Idle);

        match outcome {
            Ok(()) => {
                if !text.is_empty() {
                    self.record(Role::Model, &text, None);
                }
                self.prune_history();
                send_event(self.event_tx.as_ref(), EngineEvent::Done);
                tracing::info!(chars = text.len(), "turn complete");
                Ok(text)
            }
            Err(e) => {
                if !text.is_empty() {
                    self.record(
                        Role::Model,
                        &text,
                        Some(serde_json::json!({ "incomplete": true })),
                    );
                }
                self.prune_history();
                if matches!(e, EngineError::Cancelled) {
                    self.cancel = CancellationToken::new();
                }
                send_event(
                    self.event_tx.as_ref(),
                    EngineEvent::Error { text: e.to_string() },
                );
                tracing::error!(error = %e, partial_chars = text.len(), "turn failed");
                Err(e)
            }
        }
    }

    /// 轮次失败时，后端上下文里可能留有未回答的工具调用；补齐后下一轮才能正常发送
    async fn drive(
        &mut self,
        full_message: String,
        mode: TurnMode,
        token: &CancellationToken,
        text: &mut String,
    ) -> Result<(), EngineError> {
        let mut completed = Vec::new();
        let outcome = self
            .drive_rounds(full_message, mode, token, text, &mut completed)
            .await;
        if let Err(e) = &outcome {
            let reason = interrupted_result(e);
            let settled = self.provider.settle_pending_calls(&completed, &reason).await;
            if settled > 0 {
                tracing::warn!(settled, executed = completed.len(), error = %e, "settled unanswered tool calls");
            }
        }
        outcome
    }

    async fn drive_rounds(
        &mut self,
        full_message: String,
        mode: TurnMode,
        token: &CancellationToken,
        text: &mut String,
        completed: &mut Vec<ToolResult>,
    ) -> Result<(), EngineError> {
        let mut input = ProviderInput::Text(full_message);
        let mut rounds = 0usize;
        loop {
            self.set_phase(EnginePhase::AwaitingModelResponse);
            let calls = self.model_round(input, mode, token, text).await?;
            if calls.is_empty() {
                return Ok(());
            }

            rounds += 1;
            if rounds > self.config.max_tool_rounds {
                return Err(EngineError::ToolLoopLimit(self.config.max_tool_rounds));
            }
            tracing::debug!(round = rounds, calls = calls.len(), "tool round");

            self.set_phase(EnginePhase::ExecutingTools);
            self.execute_calls(&calls, token, completed).await?;
            input = ProviderInput::ToolResults(self.provider.format_tool_results(completed.as_slice()));
            completed.clear();
        }
    }

    /// 一次模型往返；文本追加到 text，返回本轮请求的工具调用
    async fn model_round(
        &mut self,
        input: ProviderInput,
        mode: TurnMode,
        token: &CancellationToken,
        text: &mut String,
    ) -> Result<Vec<ToolCall>, EngineError> {
        let events = self.event_tx.clone();
        match mode {
            TurnMode::Blocking => {
                let response = guarded(token, self.provider.send(input)).await??;
                if let Some(content) = response.content.filter(|c| !c.is_empty()) {
                    send_event(events.as_ref(), EngineEvent::TextChunk { text: content.clone() });
                    text.push_str(&content);
                }
                Ok(response.function_calls)
            }
            TurnMode::Streaming => {
                let mut stream = guarded(token, self.provider.send_stream(input)).await??;
                let mut calls = Vec::new();
                while let Some(chunk) = guarded(token, stream.next()).await? {
                    match chunk? {
                        ResponseChunk::Text(fragment) => {
                            if fragment.is_empty() {
                                continue;
                            }
                            text.push_str(&fragment);
                            send_event(events.as_ref(), EngineEvent::TextChunk { text: fragment });
                        }
                        ResponseChunk::ToolCalls(batch) => calls.extend(batch),
                    }
                }
                Ok(calls)
            }
        }
    }

    /// 按顺序执行一轮工具调用；每个调用恰好产生一个结果。
    /// 中途取消时 results 保留已完成的部分
    async fn execute_calls(
        &mut self,
        calls: &[ToolCall],
        token: &CancellationToken,
        results: &mut Vec<ToolResult>,
    ) -> Result<(), EngineError> {
        let registry = self.registry.clone();
        let permission = self.permission.clone();
        let events = self.event_tx.clone();

        for call in calls {
            if token.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            send_event(
                events.as_ref(),
                EngineEvent::ToolCall {
                    tool: call.name.clone(),
                    args: call.arguments.clone(),
                },
            );

            let allowed = match &permission {
                Some(policy) => {
                    guarded(token, policy.allows(&registry, &call.name, &call.arguments)).await?
                }
                None => true,
            };

            let result = if allowed {
                self.snapshot_before(call);
                guarded(token, registry.execute(&call.name, call.arguments.clone())).await?
            } else {
                tracing::info!(tool = %call.name, "tool call denied");
                send_event(
                    events.as_ref(),
                    EngineEvent::PermissionDenied {
                        tool: call.name.clone(),
                    },
                );
                PERMISSION_DENIED_RESULT.to_string()
            };

            send_event(
                events.as_ref(),
                EngineEvent::ToolResult {
                    tool: call.name.clone(),
                    preview: preview(&result),
                },
            );
            results.push(ToolResult {
                id: call.id.clone(),
                name: call.name.clone(),
                result,
            });
        }
        Ok(())
    }

    /// 修改类工具执行前为已存在的目标文件建检查点；失败只告警
    fn snapshot_before(&mut self, call: &ToolCall) {
        let kind = match call.name.as_str() {
            "write_file" => CheckpointKind::PreWrite,
            "edit_file" => CheckpointKind::PreEdit,
            _ => return,
        };
        if !self.auto_snapshot {
            return;
        }
        let Some(store) = self.checkpoints.as_mut() else {
            return;
        };
        let Some(raw) = call.arguments.get("file_path").and_then(Value::as_str) else {
            return;
        };
        let path = match self.workspace.resolve(raw) {
            Ok(path) if path.is_file() => path,
            Ok(_) => return,
            Err(e) => {
                tracing::debug!(path = %raw, error = %e, "no checkpoint for unresolvable path");
                return;
            }
        };
        let description = format!("Before {}: {}", call.name, raw);
        match store.create(&[path], &description, kind) {
            Ok(cp) => send_event(
                self.event_tx.as_ref(),
                EngineEvent::Checkpoint {
                    id: cp.checkpoint_id,
                    files: cp.snapshots.len(),
                },
            ),
            Err(e) => tracing::warn!(tool = %call.name, error = %e, "failed to create checkpoint"),
        }
    }

    /// 读取上下文文件并拼到用户消息前；读不到或过大的文件告警后跳过
    async fn with_context(&self, message: &str, context_files: &[PathBuf]) -> String {
        let mut blocks = Vec::new();
        for path in context_files {
            let shown = path.display().to_string();
            match self.read_context_file(&shown).await {
                Ok(content) => blocks.push(format!("=== {} ===\n{}", shown, content)),
                Err(e) => tracing::warn!(path = %shown, error = %e, "skipping context file"),
            }
        }
        if blocks.is_empty() {
            return message.to_string();
        }
        format!(
            "Context files:\n{}\n\nUser request: {}",
            blocks.join("\n\n"),
            message
        )
    }

    async fn read_context_file(&self, path: &str) -> Result<String, ToolError> {
        let resolved = self.workspace.resolve(path)?;
        let meta = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| ToolError::from_io(&resolved, e))?;
        if meta.len() > self.context_max_bytes {
            return Err(ToolError::Validation(format!(
                "file too large: {} bytes (max {})",
                meta.len(),
                self.context_max_bytes
            )));
        }
        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| ToolError::from_io(&resolved, e))
    }

    /// 行内补全：不走工具、不写入会话历史
    pub async fn inline_complete(&mut self, request: FimRequest) -> Result<String, EngineError> {
        let prompt = build_fim_prompt(&request, self.provider.model());
        tracing::info!(
            file = %request.file_path,
            model = %self.provider.model(),
            "inline completion"
        );
        let token = self.cancel.clone();
        let events = self.event_tx.clone();

        self.set_phase(EnginePhase::AwaitingModelResponse);
        let result = async {
            let mut stream =
                guarded(&token, self.provider.complete_stream(INLINE_SYSTEM_INSTRUCTION, &prompt))
                    .await??;
            let mut completion = String::new();
            while let Some(chunk) = guarded(&token, stream.next()).await? {
                if let ResponseChunk::Text(fragment) = chunk? {
                    completion.push_str(&fragment);
                    send_event(events.as_ref(), EngineEvent::TextChunk { text: fragment });
                }
            }
            Ok::<_, EngineError>(completion)
        }
        .await;
        self.set_phase(EnginePhase::Idle);

        if matches!(result, Err(EngineError::Cancelled)) {
            self.cancel = CancellationToken::new();
        }
        result
    }

    /// 直接调用工具（不经模型、不鉴权），返回带类型的错误
    pub async fn execute_tool(&self, name: &str, args: Value) -> Result<String, ToolError> {
        self.registry.try_execute(name, args).await
    }

    /// 替换文件中的 old_text
    pub async fn apply_edit(&self, file_path: &str, old_text: &str, new_text: &str) -> Result<String, ToolError> {
        self.execute_tool(
            "edit_file",
            serde_json::json!({
                "file_path": file_path,
                "old_text": old_text,
                "new_text": new_text,
            }),
        )
        .await
    }

    /// 手动检查点；路径按工作区解析
    pub fn create_checkpoint(&mut self, paths: &[PathBuf], description: &str) -> Result<Checkpoint, CheckpointError> {
        let resolved = paths
            .iter()
            .map(|p| self.workspace.resolve(&p.display().to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        let store = self.checkpoints.as_mut().ok_or(CheckpointError::Disabled)?;
        store.create(&resolved, description, CheckpointKind::Manual)
    }

    /// 恢复检查点中的全部文件，返回恢复的文件数
    pub fn restore_checkpoint(&self, checkpoint_id: &str) -> Result<usize, CheckpointError> {
        let store = self.checkpoints.as_ref().ok_or(CheckpointError::Disabled)?;
        store.restore(checkpoint_id)
    }

    pub fn checkpoints(&self) -> Option<&CheckpointStore> {
        self.checkpoints.as_ref()
    }

    /// 清空后端上下文并开启新的历史会话
    pub async fn clear_history(&mut self) -> Result<(), EngineError> {
        if !self.initialized {
            return Err(EngineError::NotInitialized);
        }
        self.provider.clear_history().await;
        let model = self.provider.model().to_string();
        if let Some(history) = self.history.as_mut() {
            history.start_session(&model);
        }
        tracing::info!("conversation cleared");
        Ok(())
    }

    /// 更换后端：结束当前会话、初始化新后端、开启新会话
    pub async fn switch_provider(&mut self, provider: Box<dyn ProviderAdapter>) -> Result<(), EngineError> {
        let previous = self.provider.name().to_string();
        if let Some(history) = self.history.as_mut() {
            history.end_session();
        }
        self.provider = provider;
        self.initialized = false;
        self.initialize().await?;
        tracing::info!(from = %previous, to = %self.provider.name(), "provider switched");
        Ok(())
    }

    /// 更新系统指令；已初始化时重新初始化后端（会清空后端上下文）
    pub async fn set_system_instruction(&mut self, instruction: impl Into<String>) -> Result<(), EngineError> {
        self.system_instruction = Some(instruction.into());
        if self.initialized {
            self.initialize_provider().await?;
        }
        Ok(())
    }

    pub fn system_instruction(&self) -> Option<&str> {
        self.system_instruction.as_deref()
    }

    pub fn available_tools(&self) -> Vec<ToolDeclaration> {
        self.registry.declarations()
    }

    pub fn provider_info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.provider.name().to_string(),
            model: self.provider.model().to_string(),
            capabilities: self.provider.capabilities(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn phase(&self) -> EnginePhase {
        *self.phase_tx.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<EnginePhase> {
        self.phase_tx.subscribe()
    }

    pub fn history(&self) -> Option<&HistoryStore> {
        self.history.as_ref()
    }

    pub fn history_mut(&mut self) -> Option<&mut HistoryStore> {
        self.history.as_mut()
    }

    /// 当前轮次的取消令牌；被取消的轮次结束后会换新令牌
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn set_phase(&self, phase: EnginePhase) {
        self.phase_tx.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                tracing::debug!(from = %current, to = %phase, "phase");
                *current = phase;
                true
            }
        });
    }

    fn record(&mut self, role: Role, content: &str, metadata: Option<Value>) {
        if let Some(history) = self.history.as_mut() {
            if let Err(e) = history.add_message(role, content, metadata) {
                tracing::warn!(role = role.as_str(), error = %e, "failed to record message");
            }
        }
    }

    fn prune_history(&mut self) {
        if self.history_budget == 0 {
            return;
        }
        if let Some(history) = self.history.as_mut() {
            let removed = history.prune(self.history_budget);
            if removed > 0 {
                tracing::info!(removed, budget = self.history_budget, "history pruned");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::permission::{AllowAll, DenyAll};
    use crate::core::ProviderError;
    use crate::llm::{Response, ScriptStep, ScriptedAdapter};

    fn engine_with(adapter: ScriptedAdapter, dir: &std::path::Path) -> Engine {
        Engine::builder(EngineConfig::default())
            .with_provider(Box::new(adapter))
            .with_registry(Arc::new(ToolRegistry::with_builtin_tools(
                &crate::config::ToolsConfig::rooted_at(dir),
            )))
            .with_history(HistoryStore::ephemeral().unwrap())
            .with_workspace(PathSandbox::rooted(dir))
            .with_permission(Arc::new(AllowAll))
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_provider() {
        let err = Engine::builder(EngineConfig::default()).build().err().unwrap();
        assert!(matches!(err, EngineError::Configuration(ConfigurationError::Invalid(_))));
    }

    #[test]
    fn test_build_requires_workspace() {
        let err = Engine::builder(EngineConfig::default())
            .with_provider(Box::new(ScriptedAdapter::new("m")))
            .build()
            .err()
            .unwrap();
        match err {
            EngineError::Configuration(ConfigurationError::Invalid(msg)) => {
                assert!(msg.contains("workspace"))
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_before_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_with(ScriptedAdapter::new("m"), dir.path());
        assert!(matches!(engine.send("hi", &[]).await, Err(EngineError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_tool_round_then_text() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha\n").unwrap();
        let adapter = ScriptedAdapter::new("m")
            .with_response(Response::tool_calls(vec![ToolCall::new(
                "read_file",
                serde_json::json!({"file_path": "a.txt"}),
            )]))
            .with_response(Response::text("The file says alpha."));
        let log = adapter.log();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = engine_with(adapter, dir.path());
        engine.event_tx = Some(tx);
        engine.initialize().await.unwrap();

        let reply = engine.send("what is in a.txt?", &[]).await.unwrap();
        assert_eq!(reply, "The file says alpha.");
        assert_eq!(engine.phase(), EnginePhase::Idle);

        let log = log.lock().await;
        assert_eq!(log.tool_result_batches(), 1);
        assert!(log.result_batches()[0][0].result.contains("alpha"));

        let session = engine.history().unwrap().current().unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].content, "what is in a.txt?");

        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            kinds.push(ev);
        }
        assert!(matches!(kinds.first(), Some(EngineEvent::ToolCall { .. })));
        assert_eq!(kinds.last(), Some(&EngineEvent::Done));
    }

    #[tokio::test]
    async fn test_denied_call_feeds_cancellation_text() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = ScriptedAdapter::new("m").with_response(Response::tool_calls(vec![
            ToolCall::new("write_file", serde_json::json!({"file_path": "x.txt", "content": "x"})),
        ]));
        let log = adapter.log();
        let mut engine = Engine::builder(EngineConfig::default())
            .with_provider(Box::new(adapter))
            .with_registry(Arc::new(ToolRegistry::with_builtin_tools(
                &crate::config::ToolsConfig::rooted_at(dir.path()),
            )))
            .with_workspace(PathSandbox::rooted(dir.path()))
            .with_permission(Arc::new(DenyAll))
            .build()
            .unwrap();
        engine.initialize().await.unwrap();

        let reply = engine.send("write it", &[]).await.unwrap();
        assert_eq!(reply, format!("Tool results received:\nwrite_file: {}", PERMISSION_DENIED_RESULT));
        assert!(!dir.path().join("x.txt").exists());
        assert_eq!(log.lock().await.tool_result_batches(), 1);
    }

    #[tokio::test]
    async fn test_partial_text_marked_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = ScriptedAdapter::new("m").with_step(ScriptStep::FailMidStream {
            text: "Half an ans".into(),
            error: ProviderError::Api("boom".into()),
        });
        let mut engine = engine_with(adapter, dir.path());
        engine.initialize().await.unwrap();

        let err = engine.send("question", &[]).await.unwrap_err();
        assert!(matches!(err, EngineError::Provider(ProviderError::Api(_))));
        let messages = &engine.history().unwrap().current().unwrap().messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Half an ans");
        assert_eq!(messages[1].metadata, Some(serde_json::json!({"incomplete": true})));
        assert_eq!(engine.phase(), EnginePhase::Idle);
    }

    #[tokio::test]
    async fn test_context_files_prefix_message() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.md"), "remember this").unwrap();
        let adapter = ScriptedAdapter::new("m");
        let log = adapter.log();
        let mut engine = engine_with(adapter, dir.path());
        engine.initialize().await.unwrap();

        engine
            .send("summarize", &[PathBuf::from("notes.md"), PathBuf::from("missing.md")])
            .await
            .unwrap();
        let log = log.lock().await;
        assert_eq!(
            log.inputs[0],
            ProviderInput::Text(
                "Context files:\n=== notes.md ===\nremember this\n\nUser request: summarize".into()
            )
        );
        let session = engine.history().unwrap().current().unwrap();
        assert_eq!(session.messages[0].content, "summarize");
    }

    #[tokio::test]
    async fn test_oversized_context_file_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("small.txt"), "tiny").unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(64)).unwrap();
        let adapter = ScriptedAdapter::new("m");
        let log = adapter.log();
        let mut engine = Engine::builder(EngineConfig::default())
            .with_provider(Box::new(adapter))
            .with_workspace(PathSandbox::rooted(dir.path()))
            .with_context_limit(16)
            .build()
            .unwrap();
        engine.initialize().await.unwrap();

        engine
            .send("go", &[PathBuf::from("big.txt"), PathBuf::from("small.txt")])
            .await
            .unwrap();
        assert_eq!(
            log.lock().await.inputs[0],
            ProviderInput::Text("Context files:\n=== small.txt ===\ntiny\n\nUser request: go".into())
        );
    }

    #[tokio::test]
    async fn test_loop_limit_settles_calls_for_next_turn() {
        let dir = tempfile::tempdir().unwrap();
        let call = ToolCall::new("glob_files", serde_json::json!({"pattern": "*"}));
        let call_id = call.id.clone();
        let adapter = ScriptedAdapter::new("m").with_response(Response::tool_calls(vec![call]));
        let log = adapter.log();
        let mut engine = Engine::builder(EngineConfig { max_tool_rounds: 0 })
            .with_provider(Box::new(adapter))
            .with_workspace(PathSandbox::rooted(dir.path()))
            .build()
            .unwrap();
        engine.initialize().await.unwrap();

        assert!(matches!(engine.send("look", &[]).await, Err(EngineError::ToolLoopLimit(0))));
        assert_eq!(engine.send("hello again", &[]).await.unwrap(), "Echo: hello again");

        let log = log.lock().await;
        assert_eq!(log.settled.len(), 1);
        assert_eq!(log.settled[0].id, call_id);
        assert!(log.settled[0].result.contains("tool round limit"));
    }

    #[tokio::test]
    async fn test_cancelled_turn() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_with(ScriptedAdapter::new("m"), dir.path());
        engine.initialize().await.unwrap();

        engine.cancel_token().cancel();
        assert!(matches!(engine.send("hi", &[]).await, Err(EngineError::Cancelled)));
        assert_eq!(engine.send("hi", &[]).await.unwrap(), "Echo: hi");
    }

    fn engine_with_checkpoints(adapter: ScriptedAdapter, dir: &std::path::Path, auto: bool) -> Engine {
        let store = CheckpointStore::open(dir.join(".scout/checkpoints"), 10).unwrap();
        Engine::builder(EngineConfig::default())
            .with_provider(Box::new(adapter))
            .with_registry(Arc::new(ToolRegistry::with_builtin_tools(
                &crate::config::ToolsConfig::rooted_at(dir),
            )))
            .with_workspace(PathSandbox::rooted(dir))
            .with_checkpoints(store)
            .with_auto_snapshot(auto)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_edit_is_snapshotted_and_restorable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "old\n").unwrap();
        let adapter = ScriptedAdapter::new("m")
            .with_response(Response::tool_calls(vec![
                ToolCall::new(
                    "edit_file",
                    serde_json::json!({"file_path": "a.txt", "old_text": "old", "new_text": "new"}),
                ),
                ToolCall::new("write_file", serde_json::json!({"file_path": "b.txt", "content": "b"})),
            ]))
            .with_response(Response::text("done"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = engine_with_checkpoints(adapter, dir.path(), true);
        engine.event_tx = Some(tx);
        engine.initialize().await.unwrap();

        engine.send("change a, create b", &[]).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "new\n");

        // b.txt 写入前不存在，不建检查点
        let store = engine.checkpoints().unwrap();
        assert_eq!(store.len(), 1);
        let cp = store.latest().unwrap().clone();
        assert_eq!(cp.operation_type, CheckpointKind::PreEdit);
        assert!(cp.description.contains("a.txt"));

        let mut announced = false;
        while let Ok(ev) = rx.try_recv() {
            if ev == (EngineEvent::Checkpoint { id: cp.checkpoint_id.clone(), files: 1 }) {
                announced = true;
            }
        }
        assert!(announced);

        assert_eq!(engine.restore_checkpoint(&cp.checkpoint_id).unwrap(), 1);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "old\n");
    }

    #[tokio::test]
    async fn test_manual_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), "v1").unwrap();
        let adapter = ScriptedAdapter::new("m").with_response(Response::tool_calls(vec![ToolCall::new(
            "write_file",
            serde_json::json!({"file_path": "keep.txt", "content": "v2"}),
        )]));
        let mut engine = engine_with_checkpoints(adapter, dir.path(), false);
        engine.initialize().await.unwrap();

        let cp = engine.create_checkpoint(&[PathBuf::from("keep.txt")], "before rewrite").unwrap();
        assert_eq!(cp.operation_type, CheckpointKind::Manual);
        engine.send("rewrite keep.txt", &[]).await.unwrap();
        assert_eq!(engine.checkpoints().unwrap().len(), 1);

        assert_eq!(engine.restore_checkpoint(&cp.checkpoint_id).unwrap(), 1);
        assert_eq!(std::fs::read_to_string(dir.path().join("keep.txt")).unwrap(), "v1");
        assert!(matches!(
            engine.create_checkpoint(&[PathBuf::from("../outside.txt")], "x"),
            Err(CheckpointError::Path(_))
        ));
        assert!(matches!(engine.restore_checkpoint("cp_missing"), Err(CheckpointError::NotFound(_))));

        let plain = engine_with(ScriptedAdapter::new("m"), dir.path());
        assert!(matches!(plain.restore_checkpoint(&cp.checkpoint_id), Err(CheckpointError::Disabled)));
    }

    #[tokio::test]
    async fn test_inline_complete_skips_history() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = ScriptedAdapter::new("gpt-4o-mini").with_response(Response::text("x + y"));
        let log = adapter.log();
        let mut engine = engine_with(adapter, dir.path());
        engine.initialize().await.unwrap();

        let request = FimRequest::new("def add(x, y):\n    return ", "\n").with_file("m.py", "python");
        assert_eq!(engine.inline_complete(request).await.unwrap(), "x + y");
        assert!(log.lock().await.completions[0].contains("def add(x, y):"));
        assert!(engine.history().unwrap().current().unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_switch_provider_starts_new_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_with(ScriptedAdapter::new("first"), dir.path());
        engine.initialize().await.unwrap();
        engine.send("hello", &[]).await.unwrap();
        let first = engine.history().unwrap().current_session_id().unwrap().to_string();

        engine
            .switch_provider(Box::new(ScriptedAdapter::new("second")))
            .await
            .unwrap();
        let info = engine.provider_info();
        assert_eq!(info.model, "second");
        let session = engine.history().unwrap().current().unwrap();
        assert_ne!(session.session_id, first);
        assert_eq!(session.model, "second");
        assert!(engine.history().unwrap().session(&first).unwrap().is_closed());
    }
}
