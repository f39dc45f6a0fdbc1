//! 模型后端抽象
//!
//! 每个后端自行维护会话上下文（消息列表），并负责把一批工具结果整形成自己的格式；
//! 编排层只依赖本 trait，不按后端类型分支。

use async_trait::async_trait;

use crate::core::ProviderError;
use crate::llm::{
    ProviderCapabilities, ProviderInput, ProviderPayload, Response, ResponseStream, ToolResult,
};
use crate::tools::ToolDeclaration;

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities;

    /// 声明可用工具与系统指令；会清空已有上下文
    async fn initialize(
        &mut self,
        tools: &[ToolDeclaration],
        system_instruction: Option<&str>,
    ) -> Result<(), ProviderError>;

    /// 非流式发送；输入与响应都会追加到上下文
    async fn send(&mut self, input: ProviderInput) -> Result<Response, ProviderError>;

    /// 流式发送：先产出文本增量，若有工具调用则最后产出一个 ToolCalls
    async fn send_stream(&mut self, input: ProviderInput) -> Result<ResponseStream, ProviderError>;

    /// 单次无工具、无上下文的补全（行内补全用），不影响会话
    async fn complete_stream(
        &self,
        system_instruction: &str,
        prompt: &str,
    ) -> Result<ResponseStream, ProviderError>;

    /// 把一轮的全部工具结果整形成本后端的批量格式（顺序与调用一致）
    fn format_tool_results(&self, results: &[ToolResult]) -> ProviderPayload;

    /// 轮次中断后补齐上下文：最近一条助手消息里尚无结果的工具调用，
    /// 用 completed 中同 id 的结果或 reason 作为结果写入。返回补齐的个数
    async fn settle_pending_calls(&mut self, completed: &[ToolResult], reason: &str) -> usize;

    async fn clear_history(&mut self);

    fn history_len(&self) -> usize;
}
