//! 单轮对话中的过程事件：流式文本、工具调用与结果，供 CLI / 前端展示

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

/// 工具结果预览的最大字符数
pub const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// 模型输出的一段文本
    TextChunk { text: String },
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    ToolResult { tool: String, preview: String },
    PermissionDenied { tool: String },
    /// 写文件前自动建立的检查点
    Checkpoint { id: String, files: usize },
    Done,
    Error { text: String },
}

pub(crate) fn send_event(tx: Option<&UnboundedSender<EngineEvent>>, ev: EngineEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

pub(crate) fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        out.push_str("...");
    }
    out
}
