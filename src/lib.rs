//! Scout - 终端编码助手
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量 `SCOUT__*`）
//! - **core**: 错误分类、权限门、引擎状态机（请求 → 工具调用 → 回传结果 → 最终文本）
//! - **llm**: 模型后端适配层（OpenAI 兼容 / Anthropic / 脚本化回放）与重试
//! - **memory**: 会话历史（SQLite）、文件检查点、Token 估算
//! - **prompts**: 系统指令与 FIM 补全模板
//! - **tools**: 六个本地工具（读/写/编辑文件、glob、grep、bash）与注册表

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod prompts;
pub mod tools;

pub use crate::core::{Engine, EngineBuilder, EngineError, EngineEvent, EnginePhase};
pub use crate::llm::{create_adapter, ProviderAdapter};
pub use crate::memory::{HistoryStore, Session};
pub use crate::tools::ToolRegistry;
