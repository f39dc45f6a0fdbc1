//! 核心编排层：错误分类、权限、阶段状态、过程事件与对话引擎

pub mod engine;
pub mod error;
pub mod events;
pub mod permission;
pub mod state;

pub use engine::{Engine, EngineBuilder, PERMISSION_DENIED_RESULT};
pub use error::{
    CheckpointError, ConfigurationError, EngineError, HistoryError, ProviderError, ToolError,
    ToolErrorKind,
};
pub use events::EngineEvent;
pub use permission::{
    AllowAll, DenyAll, FnPermission, PermissionError, PermissionGate, PermissionPolicy,
};
pub use state::EnginePhase;
