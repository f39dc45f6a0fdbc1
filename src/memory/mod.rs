//! 记忆层：会话历史（SQLite 持久化）、文件检查点与 token 估算

pub mod checkpoint;
pub mod history;
pub mod tokens;

pub use checkpoint::{Checkpoint, CheckpointKind, CheckpointStore, FileSnapshot};
pub use history::{HistoryStore, Message, Role, Session, SessionSummary};
pub use tokens::{CharRatioEstimator, MixedScriptEstimator, TokenEstimator};
