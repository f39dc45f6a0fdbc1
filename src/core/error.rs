//! 错误分类
//!
//! - ToolError：工具层（参数校验、路径逃逸、文件 IO、命令执行），由注册表统一转为 "Error: ..." 文本
//! - ProviderError：模型后端；限流 / 超时 / 连接属于瞬时错误，会被重试
//! - ConfigurationError：启动期致命错误（缺少凭据、未知后端）
//! - EngineError：单轮对话的终止性错误
//! - HistoryError：历史存储（仅内部记录日志，不会中断对话）
//! - CheckpointError：文件快照的创建与恢复

use std::path::PathBuf;

use thiserror::Error;

/// 工具错误的种类（日志与测试断言用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    Validation,
    PathTraversal,
    NotFound,
    PermissionDenied,
    InvalidRange,
    FileOperation,
    CommandExecution,
    Timeout,
}

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Path traversal rejected: {0}")]
    PathTraversal(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("File operation failed on {path}: {source}")]
    FileOperation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution failed: {0}")]
    CommandExecution(String),

    #[error("Command timed out after {0}s")]
    Timeout(u64),
}

impl ToolError {
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            ToolError::Validation(_) => ToolErrorKind::Validation,
            ToolError::PathTraversal(_) => ToolErrorKind::PathTraversal,
            ToolError::NotFound(_) => ToolErrorKind::NotFound,
            ToolError::PermissionDenied(_) => ToolErrorKind::PermissionDenied,
            ToolError::InvalidRange(_) => ToolErrorKind::InvalidRange,
            ToolError::FileOperation { .. } => ToolErrorKind::FileOperation,
            ToolError::CommandExecution(_) => ToolErrorKind::CommandExecution,
            ToolError::Timeout(_) => ToolErrorKind::Timeout,
        }
    }

    /// 按 io::ErrorKind 把底层 IO 错误归类（NotFound / PermissionDenied 单独成类）
    pub fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => ToolError::NotFound(path.display().to_string()),
            std::io::ErrorKind::PermissionDenied => {
                ToolError::PermissionDenied(path.display().to_string())
            }
            _ => ToolError::FileOperation { path, source },
        }
    }
}

/// 模型后端错误
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Permission denied by provider: {0}")]
    PermissionDenied(String),

    #[error("Provider API error: {0}")]
    Api(String),

    #[error("Failed to parse provider response: {0}")]
    Parse(String),
}

impl ProviderError {
    /// 限流 / 超时 / 连接错误可重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_) | ProviderError::Timeout(_) | ProviderError::Connection(_)
        )
    }

    /// 按 HTTP 状态码归类
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => ProviderError::RateLimited(body),
            408 | 504 => ProviderError::Timeout(body),
            401 | 403 => ProviderError::PermissionDenied(body),
            400 | 404 | 413 | 422 => ProviderError::InvalidRequest(body),
            502 | 503 | 529 => ProviderError::Connection(body),
            _ => ProviderError::Api(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            ProviderError::Connection(e.to_string())
        } else if e.is_decode() {
            ProviderError::Parse(e.to_string())
        } else if let Some(status) = e.status() {
            ProviderError::from_status(status.as_u16(), e.to_string())
        } else {
            ProviderError::Api(e.to_string())
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum ConfigurationError {
    #[error("No API key found for provider '{provider}'. Set {env_var} or llm.api_key")]
    MissingApiKey { provider: String, env_var: String },

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// 单轮对话终止错误
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine not initialized. Call initialize() first")]
    NotInitialized,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Tool loop exceeded {0} rounds")]
    ToolLoopLimit(usize),

    #[error("Turn cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("No active session")]
    NoActiveSession,
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    #[error("Snapshot corrupted for {0}: hash mismatch")]
    Corrupted(String),

    #[error(transparent)]
    Path(#[from] ToolError),

    #[error("Checkpoints are disabled")]
    Disabled,
}

impl CheckpointError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CheckpointError::Io {
            path: path.into(),
            source,
        }
    }
}
