//! 工具调用权限
//!
//! 引擎在执行每个工具调用前询问 PermissionGate；返回 false 或出错都视为拒绝。
//! 只读工具可按配置自动放行。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::tools::ToolRegistry;

#[derive(Error, Debug)]
pub enum PermissionError {
    #[error("Permission prompt failed: {0}")]
    Prompt(String),

    #[error("Permission channel closed")]
    Closed,
}

#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn check(&self, tool_name: &str, args: &Value) -> Result<bool, PermissionError>;
}

/// 全部放行
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl PermissionGate for AllowAll {
    async fn check(&self, _tool_name: &str, _args: &Value) -> Result<bool, PermissionError> {
        Ok(true)
    }
}

/// 全部拒绝
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

#[async_trait]
impl PermissionGate for DenyAll {
    async fn check(&self, _tool_name: &str, _args: &Value) -> Result<bool, PermissionError> {
        Ok(false)
    }
}

/// 同步闭包判定
pub struct FnPermission<F>(pub F);

#[async_trait]
impl<F> PermissionGate for FnPermission<F>
where
    F: Fn(&str, &Value) -> bool + Send + Sync,
{
    async fn check(&self, tool_name: &str, args: &Value) -> Result<bool, PermissionError> {
        Ok((self.0)(tool_name, args))
    }
}

/// 引擎持有的权限策略：gate + 只读工具自动放行
#[derive(Clone)]
pub struct PermissionPolicy {
    gate: Arc<dyn PermissionGate>,
    auto_approve_read_only: bool,
}

impl PermissionPolicy {
    pub fn new(gate: Arc<dyn PermissionGate>) -> Self {
        Self {
            gate,
            auto_approve_read_only: false,
        }
    }

    pub fn with_auto_approve_read_only(mut self, enabled: bool) -> Self {
        self.auto_approve_read_only = enabled;
        self
    }

    /// gate 出错按拒绝处理
    pub async fn allows(&self, registry: &ToolRegistry, tool_name: &str, args: &Value) -> bool {
        if self.auto_approve_read_only && registry.is_read_only(tool_name) {
            tracing::debug!(tool = %tool_name, "read-only tool auto-approved");
            return true;
        }
        match self.gate.check(tool_name, args).await {
            Ok(allowed) => allowed,
            Err(e) => {
                tracing::warn!(tool = %tool_name, error = %e, "permission check failed, denying");
                false
            }
        }
    }
}
