//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找。
//! `execute` 永不返回错误：工具失败、超时与未知工具都转成 "Error: ..." 文本交回模型，编排循环不会因单个工具崩溃；
//! 每次调用输出结构化审计日志（JSON）。注册完成后只读，可跨任务并发查找。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;

use crate::config::ToolsConfig;
use crate::core::ToolError;
use crate::tools::{
    BashTool, EditFileTool, GlobFilesTool, GrepFilesTool, PathSandbox, ReadFileTool, WriteFileTool,
};

/// 与后端无关的工具声明，初始化时一次性交给 Provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON Schema（type=object，含 properties / required）
    pub parameters: Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（模型 tool call 中的 name）
    fn name(&self) -> &str;

    /// 工具描述（供模型理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema
    fn parameters_schema(&self) -> Value;

    /// 只读工具可被权限策略自动放行
    fn is_read_only(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError>;

    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    call_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            call_timeout: Duration::from_secs(ToolsConfig::default().call_timeout_secs),
        }
    }

    /// 注册六个内置工具，共享同一个路径沙箱
    pub fn with_builtin_tools(config: &ToolsConfig) -> Self {
        let sandbox = PathSandbox::new(config.root.as_deref(), &config.base_dir);
        let mut registry = Self::new().with_call_timeout(Duration::from_secs(config.call_timeout_secs));
        registry.register(ReadFileTool::new(sandbox.clone()).with_max_bytes(config.max_read_bytes));
        registry.register(WriteFileTool::new(sandbox.clone()));
        registry.register(EditFileTool::new(sandbox.clone()));
        registry.register(GlobFilesTool::new(sandbox.clone()).with_max_results(config.glob_max_results));
        registry.register(
            GrepFilesTool::new(sandbox.clone())
                .with_limits(config.grep_max_matches, config.grep_max_files),
        );
        registry.register(BashTool::new(
            sandbox,
            config.bash_default_timeout_secs,
            config.bash_max_timeout_secs,
        ));
        tracing::info!(count = registry.tools.len(), "builtin tools registered");
        registry
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_read_only(&self, name: &str) -> bool {
        self.tools.get(name).map(|t| t.is_read_only()).unwrap_or(false)
    }

    /// 全部工具声明，按名称排序
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        let mut decls: Vec<ToolDeclaration> = self.tools.values().map(|t| t.declaration()).collect();
        decls.sort_by(|a, b| a.name.cmp(&b.name));
        decls
    }

    /// 带类型错误的执行（直接调用方使用，如上下文文件读取）
    pub async fn try_execute(&self, name: &str, args: Value) -> Result<String, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::Validation(format!("Unknown tool: {}", name)))?;

        let start = Instant::now();
        let preview = args_preview(&args);
        let result = match timeout(self.call_timeout, tool.execute(args)).await {
            Ok(r) => r,
            Err(_) => Err(ToolError::Timeout(self.call_timeout.as_secs())),
        };

        let outcome = match &result {
            Ok(_) => "ok".to_string(),
            Err(e) => format!("{:?}", e.kind()),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit, "tool");
        result
    }

    /// 模型路径上的执行：任何失败都转为 "Error: ..." 文本
    pub async fn execute(&self, name: &str, args: Value) -> String {
        if !self.tools.contains_key(name) {
            tracing::warn!(tool = %name, "unknown tool requested");
            return format!("Error: Unknown tool: {}", name);
        }
        match self.try_execute(name, args).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "tool failed");
                format!("Error: {}", e)
            }
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "boom"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        fn parameters_schema(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {}, "required": []})
        }

        async fn execute(&self, _args: Value) -> Result<String, ToolError> {
            Err(ToolError::CommandExecution("exploded".into()))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "sleeps"
        }

        fn parameters_schema(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {}, "required": []})
        }

        async fn execute(&self, _args: Value) -> Result<String, ToolError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".into())
        }
    }

    #[tokio::test]
    async fn test_errors_become_text() {
        let mut registry = ToolRegistry::new();
        registry.register(FailingTool);

        let out = registry.execute("boom", Value::Null).await;
        assert!(out.starts_with("Error: "));
        assert!(out.contains("exploded"));

        let out = registry.execute("nope", Value::Null).await;
        assert_eq!(out, "Error: Unknown tool: nope");
    }

    #[tokio::test]
    async fn test_outer_timeout() {
        let mut registry = ToolRegistry::new().with_call_timeout(Duration::from_millis(50));
        registry.register(SlowTool);
        let err = registry.try_execute("slow", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), crate::core::ToolErrorKind::Timeout);
    }

    #[test]
    fn test_builtin_declarations() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::with_builtin_tools(&ToolsConfig::rooted_at(dir.path()));
        let names: Vec<String> = registry.declarations().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec!["bash", "edit_file", "glob_files", "grep_files", "read_file", "write_file"]
        );
        assert!(registry.is_read_only("read_file"));
        assert!(!registry.is_read_only("bash"));

        let read = registry.get("read_file").unwrap().declaration();
        assert_eq!(read.parameters["required"], serde_json::json!(["file_path"]));
    }
}
