//! glob_files：按 glob 模式查找文件
//!
//! 前 SORT_WINDOW 个匹配按修改时间倒序，其余保持遍历顺序追加；返回列表受 max_results 限制，并报告省略数量。

use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::ToolError;
use crate::tools::schema::{parameters_schema, parse_args};
use crate::tools::{PathSandbox, Tool};

/// 只对前 N 个匹配取 mtime 排序
const SORT_WINDOW: usize = 1000;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GlobFilesArgs {
    /// Glob pattern, e.g. "**/*.rs" or "src/*.toml"
    pub pattern: String,
    /// Directory to search in (defaults to the workspace)
    pub path: Option<String>,
}

pub struct GlobFilesTool {
    sandbox: PathSandbox,
    max_results: usize,
}

impl GlobFilesTool {
    pub fn new(sandbox: PathSandbox) -> Self {
        Self {
            sandbox,
            max_results: 100,
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    pub async fn glob(&self, args: GlobFilesArgs) -> Result<String, ToolError> {
        if args.pattern.trim().is_empty() {
            return Err(ToolError::Validation("pattern must not be empty".to_string()));
        }
        let search_dir = self.sandbox.resolve(args.path.as_deref().unwrap_or("."))?;
        if !search_dir.is_dir() {
            return Err(ToolError::NotFound(format!(
                "directory {}",
                args.path.as_deref().unwrap_or(".")
            )));
        }

        let full_pattern = search_dir.join(&args.pattern).to_string_lossy().to_string();
        let sandbox = self.sandbox.clone();
        let matches = tokio::task::spawn_blocking(move || collect_matches(&sandbox, &full_pattern))
            .await
            .map_err(|e| ToolError::CommandExecution(format!("glob task failed: {}", e)))??;

        tracing::info!(pattern = %args.pattern, found = matches.len(), "glob_files");

        if matches.is_empty() {
            return Ok(format!("No files found matching: {}", args.pattern));
        }
        let total = matches.len();
        let shown: Vec<String> = matches
            .iter()
            .take(self.max_results)
            .map(|p| self.sandbox.display(p))
            .collect();
        let mut out = format!("Found {} file(s):\n{}", total, shown.join("\n"));
        if total > self.max_results {
            out.push_str(&format!("\n... and {} more", total - self.max_results));
        }
        Ok(out)
    }
}

fn collect_matches(sandbox: &PathSandbox, pattern: &str) -> Result<Vec<PathBuf>, ToolError> {
    let paths = glob::glob(pattern)
        .map_err(|e| ToolError::Validation(format!("invalid glob pattern: {}", e)))?;

    let mut matches: Vec<PathBuf> = paths
        .filter_map(|p| p.ok())
        .filter(|p| match sandbox.root() {
            Some(root) => p.canonicalize().map(|c| c.starts_with(root)).unwrap_or(false),
            None => true,
        })
        .collect();

    let window = matches.len().min(SORT_WINDOW);
    let mut head: Vec<(SystemTime, PathBuf)> = matches
        .drain(..window)
        .map(|p| {
            let mtime = std::fs::metadata(&p)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (mtime, p)
        })
        .collect();
    head.sort_by(|a, b| b.0.cmp(&a.0));

    let mut sorted: Vec<PathBuf> = head.into_iter().map(|(_, p)| p).collect();
    sorted.append(&mut matches);
    Ok(sorted)
}

#[async_trait]
impl Tool for GlobFilesTool {
    fn name(&self) -> &str {
        "glob_files"
    }

    fn description(&self) -> &str {
        "Find files matching a glob pattern (supports ** for recursive matching). \
         Results are ordered by modification time, newest first."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<GlobFilesArgs>()
    }

    fn is_read_only(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        self.glob(parse_args(args)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_glob_newest_first_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        for name in ["a.rs", "b.rs", "c.rs"] {
            std::fs::write(dir.path().join("src").join(name), "x").unwrap();
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        std::fs::write(dir.path().join("notes.md"), "x").unwrap();

        let tool = GlobFilesTool::new(PathSandbox::rooted(dir.path())).with_max_results(2);
        let out = tool.execute(serde_json::json!({"pattern": "**/*.rs"})).await.unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "Found 3 file(s):");
        assert!(lines[1].ends_with("c.rs"));
        assert!(lines[2].ends_with("b.rs"));
        assert_eq!(lines[3], "... and 1 more");
    }

    #[tokio::test]
    async fn test_glob_no_match_and_escape() {
        let dir = tempfile::tempdir().unwrap();
        let tool = GlobFilesTool::new(PathSandbox::rooted(dir.path()));
        let out = tool.execute(serde_json::json!({"pattern": "*.nothing"})).await.unwrap();
        assert_eq!(out, "No files found matching: *.nothing");

        let err = tool
            .execute(serde_json::json!({"pattern": "*", "path": "../"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::core::ToolErrorKind::PathTraversal);
    }
}
