//! read_file：读取文件内容，带 1 起始行号
//!
//! 可选 start_line / end_line（闭区间，end 超出文件末尾时截断到末尾）。

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::ToolError;
use crate::tools::schema::{parameters_schema, parse_args};
use crate::tools::{PathSandbox, Tool};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadFileArgs {
    /// Path to the file to read (relative to the workspace or absolute)
    pub file_path: String,
    /// Optional first line to return (1-indexed)
    pub start_line: Option<usize>,
    /// Optional last line to return (1-indexed, inclusive)
    pub end_line: Option<usize>,
}

pub struct ReadFileTool {
    sandbox: PathSandbox,
    max_bytes: u64,
}

impl ReadFileTool {
    pub fn new(sandbox: PathSandbox) -> Self {
        Self {
            sandbox,
            max_bytes: 10 * 1024 * 1024,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub async fn read(&self, args: ReadFileArgs) -> Result<String, ToolError> {
        let path = self.sandbox.resolve(&args.file_path)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| ToolError::from_io(&path, e))?;
        if !meta.is_file() {
            return Err(ToolError::Validation(format!(
                "not a regular file: {}",
                args.file_path
            )));
        }
        if meta.len() > self.max_bytes {
            return Err(ToolError::Validation(format!(
                "file too large: {} bytes (max {})",
                meta.len(),
                self.max_bytes
            )));
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ToolError::from_io(&path, e))?;
        let content = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = content.lines().collect();
        let (start, end) = line_window(args.start_line, args.end_line, lines.len())?;

        tracing::info!(path = %path.display(), start, end, "read_file");

        if lines.is_empty() {
            return Ok("(empty file)".to_string());
        }
        let mut out = String::new();
        for (i, line) in lines[start - 1..end].iter().enumerate() {
            out.push_str(&format!("{:4}: {}\n", start + i, line));
        }
        Ok(out)
    }
}

/// 计算 1 起始闭区间 [start, end]；空文件且未指定范围时返回 (1, 0)
pub(crate) fn line_window(
    start_line: Option<usize>,
    end_line: Option<usize>,
    total: usize,
) -> Result<(usize, usize), ToolError> {
    let start = start_line.unwrap_or(1);
    if start == 0 {
        return Err(ToolError::InvalidRange("start_line is 1-indexed".to_string()));
    }
    if let Some(end) = end_line {
        if start > end {
            return Err(ToolError::InvalidRange(format!(
                "start_line {} is after end_line {}",
                start, end
            )));
        }
    }
    if total == 0 && start_line.is_none() && end_line.is_none() {
        return Ok((1, 0));
    }
    if start > total {
        return Err(ToolError::InvalidRange(format!(
            "start_line {} exceeds file length {}",
            start, total
        )));
    }
    let end = end_line.unwrap_or(total).min(total);
    Ok((start, end))
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. Returns lines prefixed with 1-indexed line numbers. \
         Use start_line / end_line to read part of a large file."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<ReadFileArgs>()
    }

    fn is_read_only(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        self.read(parse_args(args)?).await
    }
}
