//! edit_file：两种互斥模式
//!
//! - 文本替换：old_text 的所有出现替换为 new_text（old_text 不存在时报校验错误，文件不变）
//! - 行区间替换：闭区间 [start_line, end_line] 替换为 new_text（end_line 缺省等于 start_line）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::ToolError;
use crate::tools::schema::{parameters_schema, parse_args};
use crate::tools::{PathSandbox, Tool};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EditFileArgs {
    /// Path of the file to edit
    pub file_path: String,
    /// Replacement text
    pub new_text: String,
    /// Exact text to replace (text mode; every occurrence is replaced)
    pub old_text: Option<String>,
    /// First line of the range to replace (line mode, 1-indexed)
    pub start_line: Option<usize>,
    /// Last line of the range to replace (line mode, inclusive; defaults to start_line)
    pub end_line: Option<usize>,
}

enum EditMode<'a> {
    Text(&'a str),
    Lines { start: usize, end: usize },
}

pub struct EditFileTool {
    sandbox: PathSandbox,
}

impl EditFileTool {
    pub fn new(sandbox: PathSandbox) -> Self {
        Self { sandbox }
    }

    fn mode(args: &EditFileArgs) -> Result<EditMode<'_>, ToolError> {
        let line_mode = args.start_line.is_some() || args.end_line.is_some();
        match (&args.old_text, line_mode) {
            (Some(_), true) => Err(ToolError::Validation(
                "old_text and start_line/end_line are mutually exclusive".to_string(),
            )),
            (Some(old), false) if old.is_empty() => {
                Err(ToolError::Validation("old_text must not be empty".to_string()))
            }
            (Some(old), false) => Ok(EditMode::Text(old)),
            (None, true) => {
                let start = args.start_line.ok_or_else(|| {
                    ToolError::Validation("end_line requires start_line".to_string())
                })?;
                Ok(EditMode::Lines {
                    start,
                    end: args.end_line.unwrap_or(start),
                })
            }
            (None, false) => Err(ToolError::Validation(
                "either old_text or start_line must be provided".to_string(),
            )),
        }
    }

    pub async fn edit(&self, args: EditFileArgs) -> Result<String, ToolError> {
        let mode = Self::mode(&args)?;
        let path = self.sandbox.resolve(&args.file_path)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::from_io(&path, e))?;

        let (new_content, detail) = match mode {
            EditMode::Text(old) => {
                let count = content.matches(old).count();
                if count == 0 {
                    let preview: String = old.chars().take(50).collect();
                    return Err(ToolError::Validation(format!(
                        "Text not found in file: {}...",
                        preview
                    )));
                }
                (
                    content.replace(old, &args.new_text),
                    format!("{} replacement(s)", count),
                )
            }
            EditMode::Lines { start, end } => (
                replace_lines(&content, start, end, &args.new_text)?,
                format!("lines {}-{}", start, end),
            ),
        };

        tokio::fs::write(&path, new_content)
            .await
            .map_err(|e| ToolError::from_io(&path, e))?;
        tracing::info!(path = %path.display(), %detail, "edit_file");
        Ok(format!(
            "Successfully edited {} ({})",
            self.sandbox.display(&path),
            detail
        ))
    }
}

/// 用 new_text 替换闭区间 [start, end]；保留原文件末尾换行
fn replace_lines(content: &str, start: usize, end: usize, new_text: &str) -> Result<String, ToolError> {
    let lines: Vec<&str> = content.lines().collect();
    if start == 0 || start > end {
        return Err(ToolError::InvalidRange(format!(
            "invalid line range {}-{}",
            start, end
        )));
    }
    if end > lines.len() {
        return Err(ToolError::InvalidRange(format!(
            "line range {}-{} exceeds file length {}",
            start,
            end,
            lines.len()
        )));
    }

    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    out.extend_from_slice(&lines[..start - 1]);
    out.extend(new_text.lines());
    out.extend_from_slice(&lines[end..]);

    // 保留原文件的换行风格
    let eol = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let mut joined = out.join(eol);
    if content.ends_with('\n') && !joined.is_empty() {
        joined.push_str(eol);
    }
    Ok(joined)
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit an existing file. Either replace exact text (old_text -> new_text) \
         or replace an inclusive line range (start_line..end_line -> new_text). Use exactly one mode."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<EditFileArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        self.edit(parse_args(args)?).await
    }
}
