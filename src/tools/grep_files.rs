//! grep_files：在文件中按正则搜索
//!
//! walkdir 遍历（跳过隐藏目录、target、node_modules），file_pattern 按文件名 glob 过滤；
//! 二进制或不可读文件静默跳过并计数；总匹配数与扫描文件数均有上限。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::ToolError;
use crate::tools::schema::{parameters_schema, parse_args};
use crate::tools::{PathSandbox, Tool};

/// 检查前 8 KiB 是否含 NUL 判定二进制
const BINARY_SNIFF_BYTES: usize = 8 * 1024;
const MAX_LINE_CHARS: usize = 300;

fn default_case_sensitive() -> bool {
    true
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GrepFilesArgs {
    /// Regular expression to search for
    pub pattern: String,
    /// Directory or file to search in (defaults to the workspace)
    pub path: Option<String>,
    /// Glob applied to file names, e.g. "*.rs"
    pub file_pattern: Option<String>,
    /// Whether the search is case sensitive (default true)
    #[serde(default = "default_case_sensitive")]
    pub case_sensitive: bool,
}

pub struct GrepFilesTool {
    sandbox: PathSandbox,
    max_matches: usize,
    max_files: usize,
}

#[derive(Debug, Default)]
struct GrepOutcome {
    matches: Vec<String>,
    skipped: usize,
    files_scanned: usize,
    match_cap_hit: bool,
    file_cap_hit: bool,
}

impl GrepFilesTool {
    pub fn new(sandbox: PathSandbox) -> Self {
        Self {
            sandbox,
            max_matches: 100,
            max_files: 500,
        }
    }

    pub fn with_limits(mut self, max_matches: usize, max_files: usize) -> Self {
        self.max_matches = max_matches.max(1);
        self.max_files = max_files.max(1);
        self
    }

    pub async fn grep(&self, args: GrepFilesArgs) -> Result<String, ToolError> {
        let regex = RegexBuilder::new(&args.pattern)
            .case_insensitive(!args.case_sensitive)
            .build()
            .map_err(|e| ToolError::Validation(format!("invalid regex: {}", e)))?;
        let include = args
            .file_pattern
            .as_deref()
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| ToolError::Validation(format!("invalid file_pattern: {}", e)))?;
        let target = self.sandbox.resolve(args.path.as_deref().unwrap_or("."))?;
        if !target.exists() {
            return Err(ToolError::NotFound(target.display().to_string()));
        }

        let sandbox = self.sandbox.clone();
        let (max_matches, max_files) = (self.max_matches, self.max_files);
        let outcome = tokio::task::spawn_blocking(move || {
            search(&sandbox, &target, &regex, include.as_ref(), max_matches, max_files)
        })
        .await
        .map_err(|e| ToolError::CommandExecution(format!("grep task failed: {}", e)))?;

        tracing::info!(
            pattern = %args.pattern,
            matches = outcome.matches.len(),
            files = outcome.files_scanned,
            skipped = outcome.skipped,
            "grep_files"
        );
        Ok(render(&args.pattern, &outcome, max_matches, max_files))
    }
}

fn search(
    sandbox: &PathSandbox,
    target: &Path,
    regex: &Regex,
    include: Option<&glob::Pattern>,
    max_matches: usize,
    max_files: usize,
) -> GrepOutcome {
    let mut outcome = GrepOutcome::default();
    let files: Box<dyn Iterator<Item = PathBuf>> = if target.is_file() {
        Box::new(std::iter::once(target.to_path_buf()))
    } else {
        Box::new(
            walkdir::WalkDir::new(target)
                .into_iter()
                .filter_entry(|e| {
                    let name = e.file_name().to_string_lossy();
                    e.depth() == 0
                        || !(name.starts_with('.') || name == "target" || name == "node_modules")
                })
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path()),
        )
    };

    for path in files {
        if let Some(pattern) = include {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !pattern.matches(name) {
                continue;
            }
        }
        if outcome.files_scanned >= max_files {
            outcome.file_cap_hit = true;
            break;
        }
        outcome.files_scanned += 1;

        let content = match read_text(&path) {
            Some(c) => c,
            None => {
                outcome.skipped += 1;
                continue;
            }
        };
        let shown = sandbox.display(&path);
        for (idx, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                // 已满额时再遇到匹配才算截断
                if outcome.matches.len() >= max_matches {
                    outcome.match_cap_hit = true;
                    return outcome;
                }
                let line: String = line.chars().take(MAX_LINE_CHARS).collect();
                outcome.matches.push(format!("{}:{}: {}", shown, idx + 1, line.trim_end()));
            }
        }
    }
    outcome
}

/// 读取文本；不可读、二进制或非 UTF-8 返回 None
fn read_text(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    if sniff.contains(&0) {
        return None;
    }
    String::from_utf8(bytes).ok()
}

fn render(pattern: &str, outcome: &GrepOutcome, max_matches: usize, max_files: usize) -> String {
    let mut out = if outcome.matches.is_empty() {
        format!("No matches found for pattern: {}", pattern)
    } else {
        format!(
            "Found {} match(es):\n{}",
            outcome.matches.len(),
            outcome.matches.join("\n")
        )
    };
    if outcome.match_cap_hit {
        out.push_str(&format!("\n(results truncated at {} matches)", max_matches));
    }
    if outcome.file_cap_hit {
        out.push_str(&format!("\n(search stopped after {} files)", max_files));
    }
    if outcome.skipped > 0 {
        out.push_str(&format!(
            "\n(skipped {} unreadable or binary file(s))",
            outcome.skipped
        ));
    }
    out
}

#[async_trait]
impl Tool for GrepFilesTool {
    fn name(&self) -> &str {
        "grep_files"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression. Returns matching lines as path:line: text. \
         Use file_pattern (e.g. \"*.rs\") to restrict which files are searched."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<GrepFilesArgs>()
    }

    fn is_read_only(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        self.grep(parse_args(args)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "fn Alpha() {}\nfn beta() {}\n").unwrap();
        std::fs::write(dir.path().join("src/notes.txt"), "alpha notes\n").unwrap();
        std::fs::write(dir.path().join("target/gen.rs"), "fn alpha() {}\n").unwrap();
        std::fs::write(dir.path().join("blob.bin"), [0u8, 1, 2, b'a', b'l', b'p', b'h', b'a']).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_grep_case_and_file_pattern() {
        let dir = setup();
        let tool = GrepFilesTool::new(PathSandbox::rooted(dir.path()));

        let out = tool
            .execute(serde_json::json!({"pattern": "alpha", "case_sensitive": false, "file_pattern": "*.rs"}))
            .await
            .unwrap();
        assert!(out.starts_with("Found 1 match(es):"));
        assert!(out.contains("lib.rs:1: fn Alpha() {}"));
        assert!(!out.contains("gen.rs"));

        let out = tool.execute(serde_json::json!({"pattern": "alpha"})).await.unwrap();
        assert!(out.contains("notes.txt:1: alpha notes"));
        assert!(!out.contains("lib.rs"));
        assert!(out.contains("(skipped 1 unreadable or binary file(s))"));
    }

    #[tokio::test]
    async fn test_grep_caps_and_errors() {
        let dir = setup();
        let tool = GrepFilesTool::new(PathSandbox::rooted(dir.path())).with_limits(1, 100);
        let out = tool
            .execute(serde_json::json!({"pattern": "fn", "path": "src/lib.rs"}))
            .await
            .unwrap();
        assert!(out.contains("(results truncated at 1 matches)"));

        // 恰好满额不算截断
        let tool = GrepFilesTool::new(PathSandbox::rooted(dir.path())).with_limits(2, 100);
        let out = tool
            .execute(serde_json::json!({"pattern": "fn", "path": "src/lib.rs"}))
            .await
            .unwrap();
        assert!(out.starts_with("Found 2 match(es):"));
        assert!(!out.contains("truncated"));

        let err = tool.execute(serde_json::json!({"pattern": "("})).await.unwrap_err();
        assert_eq!(err.kind(), crate::core::ToolErrorKind::Validation);

        let out = tool.execute(serde_json::json!({"pattern": "zzz_nothing"})).await.unwrap();
        assert!(out.starts_with("No matches found for pattern: zzz_nothing"));
    }
}
