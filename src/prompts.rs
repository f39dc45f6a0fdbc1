//! 提示词：工具调用系统指令、行内补全（FIM）提示
//!
//! FIM 优先使用模型原生格式（按模型名匹配），否则退回带规则说明的通用模板。

use std::path::Path;

const FIM_TEMPLATE: &str = "You are a code completion assistant. Complete the code at the cursor position.

File: {filename}
Language: {language}
{instruction_section}
RULES:
1. ONLY output the code to insert at the cursor position
2. Do NOT repeat any code from before or after the cursor
3. Do NOT include explanations or markdown formatting
4. Output ONLY the raw code to insert
5. Keep the code style consistent with surrounding code
6. Follow the conventions of the language

<|fim_prefix|>
{code_before}<|fim_cursor|><|fim_suffix|>
{code_after}

Code to insert at cursor:";

/// 行内补全的系统指令
pub const INLINE_SYSTEM_INSTRUCTION: &str = "You are a code completion engine. Your only job is to produce the code that belongs at the cursor position.

Rules:
1. Output only the code to insert, nothing else
2. No explanations, no markdown, no code fences
3. Never repeat code that already exists before or after the cursor
4. Match the style of the surrounding code
5. Prefer short, useful completions; when unsure, produce a minimal sensible one";

/// 行内补全请求
#[derive(Debug, Clone, Default)]
pub struct FimRequest {
    pub code_before: String,
    pub code_after: String,
    pub instruction: Option<String>,
    pub file_path: String,
    pub language: String,
}

impl FimRequest {
    pub fn new(code_before: impl Into<String>, code_after: impl Into<String>) -> Self {
        Self {
            code_before: code_before.into(),
            code_after: code_after.into(),
            ..Default::default()
        }
    }

    pub fn with_file(mut self, file_path: impl Into<String>, language: impl Into<String>) -> Self {
        self.file_path = file_path.into();
        self.language = language.into();
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }
}

/// 按模型名选择 FIM 格式并生成提示
pub fn build_fim_prompt(request: &FimRequest, model: &str) -> String {
    let model = model.to_lowercase();
    let (before, after) = (&request.code_before, &request.code_after);

    if model.contains("codestral") || model.contains("mistral") {
        return format!("<|fim_prefix|>{before}<|fim_suffix|>{after}<|fim_middle|>");
    }
    if model.contains("starcoder") {
        return format!("<fim_prefix>{before}<fim_suffix>{after}<fim_middle>");
    }
    if model.contains("deepseek") {
        return format!("<｜fim▁begin｜>{before}<｜fim▁hole｜>{after}<｜fim▁end｜>");
    }

    let filename = Path::new(&request.file_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    let language = if request.language.is_empty() {
        "text"
    } else {
        request.language.as_str()
    };
    let instruction_section = match request.instruction.as_deref() {
        Some(i) if !i.trim().is_empty() => format!("Instruction: {}\n", i),
        _ => String::new(),
    };

    FIM_TEMPLATE
        .replace("{filename}", &filename)
        .replace("{language}", language)
        .replace("{instruction_section}", &instruction_section)
        .replace("{code_before}", before)
        .replace("{code_after}", after)
}

/// 由文件扩展名推断语言名（用于 FIM 模板）
pub fn language_for_path(path: &str) -> &'static str {
    match Path::new(path).extension().and_then(|e| e.to_str()).unwrap_or("") {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cc" | "cpp" | "hpp" => "cpp",
        "rb" => "ruby",
        "sh" | "bash" => "shell",
        "toml" => "toml",
        "json" => "json",
        "md" => "markdown",
        _ => "text",
    }
}

/// 默认系统指令：要求模型主动调用工具，并告知工作目录
pub fn system_instruction(working_dir: &Path) -> String {
    let cwd = working_dir.display();
    format!(
        "You are a coding assistant with tool calling capabilities. You can read, write and edit files, \
search the workspace and run shell commands through the tools you have been given.

Working directory: {cwd}

When the user asks you to create or change a file, call the tool that does it. Do not paste the code \
and ask the user to save it themselves.

Tools:
- read_file(file_path, start_line?, end_line?): read a file, optionally a line range
- write_file(file_path, content): create or overwrite a file
- edit_file(file_path, new_text, old_text? | start_line?, end_line?): replace text or a line range
- glob_files(pattern, path?): find files by glob pattern
- grep_files(pattern, path?, file_pattern?, case_sensitive?): search file contents with a regex
- bash(command, timeout?): run a shell command in the working directory

Paths:
- Relative paths are resolved against {cwd}
- \"create src/main.py\" means {cwd}/src/main.py

Only write files when the user asks you to create, write or save something, or confirms after you \
have shown them the code. Read a file before editing it. Keep answers concise."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_fim_formats() {
        let req = FimRequest::new("prefix", "suffix");
        assert_eq!(
            build_fim_prompt(&req, "codestral-latest"),
            "<|fim_prefix|>prefix<|fim_suffix|>suffix<|fim_middle|>"
        );
        assert!(build_fim_prompt(&req, "Mistral-Large").starts_with("<|fim_prefix|>prefix"));
        assert_eq!(
            build_fim_prompt(&req, "starcoder2"),
            "<fim_prefix>prefix<fim_suffix>suffix<fim_middle>"
        );
        let ds = build_fim_prompt(&req, "deepseek-coder");
        assert!(ds.starts_with("<｜fim▁begin｜>prefix<｜fim▁hole｜>suffix"));
        assert!(ds.ends_with("<｜fim▁end｜>"));
    }

    #[test]
    fn test_generic_fim_template() {
        let req = FimRequest::new("def hello():\n    ", "\n\nhello()")
            .with_file("src/test.py", "python")
            .with_instruction("complete the function");
        let prompt = build_fim_prompt(&req, "gpt-4o-mini");
        assert!(prompt.contains("File: test.py"));
        assert!(prompt.contains("Language: python"));
        assert!(prompt.contains("Instruction: complete the function"));
        assert!(prompt.contains("def hello():\n    <|fim_cursor|><|fim_suffix|>\n\n\nhello()"));
        assert!(prompt.ends_with("Code to insert at cursor:"));

        let bare = build_fim_prompt(&FimRequest::new("", ""), "gpt-4o-mini");
        assert!(bare.contains("File: unknown"));
        assert!(bare.contains("Language: text"));
        assert!(!bare.contains("Instruction:"));
    }

    #[test]
    fn test_system_instruction_names_working_dir() {
        let text = system_instruction(Path::new("/work/project"));
        assert!(text.contains("Working directory: /work/project"));
        assert!(text.contains("/work/project/src/main.py"));
        for tool in ["read_file", "write_file", "edit_file", "glob_files", "grep_files", "bash"] {
            assert!(text.contains(tool));
        }
    }

    #[test]
    fn test_language_for_path() {
        assert_eq!(language_for_path("a/b.rs"), "rust");
        assert_eq!(language_for_path("Makefile"), "text");
    }
}
