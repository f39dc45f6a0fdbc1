//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SCOUT__*` 覆盖（双下划线表示嵌套，如 `SCOUT__LLM__PROVIDER=anthropic`）。
//! 核心模块只接收这里解析好的结构体，不直接读取进程环境或当前目录。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmConfig,
    pub tools: ToolsConfig,
    pub history: HistoryConfig,
    pub permissions: PermissionConfig,
    pub engine: EngineConfig,
    pub checkpoint: CheckpointConfig,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 工作目录；未设置时由入口用启动目录填充
    pub working_dir: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "scout".to_string(),
            working_dir: None,
        }
    }
}

/// [llm] 段：后端、模型、凭据与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// openai / anthropic / ollama / deepseek / scripted
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 显式 API Key；为空时由入口按后端名从环境变量补齐
    pub api_key: Option<String>,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
    pub max_output_tokens: u32,
    pub retry: RetrySection,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            request_timeout_secs: 60,
            max_output_tokens: 4096,
            retry: RetrySection::default(),
        }
    }
}

impl LlmConfig {
    /// 该后端对应的 API Key 环境变量名（ollama / scripted 不需要）
    pub fn api_key_env_var(&self) -> Option<&'static str> {
        match self.provider.to_lowercase().as_str() {
            "openai" => Some("OPENAI_API_KEY"),
            "anthropic" | "claude" => Some("ANTHROPIC_API_KEY"),
            "deepseek" => Some("DEEPSEEK_API_KEY"),
            _ => None,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// [llm.retry] 段：瞬时错误（限流 / 超时 / 连接）的指数退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

/// [tools] 段：沙箱根目录与各工具上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// 允许访问的根目录；None 表示不做路径约束
    pub root: Option<PathBuf>,
    /// 相对路径的解析基准（通常为工作目录）
    pub base_dir: PathBuf,
    /// 注册表对单次工具调用施加的外层超时（秒）
    pub call_timeout_secs: u64,
    pub max_read_bytes: u64,
    pub glob_max_results: usize,
    pub grep_max_matches: usize,
    pub grep_max_files: usize,
    pub bash_default_timeout_secs: u64,
    pub bash_max_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            root: None,
            base_dir: PathBuf::from("."),
            call_timeout_secs: 660,
            max_read_bytes: 10 * 1024 * 1024,
            glob_max_results: 100,
            grep_max_matches: 100,
            grep_max_files: 500,
            bash_default_timeout_secs: 120,
            bash_max_timeout_secs: 600,
        }
    }
}

impl ToolsConfig {
    /// 以 dir 为根目录与相对路径基准
    pub fn rooted_at(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            root: Some(dir.clone()),
            base_dir: dir,
            ..Self::default()
        }
    }
}

/// [history] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
    /// SQLite 文件；None 时使用纯内存存储
    pub db_path: Option<PathBuf>,
    /// 每轮结束后裁剪到的 token 上限；0 表示不裁剪
    pub max_tokens: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: None,
            max_tokens: 100_000,
        }
    }
}

/// [permissions] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// read_file / glob_files / grep_files 免确认
    pub auto_approve_read_only: bool,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            auto_approve_read_only: true,
        }
    }
}

/// [engine] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 单轮内最多工具往返次数，防止模型无限调用工具
    pub max_tool_rounds: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_tool_rounds: 25 }
    }
}

/// [checkpoint] 段：写文件前的快照
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub enabled: bool,
    /// 快照目录；相对路径以工作目录为基准
    pub dir: PathBuf,
    /// 超出后删除最旧的检查点
    pub max_checkpoints: usize,
    /// write_file / edit_file 执行前自动为目标文件建检查点
    pub auto_snapshot: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from(".scout/checkpoints"),
            max_checkpoints: 50,
            auto_snapshot: true,
        }
    }
}

/// 从 config 目录加载配置，环境变量 SCOUT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SCOUT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SCOUT")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.llm.retry.max_retries, 3);
        assert_eq!(cfg.tools.bash_default_timeout_secs, 120);
        assert_eq!(cfg.tools.bash_max_timeout_secs, 600);
        assert!(cfg.permissions.auto_approve_read_only);
        assert_eq!(cfg.checkpoint.max_checkpoints, 50);
        assert!(cfg.checkpoint.auto_snapshot);
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scout.toml");
        std::fs::write(
            &path,
            "[llm]\nprovider = \"anthropic\"\nmodel = \"claude-sonnet-4-20250514\"\n\n[tools]\nglob_max_results = 7\n\n[checkpoint]\nauto_snapshot = false\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.llm.provider, "anthropic");
        assert_eq!(cfg.tools.glob_max_results, 7);
        // 未出现的键保持默认
        assert_eq!(cfg.tools.grep_max_matches, 100);
        assert!(!cfg.checkpoint.auto_snapshot);
        assert!(cfg.checkpoint.enabled);
        assert_eq!(cfg.llm.api_key_env_var(), Some("ANTHROPIC_API_KEY"));
    }
}
