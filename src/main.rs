//! Scout - 终端编码助手
//!
//! 入口：初始化日志、加载配置、组装引擎，然后运行读取 stdin 的 REPL。

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, Mutex};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use scout::config::{load_config, AppConfig};
use scout::core::{PermissionError, PermissionGate};
use scout::memory::{CharRatioEstimator, CheckpointStore, HistoryStore};
use scout::prompts::{language_for_path, system_instruction, FimRequest};
use scout::tools::PathSandbox;
use scout::{create_adapter, Engine, EngineEvent, ToolRegistry};

const HELP: &str = "Commands:
  /help                     show this help
  /clear                    clear the conversation
  /tools                    list available tools
  /info                     show provider and model
  /history                  list recent sessions
  /export <id> <path>       export a session as JSON
  /checkpoint <file>...     snapshot files before changing them
  /checkpoints              list recent checkpoints
  /restore <id>             restore files from a checkpoint
  /undo                     restore the most recent checkpoint
  /complete <file> <line>   inline completion at the start of a line
  /quit                     exit
Use @path in a message to attach a file as context.";

type Lines = Arc<Mutex<mpsc::UnboundedReceiver<String>>>;

/// 在终端询问 y/N；与 REPL 共用同一个 stdin 行通道
struct StdinPermission {
    lines: Lines,
}

#[async_trait]
impl PermissionGate for StdinPermission {
    async fn check(&self, tool_name: &str, args: &Value) -> Result<bool, PermissionError> {
        let args = serde_json::to_string(args).map_err(|e| PermissionError::Prompt(e.to_string()))?;
        eprint!("\nAllow {} {}? [y/N] ", tool_name, args);
        std::io::stderr()
            .flush()
            .map_err(|e| PermissionError::Prompt(e.to_string()))?;
        let answer = self.lines.lock().await.recv().await.ok_or(PermissionError::Closed)?;
        Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖；写 stderr，避免与回复混在一起
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let config_path = config_path_arg(std::env::args().skip(1));
    let mut cfg = load_config(config_path).context("Failed to load configuration")?;
    resolve_environment(&mut cfg)?;

    let lines = spawn_stdin_reader();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    tokio::spawn(print_events(event_rx));

    let mut engine = build_engine(&cfg, lines.clone(), event_tx)?;
    engine.initialize().await.context("Failed to initialize engine")?;

    let info = engine.provider_info();
    println!("scout · {} / {} · type /help for commands", info.name, info.model);
    repl(&mut engine, &lines).await?;

    if let Some(history) = engine.history_mut() {
        history.end_session();
    }
    Ok(())
}

fn config_path_arg(mut args: impl Iterator<Item = String>) -> Option<PathBuf> {
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}

/// 进程相关的默认值只在入口处补齐：工作目录与 API Key
fn resolve_environment(cfg: &mut AppConfig) -> anyhow::Result<()> {
    let working_dir = match cfg.app.working_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    if cfg.tools.base_dir == Path::new(".") {
        cfg.tools.base_dir = working_dir.clone();
    }
    if cfg.tools.root.is_none() {
        cfg.tools.root = Some(working_dir.clone());
    }
    cfg.app.working_dir = Some(working_dir);

    if cfg.llm.api_key.as_deref().map_or(true, str::is_empty) {
        if let Some(var) = cfg.llm.api_key_env_var() {
            cfg.llm.api_key = std::env::var(var).ok().filter(|k| !k.is_empty());
        }
    }
    Ok(())
}

fn build_engine(
    cfg: &AppConfig,
    lines: Lines,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
) -> anyhow::Result<Engine> {
    let working_dir = cfg.tools.base_dir.clone();
    let provider = create_adapter(&cfg.llm).context("Failed to create provider")?;
    let registry = Arc::new(ToolRegistry::with_builtin_tools(&cfg.tools));

    let mut builder = Engine::builder(cfg.engine.clone())
        .with_provider(provider)
        .with_registry(registry)
        .with_permission(Arc::new(StdinPermission { lines }))
        .with_auto_approve_read_only(cfg.permissions.auto_approve_read_only)
        .with_system_instruction(system_instruction(&working_dir))
        .with_workspace(PathSandbox::new(cfg.tools.root.as_deref(), &working_dir))
        .with_context_limit(cfg.tools.max_read_bytes)
        .with_event_tx(event_tx);

    if cfg.checkpoint.enabled {
        let store = CheckpointStore::open(working_dir.join(&cfg.checkpoint.dir), cfg.checkpoint.max_checkpoints)
            .context("Failed to open checkpoint store")?;
        builder = builder
            .with_checkpoints(store)
            .with_auto_snapshot(cfg.checkpoint.auto_snapshot);
    }

    if cfg.history.enabled {
        let estimator = Box::new(CharRatioEstimator::default());
        let store = match &cfg.history.db_path {
            Some(path) => HistoryStore::open(working_dir.join(path), estimator),
            None => HistoryStore::in_memory(estimator),
        }
        .context("Failed to open history store")?;
        builder = builder
            .with_history(store)
            .with_history_budget(cfg.history.max_tokens);
    }
    Ok(builder.build()?)
}

fn spawn_stdin_reader() -> Lines {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    Arc::new(Mutex::new(rx))
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            EngineEvent::TextChunk { text } => {
                print!("{}", text);
                let _ = std::io::stdout().flush();
            }
            EngineEvent::ToolCall { tool, args } => eprintln!("\n[tool] {} {}", tool, args),
            EngineEvent::ToolResult { tool, preview } => eprintln!("[{}] {}", tool, preview),
            EngineEvent::PermissionDenied { tool } => eprintln!("[{}] denied", tool),
            EngineEvent::Checkpoint { id, files } => eprintln!("[checkpoint] {} ({} file(s))", id, files),
            EngineEvent::Done => println!(),
            EngineEvent::Error { text } => eprintln!("\nError: {}", text),
        }
    }
}

async fn repl(engine: &mut Engine, lines: &Lines) -> anyhow::Result<()> {
    loop {
        print!("\n> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.lock().await.recv().await else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('/') {
            let mut parts = command.split_whitespace();
            match parts.next().unwrap_or_default() {
                "quit" | "exit" => break,
                "help" => println!("{}", HELP),
                "clear" => {
                    engine.clear_history().await?;
                    println!("Conversation cleared.");
                }
                "tools" => {
                    for tool in engine.available_tools() {
                        println!("  {:<12} {}", tool.name, tool.description);
                    }
                }
                "info" => {
                    let info = engine.provider_info();
                    println!("{}", serde_json::to_string_pretty(&info)?);
                }
                "history" => show_history(engine),
                "export" => match (parts.next(), parts.next()) {
                    (Some(id), Some(path)) => export(engine, id, Path::new(path)),
                    _ => println!("Usage: /export <id> <path>"),
                },
                "checkpoint" => {
                    let files: Vec<PathBuf> = parts.map(PathBuf::from).collect();
                    if files.is_empty() {
                        println!("Usage: /checkpoint <file>...");
                    } else {
                        match engine.create_checkpoint(&files, "Manual checkpoint") {
                            Ok(cp) => println!("Created {} ({} file(s))", cp.checkpoint_id, cp.file_count()),
                            Err(e) => eprintln!("Error: {}", e),
                        }
                    }
                }
                "checkpoints" => show_checkpoints(engine),
                "restore" => match parts.next() {
                    Some(id) => restore(engine, id),
                    None => println!("Usage: /restore <id>"),
                },
                "undo" => match engine.checkpoints().and_then(|s| s.latest()) {
                    Some(cp) => {
                        let id = cp.checkpoint_id.clone();
                        restore(engine, &id);
                    }
                    None => println!("No checkpoints to restore."),
                },
                "complete" => match (parts.next(), parts.next().and_then(|n| n.parse::<usize>().ok())) {
                    (Some(file), Some(line_no)) if line_no >= 1 => {
                        if let Err(e) = complete(engine, file, line_no).await {
                            eprintln!("Error: {:#}", e);
                        }
                    }
                    _ => println!("Usage: /complete <file> <line>"),
                },
                other => println!("Unknown command: /{} (try /help)", other),
            }
            continue;
        }

        let (message, context_files) = split_context(line);
        // 失败已经通过 Error 事件显示
        if let Err(e) = engine.send(&message, &context_files).await {
            tracing::debug!(error = %e, "turn ended with error");
        }
    }
    Ok(())
}

/// 把 `@path` 记号拆成上下文文件，其余部分作为消息
fn split_context(line: &str) -> (String, Vec<PathBuf>) {
    let mut words = Vec::new();
    let mut files = Vec::new();
    for word in line.split_whitespace() {
        match word.strip_prefix('@') {
            Some(path) if !path.is_empty() => files.push(PathBuf::from(path)),
            _ => words.push(word),
        }
    }
    (words.join(" "), files)
}

fn show_history(engine: &Engine) {
    let Some(history) = engine.history() else {
        println!("History is disabled.");
        return;
    };
    match history.list_sessions(10) {
        Ok(sessions) => {
            for s in sessions {
                println!(
                    "  {}  {}  {:>3} messages  {:>6} tokens  {}",
                    s.session_id,
                    s.started_at.format("%Y-%m-%d %H:%M"),
                    s.message_count,
                    s.total_tokens,
                    s.model
                );
            }
        }
        Err(e) => eprintln!("Error: {}", e),
    }
}

fn export(engine: &Engine, id: &str, path: &Path) {
    let Some(history) = engine.history() else {
        println!("History is disabled.");
        return;
    };
    match history.export_session(id, path) {
        Ok(()) => println!("Exported {} to {}", id, path.display()),
        Err(e) => eprintln!("Error: {}", e),
    }
}

fn show_checkpoints(engine: &Engine) {
    let Some(store) = engine.checkpoints() else {
        println!("Checkpoints are disabled.");
        return;
    };
    if store.is_empty() {
        println!("No checkpoints yet.");
        return;
    }
    for cp in store.list(10) {
        println!(
            "  {}  {}  {:<9} {:>2} file(s)  {}",
            cp.checkpoint_id,
            cp.created_at.format("%Y-%m-%d %H:%M:%S"),
            cp.operation_type.as_str(),
            cp.file_count(),
            cp.description
        );
    }
}

fn restore(engine: &Engine, id: &str) {
    match engine.restore_checkpoint(id) {
        Ok(count) => println!("Restored {} file(s) from {}", count, id),
        Err(e) => eprintln!("Error: {}", e),
    }
}

async fn complete(engine: &mut Engine, file: &str, line_no: usize) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file))?;
    let lines: Vec<&str> = content.lines().collect();
    let split = (line_no - 1).min(lines.len());
    let mut before = lines[..split].join("\n");
    if !before.is_empty() {
        before.push('\n');
    }
    let after = lines[split..].join("\n");

    let request = FimRequest::new(before, after).with_file(file, language_for_path(file));
    engine.inline_complete(request).await?;
    println!();
    Ok(())
}
