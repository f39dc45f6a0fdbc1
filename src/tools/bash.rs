//! bash：在工作目录下执行 Shell 命令
//!
//! 通过 sh -c 执行，带硬超时（默认 120s，上限 600s）；stdout / stderr 分开捕获，非零退出码附加注释。
//! 超时是独立的错误类型，子进程随 kill_on_drop 一并结束。

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use crate::core::ToolError;
use crate::tools::schema::{parameters_schema, parse_args};
use crate::tools::{PathSandbox, Tool};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BashArgs {
    /// Shell command to execute
    pub command: String,
    /// Timeout in seconds (default 120, max 600)
    pub timeout: Option<u64>,
}

pub struct BashTool {
    sandbox: PathSandbox,
    default_timeout_secs: u64,
    max_timeout_secs: u64,
}

impl BashTool {
    pub fn new(sandbox: PathSandbox, default_timeout_secs: u64, max_timeout_secs: u64) -> Self {
        Self {
            sandbox,
            default_timeout_secs,
            max_timeout_secs,
        }
    }

    pub async fn run(&self, args: BashArgs) -> Result<String, ToolError> {
        let command = args.command.trim();
        if command.is_empty() {
            return Err(ToolError::Validation("command must not be empty".to_string()));
        }
        let timeout_secs = args.timeout.unwrap_or(self.default_timeout_secs);
        if timeout_secs == 0 || timeout_secs > self.max_timeout_secs {
            return Err(ToolError::Validation(format!(
                "timeout must be between 1 and {} seconds",
                self.max_timeout_secs
            )));
        }

        tracing::info!(command = %command, timeout_secs, "bash tool execute");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(self.sandbox.root().unwrap_or(self.sandbox.base_dir()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| ToolError::CommandExecution(format!("failed to spawn: {}", e)))?;
        let output = tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output())
            .await
            .map_err(|_| ToolError::Timeout(timeout_secs))?
            .map_err(|e| ToolError::CommandExecution(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let mut result = match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
            (true, true) => "Command completed with no output".to_string(),
            (false, true) => stdout.trim_end().to_string(),
            (true, false) => format!("STDERR:\n{}", stderr.trim_end()),
            (false, false) => format!(
                "STDOUT:\n{}\n\nSTDERR:\n{}",
                stdout.trim_end(),
                stderr.trim_end()
            ),
        };
        if !output.status.success() {
            match output.status.code() {
                Some(code) => result.push_str(&format!("\n\n[exit code: {}]", code)),
                None => result.push_str("\n\n[terminated by signal]"),
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace directory. stdout and stderr are captured separately; \
         a non-zero exit code is reported after the output. Optional timeout in seconds (default 120, max 600)."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<BashArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        self.run(parse_args(args)?).await
    }
}
