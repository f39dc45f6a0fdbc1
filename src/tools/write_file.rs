//! write_file：写入或覆盖文件，自动创建父目录

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::ToolError;
use crate::tools::schema::{parameters_schema, parse_args};
use crate::tools::{PathSandbox, Tool};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WriteFileArgs {
    /// Path of the file to create or overwrite
    pub file_path: String,
    /// Full content to write
    pub content: String,
}

pub struct WriteFileTool {
    sandbox: PathSandbox,
}

impl WriteFileTool {
    pub fn new(sandbox: PathSandbox) -> Self {
        Self { sandbox }
    }

    pub async fn write(&self, args: WriteFileArgs) -> Result<String, ToolError> {
        let path = self.sandbox.resolve(&args.file_path)?;
        if path.is_dir() {
            return Err(ToolError::Validation(format!(
                "'{}' is a directory",
                args.file_path
            )));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::from_io(parent, e))?;
        }
        tokio::fs::write(&path, args.content.as_bytes())
            .await
            .map_err(|e| ToolError::from_io(&path, e))?;

        tracing::info!(path = %path.display(), bytes = args.content.len(), "write_file");
        Ok(format!(
            "Successfully wrote {} bytes to {}",
            args.content.len(),
            self.sandbox.display(&path)
        ))
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file with the given content. Parent directories are created as needed. \
         Call this whenever the user asks to create, write or save a file."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<WriteFileArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        self.write(parse_args(args)?).await
    }
}
