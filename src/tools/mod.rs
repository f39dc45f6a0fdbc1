//! 工具层：路径沙箱、六个内置工具与注册表

pub mod bash;
pub mod edit_file;
pub mod glob_files;
pub mod grep_files;
pub mod read_file;
pub mod registry;
pub mod sandbox;
pub mod schema;
pub mod write_file;

pub use bash::BashTool;
pub use edit_file::EditFileTool;
pub use glob_files::GlobFilesTool;
pub use grep_files::GrepFilesTool;
pub use read_file::ReadFileTool;
pub use registry::{Tool, ToolDeclaration, ToolRegistry};
pub use sandbox::PathSandbox;
pub use write_file::WriteFileTool;
