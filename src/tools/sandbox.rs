//! 路径沙箱
//!
//! PathSandbox 绑定可选的根目录与相对路径基准；resolve 先做词法规范化（消解 `.` / `..`），
//! 再对已存在的最长前缀做 canonicalize（跟随符号链接），结果必须落在根目录之下，
//! 否则返回 PathTraversal，且在任何文件副作用之前完成校验。

use std::path::{Component, Path, PathBuf};

use crate::core::ToolError;

#[derive(Debug, Clone)]
pub struct PathSandbox {
    root: Option<PathBuf>,
    base_dir: PathBuf,
}

impl PathSandbox {
    pub fn new(root: Option<&Path>, base_dir: impl AsRef<Path>) -> Self {
        let root = root.map(|r| r.canonicalize().unwrap_or_else(|_| r.to_path_buf()));
        let base = base_dir.as_ref().to_path_buf();
        let base_dir = base.canonicalize().unwrap_or(base);
        Self { root, base_dir }
    }

    /// 以 dir 同时作为根目录与基准目录
    pub fn rooted(dir: impl AsRef<Path>) -> Self {
        Self::new(Some(dir.as_ref()), dir.as_ref())
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// 解析路径并校验在根目录之内（未配置根目录时只做规范化）
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, ToolError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ToolError::Validation("path must not be empty".to_string()));
        }
        let path = Path::new(raw);
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        };
        let resolved = canonicalize_existing_prefix(&normalize(&joined));

        if let Some(root) = &self.root {
            if !resolved.starts_with(root) {
                tracing::warn!(path = %raw, root = %root.display(), "path escape attempt");
                return Err(ToolError::PathTraversal(format!(
                    "'{}' resolves outside allowed root '{}'",
                    raw,
                    root.display()
                )));
            }
        }
        Ok(resolved)
    }

    /// 用于输出：根目录内的路径显示为相对路径
    pub fn display(&self, path: &Path) -> String {
        let base = self.root.as_deref().unwrap_or(&self.base_dir);
        path.strip_prefix(base)
            .ok()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

/// 词法规范化：去掉 `.`，`..` 弹出上一级（不触碰文件系统）
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// 对已存在的最长前缀 canonicalize，再拼回尚不存在的部分（写入新文件时需要）
fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();
    loop {
        if let Ok(canon) = existing.canonicalize() {
            let mut out = canon;
            for part in rest.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}
