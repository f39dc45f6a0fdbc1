//! 文件检查点：修改前保存文件内容，可按 id 回滚
//!
//! 目录布局：`<dir>/checkpoint_index.json` 记录元数据，`<dir>/<checkpoint_id>/<hash>.snapshot`
//! 保存原始字节（同一检查点内按内容去重）。恢复时校验哈希，校验失败的文件跳过并告警。
//! 超过 max_checkpoints 时从最旧一端删除。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::CheckpointError;

const INDEX_FILE: &str = "checkpoint_index.json";
const INDEX_VERSION: &str = "1.0";
const GITIGNORE: &str = "# Exclude checkpoint data\n*.snapshot\ncheckpoint_*/\ncp_*/\n# Keep index\n!checkpoint_index.json\n";

/// 触发检查点的操作
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Manual,
    PreWrite,
    PreEdit,
}

impl CheckpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointKind::Manual => "manual",
            CheckpointKind::PreWrite => "pre_write",
            CheckpointKind::PreEdit => "pre_edit",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub file_path: PathBuf,
    /// SHA-256 前 16 个十六进制字符
    pub content_hash: String,
    pub size_bytes: u64,
    pub modified_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub created_at: DateTime<Utc>,
    pub description: String,
    pub operation_type: CheckpointKind,
    pub snapshots: Vec<FileSnapshot>,
}

impl Checkpoint {
    pub fn file_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn total_size(&self) -> u64 {
        self.snapshots.iter().map(|s| s.size_bytes).sum()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointIndex {
    version: String,
    last_updated: DateTime<Utc>,
    checkpoints: Vec<Checkpoint>,
}

pub struct CheckpointStore {
    dir: PathBuf,
    max_checkpoints: usize,
    /// 按创建顺序，最旧在前
    checkpoints: Vec<Checkpoint>,
}

fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(16);
    hex
}

impl CheckpointStore {
    /// 打开（或创建）检查点目录；索引损坏时告警并从空索引开始
    pub fn open(dir: impl Into<PathBuf>, max_checkpoints: usize) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| CheckpointError::io(&dir, e))?;
        let gitignore = dir.join(".gitignore");
        if !gitignore.exists() {
            std::fs::write(&gitignore, GITIGNORE).map_err(|e| CheckpointError::io(&gitignore, e))?;
        }

        let mut store = Self {
            dir,
            max_checkpoints: max_checkpoints.max(1),
            checkpoints: Vec::new(),
        };
        match store.load_index() {
            Ok(checkpoints) => store.checkpoints = checkpoints,
            Err(e) => tracing::warn!(error = %e, "failed to load checkpoint index, starting empty"),
        }
        tracing::info!(dir = %store.dir.display(), checkpoints = store.checkpoints.len(), "checkpoint store opened");
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    fn checkpoint_dir(&self, checkpoint_id: &str) -> PathBuf {
        self.dir.join(checkpoint_id)
    }

    fn load_index(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| CheckpointError::io(&path, e))?;
        let index: CheckpointIndex = serde_json::from_str(&raw)?;
        Ok(index.checkpoints)
    }

    fn save_index(&self) -> Result<(), CheckpointError> {
        let index = CheckpointIndex {
            version: INDEX_VERSION.to_string(),
            last_updated: Utc::now(),
            checkpoints: self.checkpoints.clone(),
        };
        let path = self.index_path();
        std::fs::write(&path, serde_json::to_string_pretty(&index)?)
            .map_err(|e| CheckpointError::io(&path, e))
    }

    fn next_id(&self) -> String {
        let base = format!("cp_{}", Utc::now().format("%Y%m%d_%H%M%S_%6f"));
        let mut id = base.clone();
        let mut n = 1;
        while self.get(&id).is_some() || self.checkpoint_dir(&id).exists() {
            id = format!("{}_{}", base, n);
            n += 1;
        }
        id
    }

    /// 为给定文件（绝对路径）建检查点；不存在或读不到的文件跳过
    pub fn create(
        &mut self,
        paths: &[PathBuf],
        description: &str,
        kind: CheckpointKind,
    ) -> Result<Checkpoint, CheckpointError> {
        let checkpoint_id = self.next_id();
        let cp_dir = self.checkpoint_dir(&checkpoint_id);
        std::fs::create_dir_all(&cp_dir).map_err(|e| CheckpointError::io(&cp_dir, e))?;

        let snapshots = paths
            .iter()
            .filter_map(|path| match snapshot_file(path, &cp_dir) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to snapshot file");
                    None
                }
            })
            .collect::<Vec<_>>();

        let checkpoint = Checkpoint {
            checkpoint_id: checkpoint_id.clone(),
            created_at: Utc::now(),
            description: description.to_string(),
            operation_type: kind,
            snapshots,
        };
        self.checkpoints.push(checkpoint.clone());
        if let Err(e) = self.save_index() {
            self.checkpoints.pop();
            let _ = std::fs::remove_dir_all(&cp_dir);
            return Err(e);
        }
        tracing::info!(
            id = %checkpoint_id,
            kind = kind.as_str(),
            files = checkpoint.file_count(),
            "checkpoint created"
        );
        self.prune();
        Ok(checkpoint)
    }

    /// 把检查点中的文件写回原路径，返回恢复的文件数
    pub fn restore(&self, checkpoint_id: &str) -> Result<usize, CheckpointError> {
        let checkpoint = self
            .get(checkpoint_id)
            .ok_or_else(|| CheckpointError::NotFound(checkpoint_id.to_string()))?;
        let cp_dir = self.checkpoint_dir(checkpoint_id);
        if !cp_dir.exists() {
            return Err(CheckpointError::NotFound(format!("{} (data missing)", checkpoint_id)));
        }

        let mut restored = 0;
        for snapshot in &checkpoint.snapshots {
            match restore_file(snapshot, &cp_dir) {
                Ok(()) => restored += 1,
                Err(e) => {
                    tracing::error!(path = %snapshot.file_path.display(), error = %e, "failed to restore file")
                }
            }
        }
        tracing::info!(id = %checkpoint_id, restored, "checkpoint restored");
        Ok(restored)
    }

    /// 最近的在前
    pub fn list(&self, limit: usize) -> Vec<&Checkpoint> {
        self.checkpoints.iter().rev().take(limit).collect()
    }

    pub fn get(&self, checkpoint_id: &str) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| c.checkpoint_id == checkpoint_id)
    }

    pub fn latest(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    pub fn delete(&mut self, checkpoint_id: &str) -> Result<(), CheckpointError> {
        let pos = self
            .checkpoints
            .iter()
            .position(|c| c.checkpoint_id == checkpoint_id)
            .ok_or_else(|| CheckpointError::NotFound(checkpoint_id.to_string()))?;
        let cp_dir = self.checkpoint_dir(checkpoint_id);
        if cp_dir.exists() {
            std::fs::remove_dir_all(&cp_dir).map_err(|e| CheckpointError::io(&cp_dir, e))?;
        }
        self.checkpoints.remove(pos);
        self.save_index()?;
        tracing::debug!(id = %checkpoint_id, "checkpoint deleted");
        Ok(())
    }

    fn prune(&mut self) {
        let excess = self.checkpoints.len().saturating_sub(self.max_checkpoints);
        let oldest: Vec<String> = self.checkpoints[..excess]
            .iter()
            .map(|c| c.checkpoint_id.clone())
            .collect();
        for id in oldest {
            if let Err(e) = self.delete(&id) {
                tracing::warn!(id = %id, error = %e, "failed to prune checkpoint");
            }
        }
        if excess > 0 {
            tracing::info!(removed = excess, "old checkpoints pruned");
        }
    }

    /// 检查点目录占用的字节数
    pub fn storage_size(&self) -> u64 {
        walkdir::WalkDir::new(&self.dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }
}

fn snapshot_file(path: &Path, cp_dir: &Path) -> Result<Option<FileSnapshot>, CheckpointError> {
    if !path.is_file() {
        tracing::debug!(path = %path.display(), "no file to snapshot");
        return Ok(None);
    }
    let content = std::fs::read(path).map_err(|e| CheckpointError::io(path, e))?;
    let hash = content_hash(&content);
    let stored = cp_dir.join(format!("{}.snapshot", hash));
    if !stored.exists() {
        std::fs::write(&stored, &content).map_err(|e| CheckpointError::io(&stored, e))?;
    }
    let modified_time = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from);
    Ok(Some(FileSnapshot {
        file_path: path.to_path_buf(),
        content_hash: hash,
        size_bytes: content.len() as u64,
        modified_time,
    }))
}

fn restore_file(snapshot: &FileSnapshot, cp_dir: &Path) -> Result<(), CheckpointError> {
    let stored = cp_dir.join(format!("{}.snapshot", snapshot.content_hash));
    let content = std::fs::read(&stored).map_err(|e| CheckpointError::io(&stored, e))?;
    if content_hash(&content) != snapshot.content_hash {
        return Err(CheckpointError::Corrupted(snapshot.file_path.display().to_string()));
    }
    if let Some(parent) = snapshot.file_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CheckpointError::io(parent, e))?;
    }
    std::fs::write(&snapshot.file_path, content)
        .map_err(|e| CheckpointError::io(&snapshot.file_path, e))
}
