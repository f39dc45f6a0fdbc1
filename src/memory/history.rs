//! 会话历史：追加写入、按 token 预算剪枝、SQLite 持久化、JSON 导出/导入
//!
//! 内存中的 Session 是权威状态；每次变更同步写入 SQLite，写入失败只记 warn，不影响内存操作。
//! 不变量：total_tokens 恒等于各消息 token 之和；剪枝只从最旧一端删除，且至少保留 1 条。

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::HistoryError;
use crate::memory::{CharRatioEstimator, TokenEstimator};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    model TEXT
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(session_id),
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    tokens INTEGER NOT NULL,
    metadata TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
"#;

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
            Role::Tool => "tool",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "model" => Some(Role::Model),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// 单条消息（创建后不可变）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "tokens")]
    pub token_count: usize,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// 一次会话；字段顺序即导出 JSON 的字段顺序
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_tokens: usize,
    pub model: String,
    pub messages: Vec<Message>,
}

impl Session {
    fn new(model: &str) -> Self {
        let now = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            session_id: format!("{}_{}", now.format("%Y%m%d_%H%M%S"), &suffix[..8]),
            started_at: now,
            ended_at: None,
            total_tokens: 0,
            model: model.to_string(),
            messages: Vec::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// list_sessions 的摘要行
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub model: String,
    pub total_tokens: usize,
    pub message_count: usize,
}

pub struct HistoryStore {
    conn: Connection,
    estimator: Box<dyn TokenEstimator>,
    current: Option<Session>,
}

impl HistoryStore {
    /// 打开（或创建）数据库文件
    pub fn open(
        path: impl AsRef<Path>,
        estimator: Box<dyn TokenEstimator>,
    ) -> Result<Self, HistoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "history store opened");
        Self::with_connection(conn, estimator)
    }

    pub fn in_memory(estimator: Box<dyn TokenEstimator>) -> Result<Self, HistoryError> {
        Self::with_connection(Connection::open_in_memory()?, estimator)
    }

    /// 内存库 + 默认估算器（测试与禁用持久化时使用）
    pub fn ephemeral() -> Result<Self, HistoryError> {
        Self::in_memory(Box::new(CharRatioEstimator::default()))
    }

    fn with_connection(
        conn: Connection,
        estimator: Box<dyn TokenEstimator>,
    ) -> Result<Self, HistoryError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            estimator,
            current: None,
        })
    }

    /// 开启新会话并立即持久化；已有未结束会话时先结束它
    pub fn start_session(&mut self, model: &str) -> String {
        if self.current.is_some() {
            self.end_session();
        }
        let session = Session::new(model);
        let id = session.session_id.clone();
        if let Err(e) = self.conn.execute(
            "INSERT INTO sessions (session_id, started_at, total_tokens, model) VALUES (?1, ?2, 0, ?3)",
            params![session.session_id, session.started_at, session.model],
        ) {
            tracing::warn!(session_id = %id, error = %e, "failed to persist new session");
        }
        tracing::info!(session_id = %id, model = %model, "history session started");
        self.current = Some(session);
        id
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    pub fn current_session_id(&self) -> Option<&str> {
        self.current.as_ref().map(|s| s.session_id.as_str())
    }

    /// 追加消息：估算 token、更新累计值、同步写库
    pub fn add_message(
        &mut self,
        role: Role,
        content: &str,
        metadata: Option<Value>,
    ) -> Result<(), HistoryError> {
        let session = self.current.as_mut().ok_or(HistoryError::NoActiveSession)?;
        let message = Message {
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
            token_count: self.estimator.estimate(content),
            metadata,
        };
        session.total_tokens += message.token_count;

        if let Err(e) = persist_message(&self.conn, &session.session_id, &message)
            .and_then(|_| persist_total(&self.conn, &session.session_id, session.total_tokens))
        {
            tracing::warn!(session_id = %session.session_id, error = %e, "failed to persist message");
        }
        session.messages.push(message);
        Ok(())
    }

    /// 从最旧一端删除消息，直到不超预算或只剩 1 条；返回删除条数
    pub fn prune(&mut self, max_tokens: usize) -> usize {
        let Some(session) = self.current.as_mut() else {
            return 0;
        };
        let mut removed = 0;
        while session.total_tokens > max_tokens && session.messages.len() > 1 {
            let oldest = session.messages.remove(0);
            session.total_tokens -= oldest.token_count;
            removed += 1;
        }
        if removed == 0 {
            return 0;
        }

        let persisted = self
            .conn
            .execute(
                "DELETE FROM messages WHERE id IN \
                 (SELECT id FROM messages WHERE session_id = ?1 ORDER BY id ASC LIMIT ?2)",
                params![session.session_id, removed as i64],
            )
            .and_then(|_| persist_total(&self.conn, &session.session_id, session.total_tokens));
        if let Err(e) = persisted {
            tracing::warn!(session_id = %session.session_id, error = %e, "failed to persist prune");
        }
        tracing::debug!(
            session_id = %session.session_id,
            removed,
            total_tokens = session.total_tokens,
            "history pruned"
        );
        removed
    }

    /// 结束当前会话：记录结束时间并按消息重算总数；返回已关闭的会话
    pub fn end_session(&mut self) -> Option<Session> {
        let mut session = self.current.take()?;
        let ended_at = Utc::now();
        session.ended_at = Some(ended_at);
        session.total_tokens = session.messages.iter().map(|m| m.token_count).sum();
        if let Err(e) = self.conn.execute(
            "UPDATE sessions SET ended_at = ?1, total_tokens = ?2 WHERE session_id = ?3",
            params![ended_at, session.total_tokens as i64, session.session_id],
        ) {
            tracing::warn!(session_id = %session.session_id, error = %e, "failed to persist session end");
        }
        tracing::info!(
            session_id = %session.session_id,
            messages = session.messages.len(),
            total_tokens = session.total_tokens,
            "history session ended"
        );
        Some(session)
    }

    /// 清空当前会话的全部消息（会话本身保留）
    pub fn clear_current_session(&mut self) {
        let Some(session) = self.current.as_mut() else {
            return;
        };
        session.messages.clear();
        session.total_tokens = 0;
        let persisted = self
            .conn
            .execute(
                "DELETE FROM messages WHERE session_id = ?1",
                params![session.session_id],
            )
            .and_then(|_| persist_total(&self.conn, &session.session_id, 0));
        if let Err(e) = persisted {
            tracing::warn!(session_id = %session.session_id, error = %e, "failed to persist clear");
        }
    }

    /// 当前会话的最近 limit 条消息（按时间顺序）
    pub fn recent_messages(&self, limit: usize) -> Vec<Message> {
        match &self.current {
            Some(s) => {
                let start = s.messages.len().saturating_sub(limit);
                s.messages[start..].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// 按 id 查询会话（当前会话直接返回内存副本，否则从库中加载）
    pub fn session(&self, session_id: &str) -> Result<Session, HistoryError> {
        if let Some(current) = self.current.as_ref().filter(|s| s.session_id == session_id) {
            return Ok(current.clone());
        }
        self.load_session(session_id)
    }

    fn load_session(&self, session_id: &str) -> Result<Session, HistoryError> {
        let head = self
            .conn
            .query_row(
                "SELECT session_id, started_at, ended_at, total_tokens, model \
                 FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok(Session {
                        session_id: row.get(0)?,
                        started_at: row.get(1)?,
                        ended_at: row.get(2)?,
                        total_tokens: row.get::<_, i64>(3)? as usize,
                        model: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                        messages: Vec::new(),
                    })
                },
            )
            .optional()?;
        let mut session = head.ok_or_else(|| HistoryError::SessionNotFound(session_id.to_string()))?;

        let mut stmt = self.conn.prepare(
            "SELECT role, content, timestamp, tokens, metadata \
             FROM messages WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            let role: String = row.get(0)?;
            let metadata: Option<String> = row.get(4)?;
            Ok(Message {
                role: Role::parse(&role).unwrap_or(Role::User),
                content: row.get(1)?,
                timestamp: row.get(2)?,
                token_count: row.get::<_, i64>(3)? as usize,
                metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
            })
        })?;
        for message in rows {
            session.messages.push(message?);
        }
        Ok(session)
    }

    /// 最近的会话摘要，按开始时间倒序
    pub fn list_sessions(&self, limit: usize) -> Result<Vec<SessionSummary>, HistoryError> {
        let mut stmt = self.conn.prepare(
            "SELECT s.session_id, s.started_at, s.ended_at, s.model, s.total_tokens, \
                    (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.session_id) \
             FROM sessions s ORDER BY s.started_at DESC, s.session_id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(SessionSummary {
                session_id: row.get(0)?,
                started_at: row.get(1)?,
                ended_at: row.get(2)?,
                model: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                total_tokens: row.get::<_, i64>(4)? as usize,
                message_count: row.get::<_, i64>(5)? as usize,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(HistoryError::from)
    }

    /// 导出会话为单个 JSON 文档
    pub fn export_session(
        &self,
        session_id: &str,
        path: impl AsRef<Path>,
    ) -> Result<(), HistoryError> {
        let session = self.session(session_id)?;
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(&session)?)?;
        tracing::info!(session_id = %session_id, path = %path.display(), "session exported");
        Ok(())
    }

    /// 读取导出文件
    pub fn load_export(path: impl AsRef<Path>) -> Result<Session, HistoryError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// 将导出的会话写入库（同 id 已存在时整体替换）
    pub fn import_session(&mut self, session: &Session) -> Result<(), HistoryError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE session_id = ?1",
            params![session.session_id],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO sessions (session_id, started_at, ended_at, total_tokens, model) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.session_id,
                session.started_at,
                session.ended_at,
                session.total_tokens as i64,
                session.model
            ],
        )?;
        for message in &session.messages {
            persist_message(&tx, &session.session_id, message)?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn persist_message(conn: &Connection, session_id: &str, message: &Message) -> rusqlite::Result<()> {
    let metadata = message.metadata.as_ref().map(|m| m.to_string());
    conn.execute(
        "INSERT INTO messages (session_id, role, content, timestamp, tokens, metadata) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            session_id,
            message.role.as_str(),
            message.content,
            message.timestamp,
            message.token_count as i64,
            metadata
        ],
    )?;
    Ok(())
}

fn persist_total(conn: &Connection, session_id: &str, total: usize) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE sessions SET total_tokens = ?1 WHERE session_id = ?2",
        params![total as i64, session_id],
    )?;
    Ok(())
}
