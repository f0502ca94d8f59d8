//! 记忆存储抽象
//!
//! 同步 API（内部加锁，调用方不会跨 .await 持锁）；upsert_many 要么全部写入要么全部不写，
//! 中途失败的一轮不会破坏已有记忆。

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

use crate::memory::conversation::{Message, Role};
use crate::memory::record::{MemoryRecord, MemoryScope};

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("invalid memory record: {0}")]
    InvalidRecord(String),

    #[error("memory backend error: {0}")]
    Backend(String),

    #[error("memory serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        MemoryError::Backend(e.to_string())
    }
}

/// 记忆后端：内存实现与 SQLite 实现
pub trait MemoryStore: Send + Sync {
    /// 插入或覆盖 (scope, key)
    fn upsert(&self, record: MemoryRecord) -> Result<(), MemoryError> {
        self.upsert_many(vec![record])
    }

    /// 原子批量写入
    fn upsert_many(&self, records: Vec<MemoryRecord>) -> Result<(), MemoryError>;

    fn get(&self, scope: MemoryScope, key: &str) -> Result<Option<MemoryRecord>, MemoryError>;

    /// 某作用域下 key 以 prefix 开头的记录，按 key 升序
    fn list(&self, scope: MemoryScope, prefix: &str) -> Result<Vec<MemoryRecord>, MemoryError>;

    /// 与 embedding 余弦相似度最高的 k 条 vector 记录（降序）
    fn nearest(&self, embedding: &[f32], k: usize) -> Result<Vec<(MemoryRecord, f32)>, MemoryError>;

    /// 删除某作用域下 key 以 prefix 开头的记录，返回删除数
    fn remove_prefix(&self, scope: MemoryScope, prefix: &str) -> Result<usize, MemoryError>;

    /// 原子替换：删除 prefix 下的旧记录并写入 records，任一步失败则旧记录保持不变；返回删除数
    fn replace_prefix(
        &self,
        scope: MemoryScope,
        prefix: &str,
        records: Vec<MemoryRecord>,
    ) -> Result<usize, MemoryError>;

    /// 删除早于 cutoff 的短期记录，返回删除数
    fn expire_short_term(&self, cutoff: DateTime<Utc>) -> Result<usize, MemoryError>;
}

/// replace_prefix 的写入批次：每条记录合法，且属于 scope 并位于 prefix 下
pub(crate) fn validate_replacement(
    scope: MemoryScope,
    prefix: &str,
    records: &[MemoryRecord],
) -> Result<(), MemoryError> {
    for record in records {
        record.validate()?;
        if record.scope != scope || !record.key.starts_with(prefix) {
            return Err(MemoryError::InvalidRecord(format!(
                "{} record {} is outside {}:{prefix}",
                record.scope.as_str(),
                record.key,
                scope.as_str()
            )));
        }
    }
    Ok(())
}

/// 余弦相似度；维度不一致或零向量返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// 按相似度降序、key 升序排序并截断到 k（各后端共用，保证结果确定）
pub(crate) fn rank_nearest(mut scored: Vec<(MemoryRecord, f32)>, k: usize) -> Vec<(MemoryRecord, f32)> {
    scored.sort_by(|(ra, a), (rb, b)| {
        b.partial_cmp(a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| ra.key.cmp(&rb.key))
    });
    scored.truncate(k);
    scored
}

/// 每轮开始时的只读记忆快照：对话窗口 + 最近的长期事实
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    pub conversation: Vec<Message>,
    pub facts: Vec<MemoryRecord>,
}

/// 长期事实的 key 前缀
pub const FACT_PREFIX: &str = "fact/";

/// "remember that ..." / "记住 ..." 中要记住的内容
pub fn remembered_fact(utterance: &str) -> Option<&str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:please\s+)?(?:remember(?:\s+that)?|记住)\s*[:：]?\s*(.+?)[.。!！]?\s*$")
            .expect("valid fact regex")
    });
    re.captures(utterance)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|f| !f.is_empty())
}

impl MemorySnapshot {
    /// session_window 为空时（如恢复的会话）从短期记录重建对话
    pub fn capture(
        store: &dyn MemoryStore,
        session_window: &[Message],
        short_term_prefix: &str,
        max_facts: usize,
    ) -> Result<Self, MemoryError> {
        let conversation = if session_window.is_empty() {
            let mut messages = Vec::new();
            for record in store.list(MemoryScope::ShortTerm, short_term_prefix)? {
                if let Some(user) = record.value.get("user").and_then(|v| v.as_str()) {
                    messages.push(Message::user(user));
                }
                if let Some(assistant) = record.value.get("assistant").and_then(|v| v.as_str()) {
                    messages.push(Message::assistant(assistant));
                }
            }
            messages
        } else {
            session_window.to_vec()
        };

        let mut facts = store.list(MemoryScope::LongTerm, FACT_PREFIX)?;
        facts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.key.cmp(&b.key)));
        facts.truncate(max_facts);

        Ok(Self { conversation, facts })
    }

    /// 渲染为 prompt 中的对话段落
    pub fn render(&self) -> String {
        let mut out = String::new();
        for msg in &self.conversation {
            let who = match msg.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
            };
            out.push_str(&format!("{who}: {}\n", msg.content));
        }
        if !self.facts.is_empty() {
            out.push_str("Known facts:\n");
            for fact in &self.facts {
                if let Some(text) = fact.text() {
                    out.push_str(&format!("- {text}\n"));
                }
            }
        }
        if out.is_empty() {
            out.push_str("(none)\n");
        }
        out
    }
}
