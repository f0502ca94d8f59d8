//! 记忆记录
//!
//! 以 (scope, key) 唯一定位；vector 记录必须带 embedding，其余不得带。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::store::MemoryError;

/// 记忆作用域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    /// 会话内对话窗口，随会话结束或 TTL 过期
    ShortTerm,
    /// 持久事实与执行记录
    LongTerm,
    /// 带向量的语义记忆（知识片段、对话摘要）
    Vector,
}

impl MemoryScope {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryScope::ShortTerm => "short_term",
            MemoryScope::LongTerm => "long_term",
            MemoryScope::Vector => "vector",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "short_term" => Some(MemoryScope::ShortTerm),
            "long_term" => Some(MemoryScope::LongTerm),
            "vector" => Some(MemoryScope::Vector),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub scope: MemoryScope,
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub timestamp: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn short_term(key: impl Into<String>, value: Value) -> Self {
        Self::new(MemoryScope::ShortTerm, key, value, None)
    }

    pub fn long_term(key: impl Into<String>, value: Value) -> Self {
        Self::new(MemoryScope::LongTerm, key, value, None)
    }

    pub fn vector(key: impl Into<String>, value: Value, embedding: Vec<f32>) -> Self {
        Self::new(MemoryScope::Vector, key, value, Some(embedding))
    }

    fn new(scope: MemoryScope, key: impl Into<String>, value: Value, embedding: Option<Vec<f32>>) -> Self {
        Self {
            scope,
            key: key.into(),
            value,
            embedding,
            timestamp: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// 写入前校验：key 非空；embedding 与 scope 一致
    pub fn validate(&self) -> Result<(), MemoryError> {
        if self.key.trim().is_empty() {
            return Err(MemoryError::InvalidRecord("empty key".to_string()));
        }
        match (self.scope, &self.embedding) {
            (MemoryScope::Vector, None) => Err(MemoryError::InvalidRecord(format!(
                "vector record {} has no embedding",
                self.key
            ))),
            (MemoryScope::Vector, Some(e)) if e.is_empty() => Err(MemoryError::InvalidRecord(
                format!("vector record {} has an empty embedding", self.key),
            )),
            (MemoryScope::ShortTerm | MemoryScope::LongTerm, Some(_)) => Err(
                MemoryError::InvalidRecord(format!(
                    "{} record {} must not carry an embedding",
                    self.scope.as_str(),
                    self.key
                )),
            ),
            _ => Ok(()),
        }
    }

    /// value 中的文本（text 字段或字符串本身），用于检索与展示
    pub fn text(&self) -> Option<&str> {
        self.value
            .get("text")
            .and_then(|v| v.as_str())
            .or_else(|| self.value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_embedding_matches_scope() {
        assert!(MemoryRecord::vector("k", Value::Null, vec![0.1]).validate().is_ok());
        let mut r = MemoryRecord::long_term("k", Value::Null);
        assert!(r.validate().is_ok());
        r.embedding = Some(vec![1.0]);
        assert!(r.validate().is_err());
        let mut v = MemoryRecord::vector("k", Value::Null, vec![]);
        assert!(v.validate().is_err());
        v.embedding = None;
        assert!(v.validate().is_err());
        assert!(MemoryRecord::short_term("  ", Value::Null).validate().is_err());
    }

    #[test]
    fn test_scope_round_trips_as_str() {
        for scope in [MemoryScope::ShortTerm, MemoryScope::LongTerm, MemoryScope::Vector] {
            assert_eq!(MemoryScope::parse(scope.as_str()), Some(scope));
        }
    }
}
