//! SQLite 后端（rusqlite，bundled）
//!
//! 表 memory_records，主键 (scope, key)；embedding 以 JSON 数组存储，时间戳为毫秒。
//! upsert_many 与 replace_prefix 各在单个事务内完成。

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use crate::memory::record::{MemoryRecord, MemoryScope};
use crate::memory::store::{
    cosine_similarity, rank_nearest, validate_replacement, MemoryError, MemoryStore,
};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| MemoryError::Backend(format!("create {:?}: {}", parent, e)))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, MemoryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, MemoryError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS memory_records (
                scope TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                embedding TEXT,
                timestamp_ms INTEGER NOT NULL,
                PRIMARY KEY (scope, key)
            );
            CREATE INDEX IF NOT EXISTS idx_memory_scope_ts ON memory_records(scope, timestamp_ms);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, MemoryError> {
        self.conn
            .lock()
            .map_err(|_| MemoryError::Backend("sqlite connection lock poisoned".to_string()))
    }

    /// 测试用：直接执行 SQL（如安装让写入失败的触发器）
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<(), MemoryError> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }
}

struct RawRecord {
    scope: String,
    key: String,
    value: String,
    embedding: Option<String>,
    timestamp_ms: i64,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            scope: row.get(0)?,
            key: row.get(1)?,
            value: row.get(2)?,
            embedding: row.get(3)?,
            timestamp_ms: row.get(4)?,
        })
    }

    fn decode(self) -> Result<MemoryRecord, MemoryError> {
        let scope = MemoryScope::parse(&self.scope)
            .ok_or_else(|| MemoryError::Backend(format!("unknown scope in database: {}", self.scope)))?;
        let embedding = match self.embedding {
            Some(raw) => Some(serde_json::from_str::<Vec<f32>>(&raw)?),
            None => None,
        };
        Ok(MemoryRecord {
            scope,
            key: self.key,
            value: serde_json::from_str(&self.value)?,
            embedding,
            timestamp: from_millis(self.timestamp_ms),
        })
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// LIKE 会把 _ 与 % 当作通配符，前缀匹配改用 substr
const PREFIX_MATCH: &str = "substr(key, 1, length(?2)) = ?2";

/// 事务内逐条 upsert；由调用方提交
fn write_records(tx: &Transaction<'_>, records: &[MemoryRecord]) -> Result<(), MemoryError> {
    let mut stmt = tx.prepare(
        "INSERT INTO memory_records (scope, key, value, embedding, timestamp_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(scope, key) DO UPDATE SET
            value = excluded.value,
            embedding = excluded.embedding,
            timestamp_ms = excluded.timestamp_ms",
    )?;
    for record in records {
        let embedding = match &record.embedding {
            Some(e) => Some(serde_json::to_string(e)?),
            None => None,
        };
        stmt.execute(params![
            record.scope.as_str(),
            record.key,
            serde_json::to_string(&record.value)?,
            embedding,
            record.timestamp.timestamp_millis(),
        ])?;
    }
    Ok(())
}

const COLUMNS: &str = "scope, key, value, embedding, timestamp_ms";

impl MemoryStore for SqliteStore {
    fn upsert_many(&self, records: Vec<MemoryRecord>) -> Result<(), MemoryError> {
        for record in &records {
            record.validate()?;
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        write_records(&tx, &records)?;
        tx.commit()?;
        Ok(())
    }

    fn get(&self, scope: MemoryScope, key: &str) -> Result<Option<MemoryRecord>, MemoryError> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM memory_records WHERE scope = ?1 AND key = ?2"),
                params![scope.as_str(), key],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::decode).transpose()
    }

    fn list(&self, scope: MemoryScope, prefix: &str) -> Result<Vec<MemoryRecord>, MemoryError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM memory_records WHERE scope = ?1 AND {PREFIX_MATCH} ORDER BY key"
        ))?;
        let rows = stmt
            .query_map(params![scope.as_str(), prefix], RawRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRecord::decode).collect()
    }

    fn nearest(&self, embedding: &[f32], k: usize) -> Result<Vec<(MemoryRecord, f32)>, MemoryError> {
        let records = self.list(MemoryScope::Vector, "")?;
        let scored = records
            .into_iter()
            .filter_map(|r| {
                let score = r.embedding.as_deref().map(|e| cosine_similarity(embedding, e))?;
                Some((r, score))
            })
            .collect();
        Ok(rank_nearest(scored, k))
    }

    fn remove_prefix(&self, scope: MemoryScope, prefix: &str) -> Result<usize, MemoryError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            &format!("DELETE FROM memory_records WHERE scope = ?1 AND {PREFIX_MATCH}"),
            params![scope.as_str(), prefix],
        )?;
        Ok(removed)
    }

    fn replace_prefix(
        &self,
        scope: MemoryScope,
        prefix: &str,
        records: Vec<MemoryRecord>,
    ) -> Result<usize, MemoryError> {
        validate_replacement(scope, prefix, &records)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            &format!("DELETE FROM memory_records WHERE scope = ?1 AND {PREFIX_MATCH}"),
            params![scope.as_str(), prefix],
        )?;
        write_records(&tx, &records)?;
        tx.commit()?;
        Ok(removed)
    }

    fn expire_short_term(&self, cutoff: DateTime<Utc>) -> Result<usize, MemoryError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM memory_records WHERE scope = ?1 AND timestamp_ms < ?2",
            params![MemoryScope::ShortTerm.as_str(), cutoff.timestamp_millis()],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .upsert(MemoryRecord::vector(
                    "episode/1",
                    serde_json::json!({"text": "weather in Paris"}),
                    vec![0.6, 0.8],
                ))
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let r = store.get(MemoryScope::Vector, "episode/1").unwrap().unwrap();
        assert_eq!(r.embedding, Some(vec![0.6, 0.8]));
        assert_eq!(r.text(), Some("weather in Paris"));
    }

    #[test]
    fn test_prefix_with_underscore_is_literal() {
        let store = SqliteStore::open_in_memory().unwrap();
        for key in ["session/a_b/1", "session/axb/1"] {
            store
                .upsert(MemoryRecord::short_term(key, serde_json::json!({})))
                .unwrap();
        }
        assert_eq!(store.list(MemoryScope::ShortTerm, "session/a_b/").unwrap().len(), 1);
        assert_eq!(store.remove_prefix(MemoryScope::ShortTerm, "session/a_b/").unwrap(), 1);
        assert_eq!(store.list(MemoryScope::ShortTerm, "session/").unwrap().len(), 1);
    }

    #[test]
    fn test_failed_batch_rolls_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert(MemoryRecord::long_term("fact/a", serde_json::json!("old")))
            .unwrap();
        let batch = vec![
            MemoryRecord::long_term("fact/a", serde_json::json!("new")),
            MemoryRecord::vector("bad", serde_json::json!(null), vec![]),
        ];
        assert!(store.upsert_many(batch).is_err());
        let r = store.get(MemoryScope::LongTerm, "fact/a").unwrap().unwrap();
        assert_eq!(r.value, serde_json::json!("old"));
    }

    #[test]
    fn test_replace_prefix_rolls_back_on_write_failure() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert(MemoryRecord::vector("doc/a/00000", serde_json::json!("old"), vec![1.0]))
            .unwrap();
        // 删除旧记录之后、写入第二条时失败
        store
            .execute_batch(
                "CREATE TRIGGER fail_second BEFORE INSERT ON memory_records
                 WHEN NEW.key = 'doc/a/00001'
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();
        let result = store.replace_prefix(
            MemoryScope::Vector,
            "doc/a/",
            vec![
                MemoryRecord::vector("doc/a/00000", serde_json::json!("new 0"), vec![1.0]),
                MemoryRecord::vector("doc/a/00001", serde_json::json!("new 1"), vec![1.0]),
            ],
        );
        assert!(matches!(result, Err(MemoryError::Backend(_))));
        let kept = store.list(MemoryScope::Vector, "doc/a/").unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].value, serde_json::json!("old"));

        store.execute_batch("DROP TRIGGER fail_second;").unwrap();
        let removed = store
            .replace_prefix(
                MemoryScope::Vector,
                "doc/a/",
                vec![MemoryRecord::vector("doc/a/00001", serde_json::json!("new 1"), vec![1.0])],
            )
            .unwrap();
        assert_eq!(removed, 1);
        let kept = store.list(MemoryScope::Vector, "doc/a/").unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].key, "doc/a/00001");
    }

    #[test]
    fn test_upsert_updates_in_place() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert(MemoryRecord::long_term("fact/a", serde_json::json!(1)))
            .unwrap();
        store
            .upsert(MemoryRecord::long_term("fact/a", serde_json::json!(2)))
            .unwrap();
        let all = store.list(MemoryScope::LongTerm, "").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value, serde_json::json!(2));
    }
}
