//! 内存后端：RwLock<BTreeMap>，用于测试与无持久化部署

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::memory::record::{MemoryRecord, MemoryScope};
use crate::memory::store::{
    cosine_similarity, rank_nearest, validate_replacement, MemoryError, MemoryStore,
};

#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<BTreeMap<(MemoryScope, String), MemoryRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> MemoryError {
        MemoryError::Backend("memory lock poisoned".to_string())
    }
}

impl MemoryStore for InMemoryStore {
    fn upsert_many(&self, records: Vec<MemoryRecord>) -> Result<(), MemoryError> {
        // 先全部校验，再一次性写入
        for record in &records {
            record.validate()?;
        }
        let mut map = self.records.write().map_err(|_| Self::poisoned())?;
        for record in records {
            map.insert((record.scope, record.key.clone()), record);
        }
        Ok(())
    }

    fn get(&self, scope: MemoryScope, key: &str) -> Result<Option<MemoryRecord>, MemoryError> {
        let map = self.records.read().map_err(|_| Self::poisoned())?;
        Ok(map.get(&(scope, key.to_string())).cloned())
    }

    fn list(&self, scope: MemoryScope, prefix: &str) -> Result<Vec<MemoryRecord>, MemoryError> {
        let map = self.records.read().map_err(|_| Self::poisoned())?;
        Ok(map
            .range((scope, prefix.to_string())..)
            .take_while(|((s, k), _)| *s == scope && k.starts_with(prefix))
            .map(|(_, r)| r.clone())
            .collect())
    }

    fn nearest(&self, embedding: &[f32], k: usize) -> Result<Vec<(MemoryRecord, f32)>, MemoryError> {
        let map = self.records.read().map_err(|_| Self::poisoned())?;
        let scored = map
            .values()
            .filter(|r| r.scope == MemoryScope::Vector)
            .filter_map(|r| {
                r.embedding
                    .as_deref()
                    .map(|e| (r.clone(), cosine_similarity(embedding, e)))
            })
            .collect();
        Ok(rank_nearest(scored, k))
    }

    fn remove_prefix(&self, scope: MemoryScope, prefix: &str) -> Result<usize, MemoryError> {
        let mut map = self.records.write().map_err(|_| Self::poisoned())?;
        let before = map.len();
        map.retain(|(s, k), _| !(*s == scope && k.starts_with(prefix)));
        Ok(before - map.len())
    }

    fn replace_prefix(
        &self,
        scope: MemoryScope,
        prefix: &str,
        records: Vec<MemoryRecord>,
    ) -> Result<usize, MemoryError> {
        validate_replacement(scope, prefix, &records)?;
        let mut map = self.records.write().map_err(|_| Self::poisoned())?;
        let before = map.len();
        map.retain(|(s, k), _| !(*s == scope && k.starts_with(prefix)));
        let removed = before - map.len();
        for record in records {
            map.insert((record.scope, record.key.clone()), record);
        }
        Ok(removed)
    }

    fn expire_short_term(&self, cutoff: DateTime<Utc>) -> Result<usize, MemoryError> {
        let mut map = self.records.write().map_err(|_| Self::poisoned())?;
        let before = map.len();
        map.retain(|(s, _), r| !(*s == MemoryScope::ShortTerm && r.timestamp < cutoff));
        Ok(before - map.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_upsert_overwrites_same_key() {
        let store = InMemoryStore::new();
        store
            .upsert(MemoryRecord::long_term("fact/a", serde_json::json!(1)))
            .unwrap();
        store
            .upsert(MemoryRecord::long_term("fact/a", serde_json::json!(2)))
            .unwrap();
        let r = store.get(MemoryScope::LongTerm, "fact/a").unwrap().unwrap();
        assert_eq!(r.value, serde_json::json!(2));
        assert!(store.get(MemoryScope::ShortTerm, "fact/a").unwrap().is_none());
    }

    #[test]
    fn test_replace_prefix_swaps_records() {
        let store = InMemoryStore::new();
        store
            .upsert_many(vec![
                MemoryRecord::vector("doc/a/00000", serde_json::json!("old 0"), vec![1.0]),
                MemoryRecord::vector("doc/a/00001", serde_json::json!("old 1"), vec![1.0]),
                MemoryRecord::vector("doc/b/00000", serde_json::json!("other"), vec![1.0]),
            ])
            .unwrap();
        let removed = store
            .replace_prefix(
                MemoryScope::Vector,
                "doc/a/",
                vec![MemoryRecord::vector("doc/a/00000", serde_json::json!("new"), vec![1.0])],
            )
            .unwrap();
        assert_eq!(removed, 2);
        let kept = store.list(MemoryScope::Vector, "doc/").unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].value, serde_json::json!("new"));
        assert_eq!(kept[1].key, "doc/b/00000");
    }

    #[test]
    fn test_rejected_replacement_keeps_old_records() {
        let store = InMemoryStore::new();
        store
            .upsert(MemoryRecord::vector("doc/a/00000", serde_json::json!("old"), vec![1.0]))
            .unwrap();
        let outside = store.replace_prefix(
            MemoryScope::Vector,
            "doc/a/",
            vec![MemoryRecord::vector("doc/b/00000", serde_json::json!("new"), vec![1.0])],
        );
        assert!(matches!(outside, Err(MemoryError::InvalidRecord(_))));
        let invalid = store.replace_prefix(
            MemoryScope::Vector,
            "doc/a/",
            vec![MemoryRecord::vector("doc/a/00000", serde_json::json!("new"), vec![])],
        );
        assert!(invalid.is_err());
        let kept = store.list(MemoryScope::Vector, "doc/a/").unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].value, serde_json::json!("old"));
    }

    #[test]
    fn test_invalid_batch_writes_nothing() {
        let store = InMemoryStore::new();
        let batch = vec![
            MemoryRecord::long_term("ok", serde_json::json!(1)),
            MemoryRecord::long_term("", serde_json::json!(2)),
        ];
        assert!(store.upsert_many(batch).is_err());
        assert!(store.list(MemoryScope::LongTerm, "").unwrap().is_empty());
    }

    #[test]
    fn test_list_by_prefix_sorted() {
        let store = InMemoryStore::new();
        for key in ["session/b/2", "session/a/1", "session/b/1", "other"] {
            store
                .upsert(MemoryRecord::short_term(key, serde_json::json!({})))
                .unwrap();
        }
        let keys: Vec<String> = store
            .list(MemoryScope::ShortTerm, "session/b/")
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec!["session/b/1", "session/b/2"]);
    }

    #[test]
    fn test_nearest_orders_by_similarity() {
        let store = InMemoryStore::new();
        store
            .upsert(MemoryRecord::vector("x", serde_json::json!("x"), vec![1.0, 0.0]))
            .unwrap();
        store
            .upsert(MemoryRecord::vector("y", serde_json::json!("y"), vec![0.0, 1.0]))
            .unwrap();
        let hits = store.nearest(&[0.9, 0.1], 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.key, "x");
    }

    #[test]
    fn test_expire_short_term_only() {
        let store = InMemoryStore::new();
        let old = Utc::now() - Duration::hours(2);
        store
            .upsert(MemoryRecord::short_term("session/a/1", serde_json::json!({})).with_timestamp(old))
            .unwrap();
        store
            .upsert(MemoryRecord::long_term("fact/1", serde_json::json!({})).with_timestamp(old))
            .unwrap();
        let removed = store.expire_short_term(Utc::now() - Duration::hours(1)).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list(MemoryScope::LongTerm, "").unwrap().len(), 1);
    }
}
