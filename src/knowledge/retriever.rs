//! 知识检索（RAG）
//!
//! 相关度 = vector_weight * 余弦相似度 + (1 - vector_weight) * 关键词 Jaccard；
//! 低于 min_relevance 的片段丢弃，无结果时返回空列表而不是错误。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

use crate::knowledge::chunker::{Chunker, ChunkingConfig};
use crate::llm::{EmbeddingProvider, LlmError};
use crate::memory::tokenizer;
use crate::memory::{MemoryError, MemoryRecord, MemoryScope, MemoryStore};

/// 知识片段 key 前缀
pub const DOC_PREFIX: &str = "doc/";

/// 检索到的片段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub text: String,
    pub source: String,
    pub score: f32,
}

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("embedding failed: {0}")]
    Embedding(#[from] LlmError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid glob pattern: {0}")]
    Pattern(String),
}

#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    pub min_relevance: f32,
    pub vector_weight: f32,
    /// 每个返回结果从向量索引取多少候选
    pub candidate_factor: usize,
    pub chunking: ChunkingConfig,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            min_relevance: 0.15,
            vector_weight: 0.7,
            candidate_factor: 4,
            chunking: ChunkingConfig::default(),
        }
    }
}

/// 目录导入结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub documents: usize,
    pub chunks: usize,
    pub skipped: Vec<PathBuf>,
}

pub struct KnowledgeRetriever {
    store: Arc<dyn MemoryStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Chunker,
    config: RetrieverConfig,
}

impl KnowledgeRetriever {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: RetrieverConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            chunker: Chunker::new(config.chunking.clone()),
            config,
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        Ok(self.embedder.embed(text).await?)
    }

    /// 检索与 query 最相关的 top_k 个片段（降序）
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<Passage>, RetrievalError> {
        if query.trim().is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let embedding = self.embed(query).await?;
        let candidates = self
            .store
            .nearest(&embedding, top_k * self.config.candidate_factor.max(1))?;
        let query_terms = tokenizer::tokenize_to_set(query);

        let mut passages: Vec<Passage> = candidates
            .into_iter()
            .filter_map(|(record, cosine)| {
                let text = record.text()?.to_string();
                let keyword = tokenizer::jaccard_similarity(&query_terms, &tokenizer::tokenize_to_set(&text));
                let score = self.config.vector_weight * cosine.max(0.0)
                    + (1.0 - self.config.vector_weight) * keyword;
                let source = record
                    .value
                    .get("source")
                    .and_then(|v| v.as_str())
                    .unwrap_or(&record.key)
                    .to_string();
                Some(Passage { text, source, score })
            })
            .filter(|p| p.score >= self.config.min_relevance)
            .collect();

        passages.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.source.cmp(&b.source))
        });
        passages.truncate(top_k);
        tracing::debug!(query = %query, hits = passages.len(), "knowledge retrieved");
        Ok(passages)
    }

    /// 分块、嵌入并写入向量记忆；同一 doc_id 重新导入时替换旧片段
    pub async fn ingest_document(&self, doc_id: &str, text: &str) -> Result<usize, RetrievalError> {
        let chunks = self.chunker.chunk(doc_id, text);
        let mut records = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            let embedding = self.embed(&chunk.text).await?;
            records.push(MemoryRecord::vector(
                format!("{DOC_PREFIX}{doc_id}/{index:05}"),
                serde_json::json!({
                    "text": chunk.text,
                    "source": doc_id,
                    "offset": chunk.offset,
                }),
                embedding,
            ));
        }
        let count = records.len();
        self.store
            .replace_prefix(MemoryScope::Vector, &format!("{DOC_PREFIX}{doc_id}/"), records)?;
        tracing::info!(doc_id = %doc_id, chunks = count, "document ingested");
        Ok(count)
    }

    /// 导入 root 下相对路径匹配 pattern 的所有 UTF-8 文本文件
    pub async fn ingest_dir(&self, root: &Path, pattern: &str) -> Result<IngestReport, RetrievalError> {
        let matcher = glob::Pattern::new(pattern).map_err(|e| RetrievalError::Pattern(e.to_string()))?;
        let mut report = IngestReport::default();

        let mut files: Vec<PathBuf> = WalkDir::new(root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.strip_prefix(root)
                    .map(|rel| matcher.matches_path(rel))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        let mut seen = HashSet::new();
        for path in files {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            let doc_id = rel.to_string_lossy().replace('\\', "/");
            if !seen.insert(doc_id.clone()) {
                continue;
            }
            let bytes = tokio::fs::read(&path).await.map_err(|source| RetrievalError::Io {
                path: path.clone(),
                source,
            })?;
            let text = match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    tracing::warn!(path = ?path, "skipping non UTF-8 file");
                    report.skipped.push(path);
                    continue;
                }
            };
            report.chunks += self.ingest_document(&doc_id, &text).await?;
            report.documents += 1;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::HashEmbedder;
    use crate::memory::InMemoryStore;

    fn retriever() -> KnowledgeRetriever {
        KnowledgeRetriever::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(HashEmbedder::default()),
            RetrieverConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_empty_index_returns_no_passages() {
        let passages = retriever().retrieve("what is rust", 3).await.unwrap();
        assert!(passages.is_empty());
    }

    #[tokio::test]
    async fn test_retrieves_relevant_chunk_first() {
        let r = retriever();
        r.ingest_document("rust.md", "Rust ownership rules: each value has a single owner.")
            .await
            .unwrap();
        r.ingest_document("cooking.md", "Banana bread needs ripe bananas and flour.")
            .await
            .unwrap();
        let passages = r.retrieve("rust ownership", 2).await.unwrap();
        assert!(!passages.is_empty());
        assert_eq!(passages[0].source, "rust.md");
        assert!(passages.iter().all(|p| p.score >= 0.15));
    }

    #[tokio::test]
    async fn test_reingest_replaces_chunks() {
        let store: Arc<dyn MemoryStore> = Arc::new(InMemoryStore::new());
        let r = KnowledgeRetriever::new(
            store.clone(),
            Arc::new(HashEmbedder::default()),
            RetrieverConfig {
                chunking: ChunkingConfig {
                    chunk_size: 20,
                    chunk_overlap: 0,
                    ..ChunkingConfig::default()
                },
                ..RetrieverConfig::default()
            },
        );
        let first = r
            .ingest_document("notes", "one two three four five six seven eight nine ten")
            .await
            .unwrap();
        assert!(first > 1);
        assert_eq!(r.ingest_document("notes", "short").await.unwrap(), 1);
        assert_eq!(store.list(MemoryScope::Vector, "doc/notes/").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_reingest_keeps_previous_chunks() {
        let store = Arc::new(crate::memory::SqliteStore::open_in_memory().unwrap());
        let r = KnowledgeRetriever::new(
            store.clone(),
            Arc::new(HashEmbedder::default()),
            RetrieverConfig::default(),
        );
        r.ingest_document("paris.md", "Paris is the capital of France.")
            .await
            .unwrap();
        store
            .execute_batch(
                "CREATE TRIGGER reject_writes BEFORE INSERT ON memory_records
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();

        let err = r
            .ingest_document("paris.md", "Paris has many museums.")
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::Memory(_)));
        let chunks = store.list(MemoryScope::Vector, "doc/paris.md/").unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text(), Some("Paris is the capital of France."));
        let passages = r.retrieve("capital of France", 1).await.unwrap();
        assert_eq!(passages[0].source, "paris.md");
    }

    #[tokio::test]
    async fn test_ingest_dir_filters_by_glob() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "Paris is the capital of France.").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.md"), "Berlin is the capital of Germany.").unwrap();
        std::fs::write(dir.path().join("c.txt"), "ignored").unwrap();
        std::fs::write(dir.path().join("d.md"), [0xff, 0xfe, 0x00]).unwrap();

        let r = retriever();
        let report = r.ingest_dir(dir.path(), "**/*.md").await.unwrap();
        assert_eq!(report.documents, 2);
        assert_eq!(report.skipped.len(), 1);
        let passages = r.retrieve("capital of Germany", 1).await.unwrap();
        assert_eq!(passages[0].source, "sub/b.md");
    }

    #[tokio::test]
    async fn test_invalid_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let err = retriever().ingest_dir(dir.path(), "[").await.unwrap_err();
        assert!(matches!(err, RetrievalError::Pattern(_)));
    }
}
