//! 知识层：文档分块、导入与检索

pub mod chunker;
pub mod retriever;

pub use chunker::{Chunk, Chunker, ChunkingConfig};
pub use retriever::{IngestReport, KnowledgeRetriever, Passage, RetrievalError, RetrieverConfig, DOC_PREFIX};
