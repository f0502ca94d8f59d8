//! 记忆层：短期（会话对话窗口）、长期（事实与执行记录）、向量（语义检索）

pub mod conversation;
pub mod in_memory;
pub mod record;
pub mod sqlite;
pub mod store;
pub mod tokenizer;

pub use conversation::{ConversationMemory, Message, Role};
pub use in_memory::InMemoryStore;
pub use record::{MemoryRecord, MemoryScope};
pub use sqlite::SqliteStore;
pub use store::{cosine_similarity, remembered_fact, MemoryError, MemorySnapshot, MemoryStore, FACT_PREFIX};
