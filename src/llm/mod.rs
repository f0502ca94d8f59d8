//! LLM 层：客户端抽象与实现（OpenAI 兼容 / 规则引擎 / 脚本化测试客户端）与嵌入

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod rules;
pub mod traits;

pub use embedding::{EmbeddingProvider, HashEmbedder, OpenAiEmbedder};
pub use mock::ScriptedLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use rules::RuleBasedLlmClient;
pub use traits::{LlmClient, LlmError};
