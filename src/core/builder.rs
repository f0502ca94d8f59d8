//! Brain 构建器：统一的组件初始化逻辑
//!
//! 未指定的组件使用离线默认值：规则引擎规划、模板合成、规则依据校验、哈希嵌入、内存存储。
//! `from_app_config` 按配置选择模型后端、记忆后端（SQLite 会创建所在目录）与内置工具。

use std::sync::Arc;

use thiserror::Error;

use crate::cognition::{
    GroundingCheck, ModelGrounding, Planner, RuleBasedGrounding, Synthesizer, Verifier,
};
use crate::config::AppConfig;
use crate::core::orchestrator::{Brain, BrainConfig};
use crate::knowledge::{ChunkingConfig, KnowledgeRetriever, RetrieverConfig};
use crate::llm::{
    EmbeddingProvider, HashEmbedder, LlmClient, OpenAiClient, OpenAiEmbedder, RuleBasedLlmClient,
};
use crate::memory::{InMemoryStore, MemoryError, MemoryStore, SqliteStore};
use crate::tools::{
    CalculatorTool, EchoTool, FetchPageTool, OpenApplicationTool, OpenWebsiteTool, RegistryError,
    Tool, ToolRegistry, WeatherTool,
};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

#[derive(Default)]
pub struct BrainBuilder {
    config: BrainConfig,
    llm: Option<Arc<dyn LlmClient>>,
    synthesis_llm: Option<Arc<dyn LlmClient>>,
    grounding: Option<Arc<dyn GroundingCheck>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    memory: Option<Arc<dyn MemoryStore>>,
    retriever_config: RetrieverConfig,
    tools: Vec<Arc<dyn Tool>>,
}

impl BrainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: BrainConfig) -> Self {
        self.config = config;
        self
    }

    /// 规划用模型
    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 回复合成用模型（不设置则使用模板）
    pub fn synthesis_model(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.synthesis_llm = Some(llm);
        self
    }

    pub fn grounding(mut self, grounding: Arc<dyn GroundingCheck>) -> Self {
        self.grounding = Some(grounding);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn retriever_config(mut self, config: RetrieverConfig) -> Self {
        self.retriever_config = config;
        self
    }

    pub fn tool(self, tool: impl Tool + 'static) -> Self {
        self.tool_arc(Arc::new(tool))
    }

    pub fn tool_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// 按应用配置选择后端并注册内置工具
    pub fn from_app_config(cfg: &AppConfig) -> Result<Self, BuildError> {
        let mut builder = Self::new().config(cfg.brain_config());

        let provider = cfg.llm.provider.to_lowercase();
        let api_key = cfg.llm.api_key();
        let model: Option<Arc<dyn LlmClient>> = match (provider.as_str(), api_key) {
            ("rules", _) => None,
            (_, Some(key)) => {
                tracing::info!(model = %cfg.llm.model, "Using OpenAI-compatible LLM");
                Some(Arc::new(OpenAiClient::new(
                    cfg.llm.base_url.as_deref(),
                    &cfg.llm.model,
                    &key,
                    cfg.llm.temperature,
                )))
            }
            ("openai", None) => {
                tracing::warn!(env = %cfg.llm.api_key_env, "No API key set, using rule-based planner");
                None
            }
            _ => None,
        };

        match &model {
            Some(llm) => {
                builder = builder.llm(llm.clone()).synthesis_model(llm.clone());
                if cfg.verifier.backend.eq_ignore_ascii_case("model") {
                    builder = builder.grounding(Arc::new(ModelGrounding::new(
                        llm.clone(),
                        cfg.verifier.model_threshold,
                        RuleBasedGrounding::new(cfg.verifier.min_coverage),
                    )));
                }
            }
            None => tracing::info!("Using rule-based planner (offline)"),
        }
        if builder.grounding.is_none() {
            builder = builder.grounding(Arc::new(RuleBasedGrounding::new(cfg.verifier.min_coverage)));
        }

        let embedder: Arc<dyn EmbeddingProvider> = match (&cfg.llm.embedding_model, cfg.llm.api_key()) {
            (Some(embedding_model), Some(key)) if model.is_some() => Arc::new(OpenAiEmbedder::new(
                cfg.llm.base_url.as_deref(),
                embedding_model,
                &key,
            )),
            _ => Arc::new(HashEmbedder::new(cfg.retrieval.embedding_dims)),
        };
        builder = builder.embedder(embedder);

        let memory: Arc<dyn MemoryStore> = if cfg.memory.backend.eq_ignore_ascii_case("sqlite") {
            let path = &cfg.memory.sqlite_path;
            tracing::info!(path = %path.display(), "Using SQLite memory");
            Arc::new(SqliteStore::open(path)?)
        } else {
            Arc::new(InMemoryStore::new())
        };
        builder = builder.memory(memory);

        builder = builder.retriever_config(RetrieverConfig {
            min_relevance: cfg.retrieval.min_relevance,
            vector_weight: cfg.retrieval.vector_weight,
            chunking: ChunkingConfig {
                chunk_size: cfg.retrieval.chunk_size,
                chunk_overlap: cfg.retrieval.chunk_overlap,
                ..ChunkingConfig::default()
            },
            ..RetrieverConfig::default()
        });

        let tools = &cfg.tools;
        Ok(builder
            .tool(CalculatorTool::new())
            .tool(EchoTool::new())
            .tool(WeatherTool::new(
                tools.weather.base_url.clone(),
                tools.weather.default_location.clone(),
                tools.weather.timeout_secs,
            ))
            .tool(FetchPageTool::new(
                tools.fetch.allowed_domains.clone(),
                tools.fetch.timeout_secs,
                tools.fetch.max_result_chars,
            ))
            .tool(OpenWebsiteTool::new(tools.open_website.enabled))
            .tool(OpenApplicationTool::new(
                tools.open_application.apps.clone(),
                tools.open_application.enabled,
            )))
    }

    pub fn build(self) -> Result<Brain, BuildError> {
        let mut registry = ToolRegistry::new();
        for tool in self.tools {
            registry.register_arc(tool)?;
        }
        let registry = Arc::new(registry);

        let llm = self
            .llm
            .unwrap_or_else(|| Arc::new(RuleBasedLlmClient::new()));
        let memory = self.memory.unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let embedder = self
            .embedder
            .unwrap_or_else(|| Arc::new(HashEmbedder::default()));
        let grounding = self
            .grounding
            .unwrap_or_else(|| Arc::new(RuleBasedGrounding::default()));
        let synthesizer = match self.synthesis_llm {
            Some(llm) => Synthesizer::with_model(llm),
            None => Synthesizer::template(),
        };

        let retriever = Arc::new(KnowledgeRetriever::new(
            memory.clone(),
            embedder,
            self.retriever_config,
        ));
        let planner = Planner::new(llm, registry.clone());
        let verifier = Verifier::new(registry.clone(), grounding);

        tracing::info!(
            tools = ?registry.tool_names(),
            max_replans = self.config.max_replans,
            "brain ready"
        );
        Ok(Brain::new(
            self.config,
            registry,
            memory,
            retriever,
            planner,
            verifier,
            synthesizer,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_tool_fails_build() {
        let result = BrainBuilder::new()
            .tool(EchoTool::new())
            .tool(EchoTool::new())
            .build();
        assert!(matches!(result, Err(BuildError::Registry(RegistryError::DuplicateTool(_)))));
    }

    #[test]
    fn test_from_app_config_registers_builtin_tools() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "rules".to_string();
        let brain = BrainBuilder::from_app_config(&cfg).unwrap().build().unwrap();
        let names = brain.registry().tool_names();
        for name in ["calculator", "echo", "fetch_page", "open_application", "open_website", "weather"] {
            assert!(names.contains(&name.to_string()), "missing {name}");
        }
    }

    #[test]
    fn test_sqlite_backend_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "rules".to_string();
        cfg.memory.backend = "sqlite".to_string();
        cfg.memory.sqlite_path = dir.path().join("nested/jarvis.db");
        BrainBuilder::from_app_config(&cfg).unwrap().build().unwrap();
        assert!(dir.path().join("nested/jarvis.db").exists());
    }
}
