//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `JARVIS__*` 覆盖（双下划线表示嵌套，如 `JARVIS__LLM__PROVIDER=openai`）。

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::core::BrainConfig;
use crate::tools::default_app_paths;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub orchestrator: OrchestratorSection,
    pub memory: MemorySection,
    pub retrieval: RetrievalSection,
    pub verifier: VerifierSection,
    pub tools: ToolsSection,
}

/// [app] 段：名称与知识库目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 启动时导入的知识库目录（未设置则不导入）
    pub knowledge_dir: Option<PathBuf>,
    /// 知识库文件的 glob（相对 knowledge_dir）
    pub knowledge_glob: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "Jarvis".to_string(),
            knowledge_dir: None,
            knowledge_glob: "**/*.md".to_string(),
        }
    }
}

/// [llm] 段：后端选择
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// auto / openai / rules；auto 时有 API Key 用 openai，否则规则引擎
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: f32,
    /// 读取 API Key 的环境变量名
    pub api_key_env: String,
    /// 嵌入模型；未设置时使用本地哈希嵌入
    pub embedding_model: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "auto".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            temperature: 0.2,
            api_key_env: "OPENAI_API_KEY".to_string(),
            embedding_model: None,
        }
    }
}

impl LlmSection {
    /// 环境变量中的 API Key（空字符串视为未设置）
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.trim().is_empty())
    }
}

/// [orchestrator] 段：编排循环的边界
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub max_replans: u32,
    pub step_timeout_ms: u64,
    pub max_concurrent_steps: usize,
    pub turn_deadline_ms: u64,
    pub max_step_retries: u32,
    pub retry_backoff_ms: u64,
    /// 对话窗口保留轮数
    pub max_context_turns: usize,
    pub max_facts: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        let brain = BrainConfig::default();
        Self {
            max_replans: brain.max_replans,
            step_timeout_ms: brain.step_timeout_ms,
            max_concurrent_steps: brain.max_concurrent_steps,
            turn_deadline_ms: brain.turn_deadline_ms,
            max_step_retries: brain.max_step_retries,
            retry_backoff_ms: brain.retry_backoff_ms,
            max_context_turns: brain.max_context_turns,
            max_facts: brain.max_facts,
        }
    }
}

/// [memory] 段：后端与短期记录过期
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// memory / sqlite
    pub backend: String,
    pub sqlite_path: PathBuf,
    pub short_term_ttl_secs: Option<u64>,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            sqlite_path: PathBuf::from("data/jarvis.db"),
            short_term_ttl_secs: None,
        }
    }
}

/// [retrieval] 段：检索与分块
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalSection {
    pub top_k: usize,
    pub min_relevance: f32,
    /// 相关度中向量相似度的权重（其余为关键词）
    pub vector_weight: f32,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// 本地哈希嵌入的维度
    pub embedding_dims: usize,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            top_k: 4,
            min_relevance: 0.15,
            vector_weight: 0.7,
            chunk_size: 500,
            chunk_overlap: 50,
            embedding_dims: 256,
        }
    }
}

/// [verifier] 段：依据校验后端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerifierSection {
    /// rules / model；model 需要真实模型，失败时退回 rules
    pub backend: String,
    pub min_coverage: f32,
    pub model_threshold: f32,
}

impl Default for VerifierSection {
    fn default() -> Self {
        Self {
            backend: "rules".to_string(),
            min_coverage: 0.25,
            model_threshold: 0.6,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ToolsSection {
    pub weather: WeatherSection,
    pub fetch: FetchSection,
    pub open_website: OpenWebsiteSection,
    pub open_application: OpenApplicationSection,
}

/// [tools.weather] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeatherSection {
    pub base_url: String,
    pub default_location: String,
    pub timeout_secs: u64,
}

impl Default for WeatherSection {
    fn default() -> Self {
        Self {
            base_url: "https://wttr.in".to_string(),
            default_location: "London".to_string(),
            timeout_secs: 10,
        }
    }
}

/// [tools.fetch] 段：抓取网页的超时、最大字符数、域名白名单
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSection {
    pub timeout_secs: u64,
    pub max_result_chars: usize,
    pub allowed_domains: Vec<String>,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            max_result_chars: 8000,
            allowed_domains: default_allowed_domains(),
        }
    }
}

fn default_allowed_domains() -> Vec<String> {
    vec![
        "en.wikipedia.org".into(),
        "zh.wikipedia.org".into(),
        "baike.baidu.com".into(),
        "github.com".into(),
        "docs.rs".into(),
        "doc.rust-lang.org".into(),
        "developer.mozilla.org".into(),
        "stackoverflow.com".into(),
        "arxiv.org".into(),
        "news.ycombinator.com".into(),
        "www.bbc.com".into(),
        "www.reuters.com".into(),
    ]
}

/// [tools.open_website] 段：无图形环境时关闭
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenWebsiteSection {
    pub enabled: bool,
}

impl Default for OpenWebsiteSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// [tools.open_application] 段：应用名 -> 可执行文件路径；未配置时使用当前平台的常见路径
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenApplicationSection {
    pub enabled: bool,
    pub apps: BTreeMap<String, PathBuf>,
}

impl Default for OpenApplicationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            apps: default_app_paths(),
        }
    }
}

impl AppConfig {
    /// 编排参数
    pub fn brain_config(&self) -> BrainConfig {
        let o = &self.orchestrator;
        BrainConfig {
            max_replans: o.max_replans,
            step_timeout_ms: o.step_timeout_ms,
            max_concurrent_steps: o.max_concurrent_steps.max(1),
            retrieval_top_k: self.retrieval.top_k,
            turn_deadline_ms: o.turn_deadline_ms,
            max_step_retries: o.max_step_retries,
            retry_backoff_ms: o.retry_backoff_ms,
            max_context_turns: o.max_context_turns,
            max_facts: o.max_facts,
            short_term_ttl_secs: self.memory.short_term_ttl_secs,
        }
    }
}

/// 从 config 目录加载配置，环境变量 JARVIS__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 JARVIS__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("JARVIS")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
