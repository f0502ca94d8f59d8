//! Jarvis - Rust 个人助理编排内核
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: Brain 编排循环、轮次状态、会话、错误分类、构建器
//! - **cognition**: Planner、Executor、Verifier、回复合成与依据校验
//! - **plan**: Goal / Step / Plan / Trace 数据模型与依赖图
//! - **knowledge**: 文档分块、导入与混合检索
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / 规则引擎 / 脚本化）与嵌入
//! - **memory**: 短期 / 长期 / 向量记忆与持久化（内存 / SQLite）
//! - **tools**: 工具注册表与内置工具（calculator、echo、weather、fetch_page、open_website）
//! - **observability**: 日志初始化与每轮耗时统计

pub mod cognition;
pub mod config;
pub mod core;
pub mod knowledge;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod plan;
pub mod tools;

pub use crate::core::{Brain, BrainBuilder, BrainConfig, OrchestratorFailure, Session, TurnReply};
