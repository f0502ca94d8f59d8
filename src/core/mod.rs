//! 核心编排层：错误分类、轮次状态、会话、Brain 主循环与构建器

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod state;

pub use builder::{BrainBuilder, BuildError};
pub use error::{InvariantViolation, OrchestratorFailure, PlanningFailure, RejectKind, ToolError};
pub use orchestrator::{Brain, BrainConfig, TurnReply};
pub use session::{short_term_prefix, Session};
pub use state::{BrainPhase, TurnState};
