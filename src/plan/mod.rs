//! 计划层：Goal / Plan / Step 数据模型、依赖图、执行轨迹

pub mod graph;
pub mod trace;
pub mod types;

pub use graph::{topological_order, PlanError, PlanGraph};
pub use trace::{StepResult, StepStatus, Trace};
pub use types::{ContextRef, Goal, Plan, Step, StepId, StepKind};
