//! 认知层：规划、执行、校验与回复合成
//!
//! Planner 产出 Plan -> Executor 产出 Trace -> Synthesizer 写回复 -> Verifier 给出 Verdict。

pub mod events;
pub mod executor;
pub mod grounding;
pub mod planner;
pub mod reasoning;
pub mod retry;
pub mod synthesizer;
pub mod verifier;

pub use events::BrainEvent;
pub use executor::{ExecutionBudget, Executor, ExecutorConfig};
pub use grounding::{Evidence, GroundingCheck, GroundingReport, ModelGrounding, RuleBasedGrounding};
pub use planner::{parse_plan_output, plan_schema_json, PlanDraft, PlanRequest, Planner, PLANNER_MARKER};
pub use reasoning::{QueryKind, ReasoningFrame};
pub use retry::RetryPolicy;
pub use synthesizer::{template_response, Synthesizer, SYNTHESIZER_MARKER};
pub use verifier::{ReplanHint, Verdict, Verifier};
