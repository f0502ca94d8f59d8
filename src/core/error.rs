//! 错误分类
//!
//! 工具级错误写入 Trace；规划失败与编排失败才会返回给用户（user_message）。
//! 校验拒绝不是错误，走有界重规划。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plan::StepId;

/// Planner 失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanningFailure {
    /// 未知工具、参数不符合 Schema、结构非法、输出无法解析
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// 重规划重复了已失败的动作
    #[error("replan made no progress: {0}")]
    NoProgress(String),

    #[error("language model unavailable: {0}")]
    ModelUnavailable(String),
}

/// 单次工具调用错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("tool {tool} schema violation: {detail}")]
    SchemaViolation { tool: String, detail: String },

    #[error("tool {tool} failed: {detail}")]
    ExecutionError { tool: String, detail: String },

    #[error("tool {tool} timed out after {after_ms}ms")]
    Timeout { tool: String, after_ms: u64 },

    /// 工具实现 panic；不重试
    #[error("tool {tool} panicked: {detail}")]
    Panicked { tool: String, detail: String },

    #[error("tool not registered: {0}")]
    Unregistered(String),
}

impl ToolError {
    /// 是否值得重试（Schema 错误重试也不会变）；副作用等级另行判断
    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolError::ExecutionError { .. } | ToolError::Timeout { .. })
    }
}

/// 校验拒绝的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectKind {
    /// 必需步骤未成功
    UnmetStep,
    /// 回复包含执行结果与检索片段都不支持的内容
    UngroundedResponse,
    /// 声明为 pure 的工具报告了状态变化
    SideEffectMismatch,
}

/// 执行前即可发现的不变量破坏（计划引用了未注册的工具）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("step {step_id} references unregistered tool {tool}")]
    UnregisteredTool { step_id: StepId, tool: String },

    #[error("step {0} is a tool call without a tool name")]
    MissingToolName(StepId),
}

/// 一轮编排的终止失败
#[derive(Error, Debug)]
pub enum OrchestratorFailure {
    #[error("replan limit exceeded after {replans} replans: {reason}")]
    ReplanLimitExceeded { replans: u32, reason: String },

    #[error("turn deadline of {budget_ms}ms exceeded")]
    TurnTimeout { budget_ms: u64 },

    #[error(transparent)]
    Planning(#[from] PlanningFailure),

    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error("turn cancelled")]
    Cancelled,
}

impl OrchestratorFailure {
    /// 面向用户的说明
    pub fn user_message(&self) -> String {
        match self {
            OrchestratorFailure::ReplanLimitExceeded { reason, .. } => {
                format!("Sorry, I couldn't complete that request. {reason}")
            }
            OrchestratorFailure::TurnTimeout { .. } => {
                "Sorry, that took too long and I had to stop.".to_string()
            }
            OrchestratorFailure::Planning(PlanningFailure::InvalidPlan(detail)) => {
                format!("Sorry, I couldn't work out how to do that ({detail}).")
            }
            OrchestratorFailure::Planning(PlanningFailure::NoProgress(_)) => {
                "Sorry, I couldn't find another way to do that.".to_string()
            }
            OrchestratorFailure::Planning(PlanningFailure::ModelUnavailable(_)) => {
                "Sorry, my language model is unavailable right now.".to_string()
            }
            OrchestratorFailure::Invariant(_) => {
                "Sorry, something went wrong internally.".to_string()
            }
            OrchestratorFailure::Cancelled => "Request cancelled.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_retryable() {
        assert!(ToolError::Timeout {
            tool: "weather".into(),
            after_ms: 10
        }
        .is_retryable());
        assert!(!ToolError::SchemaViolation {
            tool: "weather".into(),
            detail: "x".into()
        }
        .is_retryable());
        assert!(!ToolError::Unregistered("x".into()).is_retryable());
    }

    #[test]
    fn test_planning_failure_converts() {
        let failure: OrchestratorFailure = PlanningFailure::InvalidPlan("unknown tool fly_to_moon".into()).into();
        assert!(matches!(failure, OrchestratorFailure::Planning(_)));
        assert!(failure.user_message().contains("fly_to_moon"));
    }
}
