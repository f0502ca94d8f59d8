//! 执行轨迹：StepResult 与只追加的 Trace
//!
//! Trace 按结果产生的顺序记录（非声明顺序），每个步骤至多一条；合成的回复文本由编排器在校验前附加一次。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::types::StepId;

/// 步骤终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failure,
    Timeout,
}

/// 单个步骤的执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    pub status: StepStatus,
    pub output: Value,
    pub error: Option<String>,
    /// 实际调用次数（短路的步骤为 0）
    pub attempts: u32,
    /// 工具报告本次调用改变了外部状态
    pub state_changed: bool,
    /// 因依赖失败而未执行
    pub short_circuited: bool,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn success(step_id: impl Into<StepId>, output: Value) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Success,
            output,
            error: None,
            attempts: 1,
            state_changed: false,
            short_circuited: false,
            duration_ms: 0,
        }
    }

    pub fn failure(step_id: impl Into<StepId>, error: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failure,
            output: Value::Null,
            error: Some(error.into()),
            attempts: 1,
            state_changed: false,
            short_circuited: false,
            duration_ms: 0,
        }
    }

    pub fn timeout(step_id: impl Into<StepId>, error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Timeout,
            ..Self::failure(step_id, error)
        }
    }

    /// 依赖 `dependency` 未成功，本步骤不调用工具直接失败
    pub fn short_circuit(step_id: impl Into<StepId>, dependency: &str) -> Self {
        Self {
            attempts: 0,
            short_circuited: true,
            ..Self::failure(step_id, format!("dependency {dependency} did not succeed"))
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_state_changed(mut self, changed: bool) -> Self {
        self.state_changed = changed;
        self
    }

    pub fn with_duration(mut self, elapsed: Duration) -> Self {
        self.duration_ms = elapsed.as_millis() as u64;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

/// 一个 Plan 的执行轨迹
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    plan_revision: u32,
    results: Vec<StepResult>,
    response: Option<String>,
    deadline_exceeded: bool,
}

impl Trace {
    pub fn new(plan_revision: u32) -> Self {
        Self {
            plan_revision,
            results: Vec::new(),
            response: None,
            deadline_exceeded: false,
        }
    }

    pub fn plan_revision(&self) -> u32 {
        self.plan_revision
    }

    /// 追加结果；同一步骤重复记录时忽略并返回 false
    pub fn record(&mut self, result: StepResult) -> bool {
        if self.get(&result.step_id).is_some() {
            tracing::warn!(step_id = %result.step_id, "duplicate step result ignored");
            return false;
        }
        self.results.push(result);
        true
    }

    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    pub fn get(&self, step_id: &str) -> Option<&StepResult> {
        self.results.iter().find(|r| r.step_id == step_id)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// 附加合成回复（只允许一次）
    pub fn attach_response(&mut self, text: impl Into<String>) -> bool {
        if self.response.is_some() {
            return false;
        }
        self.response = Some(text.into());
        true
    }

    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    pub fn mark_deadline_exceeded(&mut self) {
        self.deadline_exceeded = true;
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.deadline_exceeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_ignores_duplicate_results() {
        let mut trace = Trace::new(0);
        assert!(trace.record(StepResult::success("s1", Value::from(4))));
        assert!(!trace.record(StepResult::failure("s1", "late")));
        assert_eq!(trace.len(), 1);
        assert!(trace.get("s1").unwrap().is_success());
    }

    #[test]
    fn test_response_attaches_once() {
        let mut trace = Trace::new(1);
        assert!(trace.attach_response("first"));
        assert!(!trace.attach_response("second"));
        assert_eq!(trace.response(), Some("first"));
    }

    #[test]
    fn test_short_circuit_has_no_attempts() {
        let result = StepResult::short_circuit("b", "a");
        assert_eq!(result.status, StepStatus::Failure);
        assert_eq!(result.attempts, 0);
        assert!(result.short_circuited);
        assert!(result.error.unwrap().contains("a"));
    }
}
