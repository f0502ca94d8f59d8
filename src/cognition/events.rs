//! 编排过程事件：阶段变化、计划、步骤结果、校验结论、重规划、最终回复

use serde::Serialize;

use crate::core::{BrainPhase, RejectKind};
use crate::plan::{StepId, StepStatus};

/// 可序列化为 JSON 供前端 / 语音层展示
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrainEvent {
    PhaseChanged {
        turn: u64,
        phase: BrainPhase,
    },
    /// 新计划（修订号 + 步骤标签）
    PlanReady {
        revision: u32,
        rationale: String,
        steps: Vec<String>,
    },
    StepFinished {
        step_id: StepId,
        status: StepStatus,
        attempts: u32,
        duration_ms: u64,
    },
    Accepted {
        revision: u32,
    },
    Rejected {
        revision: u32,
        kind: RejectKind,
        reason: String,
    },
    Replanning {
        replans: u32,
        max_replans: u32,
    },
    Response {
        text: String,
    },
    Failed {
        message: String,
    },
}
