//! Verifier：对执行结果给出 Accept / Reject
//!
//! 依次检查：必需步骤全部成功 -> pure 工具未报告状态变化 -> 回复有依据。
//! Reject 携带重规划提示，指向计划顺序中第一个出问题的步骤（根因优先于被短路的步骤）。

use std::sync::Arc;

use serde::Serialize;

use crate::cognition::grounding::{Evidence, GroundingCheck};
use crate::core::RejectKind;
use crate::plan::{Goal, Plan, Step, StepId, StepKind, StepResult, Trace};
use crate::tools::{SideEffectClass, ToolRegistry};

/// 交给 Planner 的重规划提示
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplanHint {
    pub kind: RejectKind,
    pub step_id: StepId,
    pub reason: String,
    /// 出问题的步骤副本
    pub faulty_step: Option<Step>,
}

impl ReplanHint {
    /// prompt 中的提示文本
    pub fn render(&self) -> String {
        let mut out = format!(
            "Previous plan was rejected ({:?}) at step {}: {}\n",
            self.kind, self.step_id, self.reason
        );
        if let Some(step) = &self.faulty_step {
            match step.kind {
                StepKind::ToolCall => {
                    out.push_str(&format!(
                        "Failed action: {} with args {}\nAvoid tool: {}\n",
                        step.label(),
                        step.args,
                        step.label()
                    ));
                }
                StepKind::Retrieve => {
                    out.push_str(&format!("Failed action: retrieve with args {}\n", step.args));
                }
                StepKind::Respond => {
                    out.push_str("The response must only state what the evidence supports.\n");
                }
            }
        }
        out.push_str("Produce a different plan; do not repeat the failed action.");
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    Reject {
        kind: RejectKind,
        reason: String,
        hint: Option<ReplanHint>,
    },
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }

    fn reject(kind: RejectKind, step: &Step, reason: String) -> Self {
        Verdict::Reject {
            kind,
            reason: reason.clone(),
            hint: Some(ReplanHint {
                kind,
                step_id: step.id.clone(),
                reason,
                faulty_step: Some(step.clone()),
            }),
        }
    }
}

pub struct Verifier {
    registry: Arc<ToolRegistry>,
    grounding: Arc<dyn GroundingCheck>,
}

impl Verifier {
    pub fn new(registry: Arc<ToolRegistry>, grounding: Arc<dyn GroundingCheck>) -> Self {
        Self { registry, grounding }
    }

    pub async fn verify(&self, goal: &Goal, plan: &Plan, trace: &Trace) -> Verdict {
        if let Some(verdict) = self.check_required(plan, trace) {
            return verdict;
        }
        if let Some(verdict) = self.check_side_effects(plan, trace) {
            return verdict;
        }
        self.check_grounding(goal, plan, trace).await
    }

    fn check_required(&self, plan: &Plan, trace: &Trace) -> Option<Verdict> {
        // (优先级, 步骤, 原因)：0 = 自身失败，1 = 无结果，2 = 被短路
        let mut first: Option<(u8, &Step, String)> = None;
        for step in plan.steps().iter().filter(|s| s.required) {
            let offence = match trace.get(&step.id) {
                Some(r) if r.is_success() => continue,
                Some(r) if r.short_circuited => (2, describe_failure(step, r)),
                Some(r) => (0, describe_failure(step, r)),
                None => (1, format!("step {} ({}) has no result", step.id, step.label())),
            };
            if first.as_ref().map(|(p, _, _)| offence.0 < *p).unwrap_or(true) {
                first = Some((offence.0, step, offence.1));
            }
        }
        first.map(|(_, step, reason)| Verdict::reject(RejectKind::UnmetStep, step, reason))
    }

    fn check_side_effects(&self, plan: &Plan, trace: &Trace) -> Option<Verdict> {
        for step in plan.steps() {
            let Some(tool) = step.tool.as_deref() else {
                continue;
            };
            let declared_pure = self
                .registry
                .descriptor(tool)
                .map(|d| d.side_effect == SideEffectClass::Pure)
                .unwrap_or(false);
            if declared_pure && trace.get(&step.id).map(|r| r.state_changed).unwrap_or(false) {
                return Some(Verdict::reject(
                    RejectKind::SideEffectMismatch,
                    step,
                    format!("pure tool {} reported a state change in step {}", tool, step.id),
                ));
            }
        }
        None
    }

    async fn check_grounding(&self, goal: &Goal, plan: &Plan, trace: &Trace) -> Verdict {
        let Some(respond) = plan.respond_step() else {
            return Verdict::Accept;
        };
        let Some(response) = trace.response() else {
            return Verdict::reject(
                RejectKind::UngroundedResponse,
                respond,
                "no response was synthesized".to_string(),
            );
        };
        let evidence = Evidence::collect(goal, plan, trace);
        let report = self.grounding.check(response, &evidence).await;
        if report.grounded {
            return Verdict::Accept;
        }
        Verdict::reject(
            RejectKind::UngroundedResponse,
            respond,
            format!(
                "response is not supported by the evidence (score {:.2}, unsupported: {})",
                report.score,
                report.unsupported.join(", ")
            ),
        )
    }
}

fn describe_failure(step: &Step, result: &StepResult) -> String {
    format!(
        "step {} ({}) ended with {:?}: {}",
        step.id,
        step.label(),
        result.status,
        result.error.as_deref().unwrap_or("no detail")
    )
}
