//! Planner：目标 -> Plan
//!
//! 一次模型调用：system 中给出工具目录与 Plan JSON Schema，user 中给出目标、对话上下文、
//! 检索片段与重规划提示。输出解析后逐步校验（工具存在、参数符合 Schema、结构合法），
//! 缺少 respond 步骤时补一个依赖所有汇点的 respond。无副作用。

use std::collections::HashSet;
use std::sync::Arc;

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;

use crate::cognition::reasoning::ReasoningFrame;
use crate::cognition::verifier::ReplanHint;
use crate::core::PlanningFailure;
use crate::knowledge::Passage;
use crate::llm::LlmClient;
use crate::memory::{Message, MemorySnapshot};
use crate::plan::{Goal, Plan, PlanGraph, Step, StepKind};
use crate::tools::{catalog_json, ToolDescriptor, ToolRegistry};

/// 规划 system prompt 的开头（规则引擎据此识别规划请求）
pub const PLANNER_MARKER: &str = "You are the planning module of Jarvis";

const PLANNER_RULES: &str = "Decompose the user's goal into a small plan of steps.\n\
- Use only the tools listed under \"## Tools\"; arguments must match each tool's parameters schema.\n\
- Use a `retrieve` step with {\"query\": \"...\"} when background knowledge is needed.\n\
- End with exactly one `respond` step that depends on the steps whose results the answer needs.\n\
- Steps without dependencies between them run concurrently.\n\
Output only a JSON object matching \"## Plan format\", no other text.";

/// 模型输出的计划草稿
#[derive(Debug, Deserialize, JsonSchema)]
pub struct PlanDraft {
    /// 规划理由（一句话）
    #[serde(default)]
    pub rationale: String,
    pub steps: Vec<Step>,
}

/// 一次规划的输入
pub struct PlanRequest<'a> {
    pub goal: &'a Goal,
    pub context: &'a MemorySnapshot,
    pub knowledge: &'a [Passage],
    pub catalog: &'a [ToolDescriptor],
    pub hint: Option<&'a ReplanHint>,
    /// 被拒绝的上一版计划（重规划时）
    pub previous: Option<&'a Plan>,
}

/// 从模型输出中提取 JSON（```json 代码块或首个 { 到末个 }）
pub fn parse_plan_output(output: &str) -> Result<PlanDraft, PlanningFailure> {
    let trimmed = output.trim();
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end < start {
            return Err(PlanningFailure::InvalidPlan(
                "model output contains no JSON plan".to_string(),
            ));
        }
        &trimmed[start..=end]
    } else {
        return Err(PlanningFailure::InvalidPlan(
            "model output contains no JSON plan".to_string(),
        ));
    };
    serde_json::from_str(json_str)
        .map_err(|e| PlanningFailure::InvalidPlan(format!("malformed plan JSON: {}", e)))
}

/// Plan 输出格式的 JSON Schema（拼入 system prompt）
pub fn plan_schema_json() -> String {
    let schema = schema_for!(PlanDraft);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

pub struct Planner {
    llm: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    schema: String,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            llm,
            registry,
            schema: plan_schema_json(),
        }
    }

    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    pub async fn plan(&self, request: PlanRequest<'_>) -> Result<Plan, PlanningFailure> {
        let goal = request.goal;
        if goal.utterance().trim().is_empty() {
            return Err(PlanningFailure::InvalidPlan("goal is empty".to_string()));
        }
        if let Some(d) = request.catalog.iter().find(|d| !d.is_fully_specified()) {
            return Err(PlanningFailure::InvalidPlan(format!(
                "tool {} has an incomplete schema",
                d.name
            )));
        }

        let messages = self.build_messages(&request);
        let output = self
            .llm
            .complete(&messages)
            .await
            .map_err(|e| PlanningFailure::ModelUnavailable(e.to_string()))?;
        tracing::debug!(goal_id = %goal.id(), output = %output, "planner output");

        let draft = parse_plan_output(&output)?;
        let steps = self.validate_steps(draft.steps, request.catalog)?;
        check_progress(&steps, request.hint, request.previous)?;

        let revision = request.previous.map(|p| p.revision() + 1).unwrap_or(0);
        let rationale = match request.hint {
            Some(hint) => format!("[replan after {}: {}] {}", hint.step_id, hint.reason, draft.rationale),
            None => draft.rationale,
        };
        let plan = Plan::new(goal.id(), revision, rationale, steps)
            .map_err(|e| PlanningFailure::InvalidPlan(e.to_string()))?
            .with_grounding(request.knowledge.to_vec());
        if let Some(previous) = request.previous {
            if plan.same_steps_as(previous) {
                return Err(PlanningFailure::NoProgress(format!(
                    "plan is identical to rejected revision {}",
                    previous.revision()
                )));
            }
        }
        tracing::info!(
            goal_id = %goal.id(),
            revision,
            steps = plan.steps().len(),
            tools = ?plan.tool_names(),
            "plan ready"
        );
        Ok(plan)
    }

    fn build_messages(&self, request: &PlanRequest<'_>) -> Vec<Message> {
        let system = format!(
            "{PLANNER_MARKER}.\n{PLANNER_RULES}\n\n## Tools\n{}\n\n## Plan format\n{}",
            catalog_json(request.catalog),
            self.schema
        );

        let mut user = format!(
            "## Goal\n{}\n\n## Conversation\n{}\n## Knowledge\n",
            request.goal.utterance(),
            request.context.render()
        );
        if request.knowledge.is_empty() {
            user.push_str("(none)\n");
        } else {
            for passage in request.knowledge {
                user.push_str(&format!("- [{}] {}\n", passage.source, passage.text));
            }
        }
        if let Some(hint) = request.hint {
            user.push_str(&format!("\n## Replan hint\n{}\n", hint.render()));
        }
        if let Some(frame) = ReasoningFrame::for_goal(request.goal.utterance()) {
            tracing::debug!(kind = ?frame.kind, "reasoning mode");
            user.push_str(&format!(
                "\n## Reasoning steps\nWork through these steps before choosing the plan:\n{}\n",
                frame.render()
            ));
        }
        vec![Message::system(system), Message::user(user)]
    }

    fn validate_steps(
        &self,
        steps: Vec<Step>,
        catalog: &[ToolDescriptor],
    ) -> Result<Vec<Step>, PlanningFailure> {
        if steps.is_empty() {
            return Err(PlanningFailure::InvalidPlan("plan has no steps".to_string()));
        }
        let known: HashSet<&str> = catalog.iter().map(|d| d.name.as_str()).collect();
        let mut out = Vec::with_capacity(steps.len() + 1);

        for mut step in steps {
            if step.args.is_null() {
                step.args = serde_json::json!({});
            }
            match step.kind {
                StepKind::ToolCall => {
                    let tool = step.tool.as_deref().ok_or_else(|| {
                        PlanningFailure::InvalidPlan(format!("step {} has no tool", step.id))
                    })?;
                    if !known.contains(tool) {
                        return Err(PlanningFailure::InvalidPlan(format!(
                            "unknown tool {} in step {}",
                            tool, step.id
                        )));
                    }
                    self.registry
                        .validate_args(tool, &step.args)
                        .map_err(|e| PlanningFailure::InvalidPlan(format!("step {}: {}", step.id, e)))?;
                }
                StepKind::Retrieve => {
                    let query = step.args.get("query").and_then(|q| q.as_str()).unwrap_or("");
                    if query.trim().is_empty() || step.tool.is_some() {
                        return Err(PlanningFailure::InvalidPlan(format!(
                            "retrieve step {} needs a query and no tool",
                            step.id
                        )));
                    }
                }
                StepKind::Respond => {
                    if step.tool.is_some() {
                        return Err(PlanningFailure::InvalidPlan(format!(
                            "respond step {} must not name a tool",
                            step.id
                        )));
                    }
                }
            }
            out.push(step);
        }

        if !out.iter().any(|s| s.kind == StepKind::Respond) {
            let graph = PlanGraph::new(&out).map_err(|e| PlanningFailure::InvalidPlan(e.to_string()))?;
            // 可选步骤失败不应短路 respond
            let required: HashSet<&str> = out
                .iter()
                .filter(|s| s.required)
                .map(|s| s.id.as_str())
                .collect();
            let sinks = graph.sinks_among(|id| required.contains(id));
            let mut id = "respond".to_string();
            let mut n = 1;
            while out.iter().any(|s| s.id == id) {
                n += 1;
                id = format!("respond_{n}");
            }
            out.push(Step::respond(id).after(sinks));
        }
        Ok(out)
    }
}

/// 重规划不得重复已失败的非 respond 步骤
fn check_progress(
    steps: &[Step],
    hint: Option<&ReplanHint>,
    previous: Option<&Plan>,
) -> Result<(), PlanningFailure> {
    let (Some(hint), Some(_)) = (hint, previous) else {
        return Ok(());
    };
    if let Some(faulty) = hint.faulty_step.as_ref().filter(|s| s.kind != StepKind::Respond) {
        if steps.iter().any(|s| s.same_action(faulty)) {
            return Err(PlanningFailure::NoProgress(format!(
                "replan repeats failed step {} ({})",
                faulty.id,
                faulty.label()
            )));
        }
    }
    Ok(())
}
