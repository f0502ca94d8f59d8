//! 计划数据模型：Goal、Step、Plan
//!
//! Goal 每轮创建一次且不可变；Plan 由 Planner 产出，开始执行后不再修改（重规划会生成新的 Plan）。

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::knowledge::Passage;
use crate::plan::graph::{topological_order, PlanError};

pub type StepId = String;

/// 会话上下文引用：所属会话 + 第几轮
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRef {
    pub session_id: String,
    pub turn: u64,
}

/// 一轮用户请求（创建后只读）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    id: Uuid,
    utterance: String,
    created_at: DateTime<Utc>,
    context: ContextRef,
}

impl Goal {
    pub fn new(utterance: impl Into<String>, context: ContextRef) -> Self {
        Self {
            id: Uuid::new_v4(),
            utterance: utterance.into(),
            created_at: Utc::now(),
            context,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn utterance(&self) -> &str {
        &self.utterance
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn context(&self) -> &ContextRef {
        &self.context
    }
}

/// 步骤类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// 调用注册表中的工具
    ToolCall,
    /// 检索知识库（args.query）
    Retrieve,
    /// 汇总前序结果生成回复（无工具）
    Respond,
}

fn empty_args() -> serde_json::Value {
    serde_json::json!({})
}

fn default_required() -> bool {
    true
}

/// 计划中的单个步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    /// 计划内唯一的步骤 ID，如 s1
    pub id: StepId,
    pub kind: StepKind,
    /// kind = tool_call 时必填
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// 工具参数（需符合工具 input schema）；retrieve 步骤为 {"query": "..."}
    #[serde(default = "empty_args")]
    pub args: serde_json::Value,
    /// 依赖的步骤 ID，全部成功后才会执行
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    /// 目标达成是否要求该步骤成功
    #[serde(default = "default_required")]
    pub required: bool,
}

impl Step {
    pub fn tool_call(id: impl Into<StepId>, tool: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            kind: StepKind::ToolCall,
            tool: Some(tool.into()),
            args,
            depends_on: Vec::new(),
            required: true,
        }
    }

    pub fn retrieve(id: impl Into<StepId>, query: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: StepKind::Retrieve,
            tool: None,
            args: serde_json::json!({ "query": query.into() }),
            depends_on: Vec::new(),
            required: true,
        }
    }

    pub fn respond(id: impl Into<StepId>) -> Self {
        Self {
            id: id.into(),
            kind: StepKind::Respond,
            tool: None,
            args: empty_args(),
            depends_on: Vec::new(),
            required: true,
        }
    }

    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// 展示用标签：工具名 / retrieve / respond
    pub fn label(&self) -> &str {
        match self.kind {
            StepKind::ToolCall => self.tool.as_deref().unwrap_or("tool_call"),
            StepKind::Retrieve => "retrieve",
            StepKind::Respond => "respond",
        }
    }

    /// 是否为同一个动作（类型、工具、参数都相同；不比较 ID 与依赖）
    pub fn same_action(&self, other: &Step) -> bool {
        self.kind == other.kind && self.tool == other.tool && self.args == other.args
    }
}

/// 计划：步骤构成的 DAG，附带规划理由与修订号（0 为首次规划）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    goal_id: Uuid,
    revision: u32,
    rationale: String,
    steps: Vec<Step>,
    /// 规划时使用的检索片段（同时作为回复的依据）
    #[serde(default)]
    grounding: Vec<Passage>,
}

impl Plan {
    /// 结构校验后构造：ID 唯一、依赖存在、无环、至多一个 respond 步骤
    pub fn new(
        goal_id: Uuid,
        revision: u32,
        rationale: impl Into<String>,
        steps: Vec<Step>,
    ) -> Result<Self, PlanError> {
        if steps.is_empty() {
            return Err(PlanError::Empty);
        }
        let responds = steps.iter().filter(|s| s.kind == StepKind::Respond).count();
        if responds > 1 {
            return Err(PlanError::MultipleRespond(responds));
        }
        topological_order(&steps)?;
        Ok(Self {
            goal_id,
            revision,
            rationale: rationale.into(),
            steps,
            grounding: Vec::new(),
        })
    }

    pub fn with_grounding(mut self, passages: Vec<Passage>) -> Self {
        self.grounding = passages;
        self
    }

    pub fn goal_id(&self) -> Uuid {
        self.goal_id
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn rationale(&self) -> &str {
        &self.rationale
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn grounding(&self) -> &[Passage] {
        &self.grounding
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn respond_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.kind == StepKind::Respond)
    }

    /// 用到的工具名（去重，保持声明顺序）
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for name in self.steps.iter().filter_map(|s| s.tool.as_deref()) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// 两个计划的步骤是否完全一致（用于检测重规划无进展）
    pub fn same_steps_as(&self, other: &Plan) -> bool {
        self.steps.len() == other.steps.len()
            && self
                .steps
                .iter()
                .zip(other.steps.iter())
                .all(|(a, b)| a.same_action(b) && a.depends_on == b.depends_on)
    }
}
