//! 回复合成：把 respond 步骤依赖的结果写成自然语言
//!
//! 配置了模型时请模型基于依据作答；模型失败或返回空文本时使用确定性模板。

use std::sync::Arc;

use serde_json::Value;

use crate::cognition::grounding::{describe_value, Evidence};
use crate::cognition::reasoning::ReasoningFrame;
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::plan::{Goal, Plan, StepKind, Trace};

/// 合成 system prompt 的开头
pub const SYNTHESIZER_MARKER: &str = "You are the response module of Jarvis";

const SYNTHESIZER_RULES: &str = "Answer the user's goal using only the facts listed under \"## Evidence\". \
Do not invent numbers, names or events. Keep it short and conversational. \
If the evidence is empty or insufficient, say so plainly. \
When \"## Reasoning steps\" are given, follow them but do not mention them.";

const GREETINGS: &[&str] = &["hello", "hi", "hey", "你好", "嗨", "good morning", "good evening"];

#[derive(Default)]
pub struct Synthesizer {
    llm: Option<Arc<dyn LlmClient>>,
}

impl Synthesizer {
    /// 仅使用模板
    pub fn template() -> Self {
        Self { llm: None }
    }

    pub fn with_model(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm: Some(llm) }
    }

    pub async fn synthesize(&self, goal: &Goal, plan: &Plan, trace: &Trace) -> String {
        if let Some(llm) = &self.llm {
            let evidence = Evidence::collect(goal, plan, trace);
            let mut user = format!("## Goal\n{}\n\n## Evidence\n{}", goal.utterance(), evidence.render());
            if let Some(frame) = ReasoningFrame::for_goal(goal.utterance()) {
                user.push_str(&format!("\n\n## Reasoning steps\n{}", frame.render()));
            }
            let messages = vec![
                Message::system(format!("{SYNTHESIZER_MARKER}. {SYNTHESIZER_RULES}")),
                Message::user(user),
            ];
            match llm.complete(&messages).await {
                Ok(text) if !text.trim().is_empty() => return text.trim().to_string(),
                Ok(_) => tracing::warn!(goal_id = %goal.id(), "empty synthesis, using template"),
                Err(e) => tracing::warn!(goal_id = %goal.id(), error = %e, "synthesis model failed, using template"),
            }
        }
        template_response(goal, plan, trace)
    }
}

/// 模板回复：respond 步骤的每个成功依赖一行
pub fn template_response(goal: &Goal, plan: &Plan, trace: &Trace) -> String {
    let deps: Vec<&str> = plan
        .respond_step()
        .map(|r| r.depends_on.iter().map(String::as_str).collect())
        .unwrap_or_default();

    let mut lines = Vec::new();
    for dep in deps {
        let (Some(step), Some(result)) = (plan.step(dep), trace.get(dep)) else {
            continue;
        };
        if !result.is_success() {
            continue;
        }
        match step.kind {
            StepKind::Retrieve => lines.extend(describe_passages(&result.output)),
            _ => lines.push(format!("{}: {}", step.label(), describe_value(&result.output))),
        }
    }

    if lines.is_empty() {
        let utterance = goal.utterance().trim();
        let lower = utterance.to_lowercase();
        if GREETINGS.iter().any(|g| lower.starts_with(g)) {
            return "Hello! How can I help you?".to_string();
        }
        return format!("I don't know how to help with \"{utterance}\" yet.");
    }
    lines.join("\n")
}

fn describe_passages(output: &Value) -> Vec<String> {
    let query = output.get("query").and_then(|q| q.as_str()).unwrap_or("");
    let passages = output
        .get("passages")
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default();
    if passages.is_empty() {
        return vec![format!("retrieve: no passages for {query}")];
    }
    passages
        .iter()
        .map(|p| {
            format!(
                "From {}: {}",
                p.get("source").and_then(|s| s.as_str()).unwrap_or("knowledge"),
                p.get("text").and_then(|t| t.as_str()).unwrap_or("")
            )
        })
        .collect()
}
