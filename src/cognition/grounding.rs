//! 回复依据校验
//!
//! 依据 = 目标文本 + 规划时检索的片段 + 成功步骤的输出（含键名）+ 工具名。
//! 规则实现：回复中的每个数字都必须出现在依据中；存在取证步骤时，回复内容词的覆盖率不低于 min_coverage。
//! 模型实现：请模型给出 SCORE，解析失败或调用失败时退回规则实现。

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::knowledge::Passage;
use crate::llm::LlmClient;
use crate::memory::tokenizer;
use crate::memory::Message;
use crate::plan::{Goal, Plan, StepKind, Trace};

/// 校验所用的全部依据
#[derive(Debug, Clone)]
pub struct Evidence {
    pub goal: String,
    pub passages: Vec<Passage>,
    /// (步骤标签, 输出)
    pub outputs: Vec<(String, Value)>,
    /// 计划是否包含取证步骤（tool_call / retrieve）
    pub has_evidence_steps: bool,
}

impl Evidence {
    pub fn collect(goal: &Goal, plan: &Plan, trace: &Trace) -> Self {
        let outputs = plan
            .steps()
            .iter()
            .filter(|s| s.kind != StepKind::Respond)
            .filter_map(|s| {
                trace
                    .get(&s.id)
                    .filter(|r| r.is_success())
                    .map(|r| (s.label().to_string(), r.output.clone()))
            })
            .collect();
        Self {
            goal: goal.utterance().to_string(),
            passages: plan.grounding().to_vec(),
            outputs,
            has_evidence_steps: plan.steps().iter().any(|s| s.kind != StepKind::Respond),
        }
    }

    /// 所有依据拼成的文本
    pub fn text(&self) -> String {
        let mut words = vec![self.goal.clone()];
        for passage in &self.passages {
            words.push(passage.source.clone());
            words.push(passage.text.clone());
        }
        for (label, output) in &self.outputs {
            words.push(label.clone());
            flatten_value(output, &mut words);
        }
        words.join(" ")
    }

    /// prompt 用的依据段落
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (label, output) in &self.outputs {
            out.push_str(&format!("- [{}] {}\n", label, describe_value(output)));
        }
        for passage in &self.passages {
            out.push_str(&format!("- [{}] {}\n", passage.source, passage.text));
        }
        if out.is_empty() {
            out.push_str("(none)\n");
        }
        out
    }
}

/// 展开 JSON：键名与标量值依次加入 out
pub fn flatten_value(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                out.push(k.clone());
                flatten_value(v, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten_value(item, out);
            }
        }
        Value::String(s) => out.push(s.clone()),
        Value::Null => {}
        other => out.push(other.to_string()),
    }
}

/// 单行可读描述，如 `result: 4, expression: 2+2`
pub fn describe_value(value: &Value) -> String {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{}: {}", k, describe_value(v)))
            .collect::<Vec<_>>()
            .join(", "),
        Value::Array(items) if items.is_empty() => "none".to_string(),
        Value::Array(items) => items.iter().map(describe_value).collect::<Vec<_>>().join("; "),
        Value::String(s) => s.clone(),
        Value::Null => "none".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroundingReport {
    pub grounded: bool,
    pub score: f32,
    /// 依据中找不到的数字或词
    pub unsupported: Vec<String>,
}

#[async_trait]
pub trait GroundingCheck: Send + Sync {
    async fn check(&self, response: &str, evidence: &Evidence) -> GroundingReport;
}

fn number_regex() -> &'static Regex {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    NUMBER.get_or_init(|| Regex::new(r"\d+(?:\.\d+)?").expect("valid number regex"))
}

/// 文本中的数字，经 f64 归一化（"21.0" 与 "21" 视为相同）
pub fn numbers_in(text: &str) -> Vec<String> {
    number_regex()
        .find_iter(text)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .map(|n| format!("{}", n))
        .collect()
}

/// 规则实现（确定性：相同输入得到相同结论）
#[derive(Debug, Clone)]
pub struct RuleBasedGrounding {
    pub min_coverage: f32,
}

impl Default for RuleBasedGrounding {
    fn default() -> Self {
        Self { min_coverage: 0.25 }
    }
}

impl RuleBasedGrounding {
    pub fn new(min_coverage: f32) -> Self {
        Self { min_coverage }
    }

    pub fn evaluate(&self, response: &str, evidence: &Evidence) -> GroundingReport {
        let evidence_text = evidence.text();
        let evidence_numbers: HashSet<String> = numbers_in(&evidence_text).into_iter().collect();
        let mut unsupported: Vec<String> = Vec::new();
        for n in numbers_in(response) {
            if !evidence_numbers.contains(&n) && !unsupported.contains(&n) {
                unsupported.push(n);
            }
        }
        let numbers_ok = unsupported.is_empty();

        let terms = tokenizer::content_terms(response);
        let score = if terms.is_empty() {
            1.0
        } else {
            let evidence_terms = tokenizer::content_terms(&evidence_text);
            let mut missing: Vec<&String> = terms.difference(&evidence_terms).collect();
            missing.sort();
            let covered = terms.len() - missing.len();
            if evidence.has_evidence_steps {
                unsupported.extend(missing.into_iter().cloned());
            }
            covered as f32 / terms.len() as f32
        };

        let lexical_ok = !evidence.has_evidence_steps || score >= self.min_coverage;
        GroundingReport {
            grounded: numbers_ok && lexical_ok,
            score,
            unsupported,
        }
    }
}

#[async_trait]
impl GroundingCheck for RuleBasedGrounding {
    async fn check(&self, response: &str, evidence: &Evidence) -> GroundingReport {
        self.evaluate(response, evidence)
    }
}

/// 模型打分的 system prompt 开头
pub const GROUNDING_MARKER: &str = "You are the grounding checker of Jarvis";

/// 模型辅助的一致性打分，失败时退回规则实现
pub struct ModelGrounding {
    llm: Arc<dyn LlmClient>,
    threshold: f32,
    fallback: RuleBasedGrounding,
}

impl ModelGrounding {
    pub fn new(llm: Arc<dyn LlmClient>, threshold: f32, fallback: RuleBasedGrounding) -> Self {
        Self {
            llm,
            threshold,
            fallback,
        }
    }
}

/// 解析 "SCORE: 0.8"
pub fn parse_score(output: &str) -> Option<f32> {
    let upper = output.to_uppercase();
    let idx = upper.find("SCORE")?;
    let rest = upper[idx + 5..].trim_start_matches(|c: char| c == ':' || c.is_whitespace());
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    rest[..end].parse::<f32>().ok().filter(|s| (0.0..=1.0).contains(s))
}

#[async_trait]
impl GroundingCheck for ModelGrounding {
    async fn check(&self, response: &str, evidence: &Evidence) -> GroundingReport {
        let messages = vec![
            Message::system(format!(
                "{GROUNDING_MARKER}. Rate how well the response is supported by the evidence, \
                 from 0 (unsupported) to 1 (fully supported). Reply with `SCORE: <number>` only."
            )),
            Message::user(format!(
                "## Goal\n{}\n\n## Evidence\n{}\n## Response\n{}",
                evidence.goal,
                evidence.render(),
                response
            )),
        ];
        match self.llm.complete(&messages).await {
            Ok(output) => match parse_score(&output) {
                Some(score) => GroundingReport {
                    grounded: score >= self.threshold,
                    score,
                    unsupported: Vec::new(),
                },
                None => {
                    tracing::warn!(output = %output, "unparseable grounding score, using rule-based check");
                    self.fallback.evaluate(response, evidence)
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "grounding model unavailable, using rule-based check");
                self.fallback.evaluate(response, evidence)
            }
        }
    }
}
