//! 推理模式：目标中出现 "think about"、"analyze" 等触发词时，按问题类型给出分步推理框架
//!
//! 框架写入规划与合成的 prompt，模型按步骤思考；回复中不复述这些步骤。

use serde::Serialize;

const TRIGGERS: &[&str] = &[
    "think about",
    "think through",
    "think carefully about",
    "reason about",
    "reason through",
    "reason carefully about",
    "analyze",
    "analyse",
    "consider",
    "evaluate",
    "break down",
    "plan how to",
    "explain step by step",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Explanatory,
    Hypothetical,
    ProblemSolving,
    Comparative,
    General,
}

impl QueryKind {
    fn classify(lower: &str) -> Self {
        let has = |words: &[&str]| words.iter().any(|w| contains_word(lower, w));
        if has(&["how", "why", "what is", "explain"]) {
            QueryKind::Explanatory
        } else if has(&["should", "would", "could", "might"]) {
            QueryKind::Hypothetical
        } else if has(&["help", "fix", "solve", "issue"]) {
            QueryKind::ProblemSolving
        } else if has(&["compare", "difference", "versus", "vs"]) {
            QueryKind::Comparative
        } else {
            QueryKind::General
        }
    }

    pub fn steps(self) -> &'static [&'static str] {
        match self {
            QueryKind::Explanatory => &[
                "Understand the core concept being asked about.",
                "Consider the relevant context and background information.",
                "Explain the concept clearly and concisely.",
                "Give examples that illustrate the explanation.",
            ],
            QueryKind::Hypothetical => &[
                "Describe the hypothetical scenario.",
                "Identify the key assumptions and variables.",
                "Analyze the possible outcomes.",
                "Reach a reasoned conclusion.",
            ],
            QueryKind::ProblemSolving => &[
                "Identify the core problem.",
                "Analyze potential causes.",
                "Consider possible solutions.",
                "Recommend the best approach.",
            ],
            QueryKind::Comparative => &[
                "Identify the entities being compared.",
                "Establish the comparison criteria.",
                "Assess each entity against the criteria.",
                "Give a balanced comparison.",
            ],
            QueryKind::General => &[
                "Understand the query.",
                "Analyze the relevant information.",
                "Synthesize the information.",
                "Give a clear response.",
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReasoningFrame {
    pub kind: QueryKind,
    pub steps: Vec<&'static str>,
}

impl ReasoningFrame {
    /// 目标不含触发词时返回 None
    pub fn for_goal(utterance: &str) -> Option<Self> {
        let lower = utterance.to_lowercase();
        if !TRIGGERS.iter().any(|t| contains_word(&lower, t)) {
            return None;
        }
        let kind = QueryKind::classify(&lower);
        Some(Self {
            kind,
            steps: kind.steps().to_vec(),
        })
    }

    /// 编号列表
    pub fn render(&self) -> String {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, step)| format!("{}. {}", i + 1, step))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// 按词边界匹配（"show" 不算 "how"）
fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(start, _)| {
        let end = start + needle.len();
        let before = haystack[..start].chars().next_back();
        let after = haystack[end..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_trigger_no_frame() {
        assert!(ReasoningFrame::for_goal("what's 2+2").is_none());
        assert!(ReasoningFrame::for_goal("show me the weather").is_none());
        // 词边界：reconsider 不触发
        assert!(ReasoningFrame::for_goal("I will reconsider later").is_none());
    }

    #[test]
    fn test_query_kind_selects_steps() {
        let frame = ReasoningFrame::for_goal("Analyze why my build is slow").unwrap();
        assert_eq!(frame.kind, QueryKind::Explanatory);
        let frame = ReasoningFrame::for_goal("think about whether we should move to Berlin").unwrap();
        assert_eq!(frame.kind, QueryKind::Hypothetical);
        let frame = ReasoningFrame::for_goal("evaluate Rust versus Go for this service").unwrap();
        assert_eq!(frame.kind, QueryKind::Comparative);
        let frame = ReasoningFrame::for_goal("break down this task for me").unwrap();
        assert_eq!(frame.kind, QueryKind::General);
        assert_eq!(frame.steps.len(), 4);
    }

    #[test]
    fn test_render_is_numbered() {
        let frame = ReasoningFrame::for_goal("consider the trade-offs").unwrap();
        let rendered = frame.render();
        assert!(rendered.starts_with("1. Understand the query."));
        assert!(rendered.contains("\n4. Give a clear response."));
    }
}
