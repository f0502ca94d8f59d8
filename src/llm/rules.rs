//! 规则引擎后端（未配置 API Key 时使用，离线可用）
//!
//! 只处理规划请求：从 prompt 中读出工具目录、目标与重规划提示，按关键词/正则把目标拆成步骤，
//! 输出 Plan JSON。其它请求（回复合成、依据打分）返回错误，由调用方退回确定性实现。

use std::collections::HashSet;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use crate::cognition::PLANNER_MARKER;
use crate::llm::{LlmClient, LlmError};
use crate::memory::{remembered_fact, Message, Role};
use crate::tools::launcher::resolve_website;

const QUESTION_WORDS: &[&str] = &[
    "who", "what", "when", "where", "why", "how", "which", "explain", "describe", "tell me about",
    "什么", "为什么", "怎么", "如何", "哪", "谁", "介绍",
];

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("valid rule regex"))
}

fn clause_separator() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?i)\s*(?:,?\s*\band then\b|\bthen\b|\band\b|;|，|；|然后|并且)\s*")
}

fn arithmetic() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        r"\(?\s*-?\d+(?:\.\d+)?(?:\s*[-+*/%^]\s*\(?\s*-?\d+(?:\.\d+)?\s*\)?)+",
    )
}

fn url() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"https?://[^\s,;]+")
}

fn open_command() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?i)\b(?:open|launch|打开)\s*(?:the\s+)?(?:website\s+|site\s+|url\s+|app\s+|application\s+)?(\S+)")
}

fn weather_location() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?i)\b(?:in|for|at)\s+([A-Za-z][A-Za-z .'-]*)")
}

fn cjk_weather_location() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(\p{Han}{2,})的?天气")
}

/// 规划请求中解析出的内容
#[derive(Debug, Default)]
struct PlanningPrompt {
    tools: HashSet<String>,
    goal: String,
    avoid_tools: HashSet<String>,
    avoid_retrieve: bool,
}

impl PlanningPrompt {
    fn parse(system: &str, user: &str) -> Self {
        let tools = section(system, "## Tools", "## Plan format")
            .and_then(|json| serde_json::from_str::<Vec<Value>>(json).ok())
            .unwrap_or_default()
            .iter()
            .filter_map(|t| t.get("name").and_then(Value::as_str).map(str::to_string))
            .collect();
        let goal = section(user, "## Goal", "## Conversation")
            .unwrap_or(user)
            .trim()
            .to_string();
        let hint = section(user, "## Replan hint", "## Reasoning steps").unwrap_or("");
        let avoid_tools = hint
            .lines()
            .filter_map(|l| l.trim().strip_prefix("Avoid tool:"))
            .map(|t| t.trim().to_string())
            .collect();
        Self {
            tools,
            goal,
            avoid_tools,
            avoid_retrieve: hint.contains("Failed action: retrieve"),
        }
    }

    fn can_use(&self, tool: &str) -> bool {
        self.tools.contains(tool) && !self.avoid_tools.contains(tool)
    }
}

/// start 标题之后、end 标题之前的文本（end 不存在时取到末尾）
fn section<'a>(text: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = text.find(start)? + start.len();
    let rest = &text[from..];
    Some(rest.find(end).map(|i| &rest[..i]).unwrap_or(rest).trim())
}

fn is_question(clause: &str) -> bool {
    let lower = clause.trim().to_lowercase();
    lower.ends_with('?')
        || lower.ends_with('？')
        || lower.ends_with('吗')
        || QUESTION_WORDS.iter().any(|w| lower.starts_with(w))
}

/// 以 open / launch / 打开 开头的祈使句
fn is_command(clause: &str) -> bool {
    let lower = clause.trim_start().to_lowercase();
    ["open ", "launch ", "打开"].iter().any(|verb| lower.starts_with(verb))
}

/// 去掉地点后的时间词与客套词；较长的后缀先匹配，反复剥离直到没有变化
fn trim_location(raw: &str) -> String {
    const SUFFIXES: [&str; 5] = [" right now", " tomorrow", " today", " please", " now"];
    let mut location = raw.trim().trim_end_matches(['?', '.', '!', ',']).trim_end();
    while let Some(rest) = SUFFIXES.iter().find_map(|suffix| strip_suffix_ignore_case(location, suffix)) {
        location = rest.trim_end_matches(',').trim_end();
    }
    location.trim().to_string()
}

fn strip_suffix_ignore_case<'a>(text: &'a str, suffix: &str) -> Option<&'a str> {
    let cut = text.len().checked_sub(suffix.len())?;
    if text.is_char_boundary(cut) && text[cut..].eq_ignore_ascii_case(suffix) {
        Some(&text[..cut])
    } else {
        None
    }
}

/// 单个子句 -> 至多一个步骤 (kind, tool, args)
fn step_for_clause(clause: &str, prompt: &PlanningPrompt) -> Option<(&'static str, Option<&'static str>, Value)> {
    let lower = clause.to_lowercase();

    if let Some(target) = open_command().captures(clause).and_then(|c| c.get(1)) {
        let target = target.as_str().trim_end_matches(['.', '!', '?']);
        if prompt.can_use("open_website") && resolve_website(target).is_some() {
            return Some(("tool_call", Some("open_website"), json!({ "target": target })));
        }
        if prompt.can_use("open_application") && is_command(clause) && !target.trim().is_empty() {
            return Some(("tool_call", Some("open_application"), json!({ "app": target.trim() })));
        }
    }
    if let Some(found) = url().find(clause) {
        if prompt.can_use("fetch_page") {
            return Some(("tool_call", Some("fetch_page"), json!({ "url": found.as_str() })));
        }
    }
    if let Some(expr) = arithmetic().find(clause) {
        if prompt.can_use("calculator") {
            return Some(("tool_call", Some("calculator"), json!({ "expression": expr.as_str().trim() })));
        }
    }
    if lower.contains("weather") || lower.contains("temperature") || clause.contains("天气") {
        if prompt.can_use("weather") {
            let location = weather_location()
                .captures(clause)
                .or_else(|| cjk_weather_location().captures(clause))
                .and_then(|c| c.get(1))
                .map(|m| trim_location(m.as_str()))
                .filter(|l| !l.is_empty());
            let args = match location {
                Some(location) => json!({ "location": location }),
                None => json!({}),
            };
            return Some(("tool_call", Some("weather"), args));
        }
    }
    if let Some(fact) = remembered_fact(clause) {
        if prompt.can_use("echo") {
            return Some(("tool_call", Some("echo"), json!({ "text": format!("I'll remember that {fact}.") })));
        }
    }
    if is_question(clause) && !prompt.avoid_retrieve {
        return Some(("retrieve", None, json!({ "query": clause.trim() })));
    }
    None
}

/// 目标 -> Plan JSON
fn plan_for(prompt: &PlanningPrompt) -> Value {
    let mut steps = Vec::new();
    let mut seen: Vec<(Option<&str>, Value)> = Vec::new();
    let clauses: Vec<&str> = clause_separator()
        .split(&prompt.goal)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();

    for clause in clauses {
        let Some((kind, tool, args)) = step_for_clause(clause, prompt) else {
            continue;
        };
        if seen.iter().any(|(t, a)| *t == tool && *a == args) {
            continue;
        }
        seen.push((tool, args.clone()));
        let mut step = json!({
            "id": format!("s{}", steps.len() + 1),
            "kind": kind,
            "args": args,
        });
        if let Some(tool) = tool {
            step["tool"] = json!(tool);
        }
        steps.push(step);
    }

    let deps: Vec<Value> = steps.iter().map(|s| s["id"].clone()).collect();
    let rationale = if steps.is_empty() {
        "no tool needed; reply directly".to_string()
    } else {
        format!("{} independent step(s) matched by rules", steps.len())
    };
    steps.push(json!({ "id": "respond", "kind": "respond", "depends_on": deps }));
    json!({ "rationale": rationale, "steps": steps })
}

/// 离线规则后端
#[derive(Debug, Clone, Default)]
pub struct RuleBasedLlmClient;

impl RuleBasedLlmClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LlmClient for RuleBasedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let system = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .unwrap_or("");
        if !system.starts_with(PLANNER_MARKER) {
            return Err(LlmError::Request(
                "rule-based model only handles planning requests".to_string(),
            ));
        }
        let user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .ok_or(LlmError::EmptyResponse)?;
        let prompt = PlanningPrompt::parse(system, user);
        let plan = plan_for(&prompt);
        tracing::debug!(goal = %prompt.goal, plan = %plan, "rule-based plan");
        Ok(plan.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(goal: &str, hint: Option<&str>) -> Vec<Message> {
        let tools = json!([
            {"name": "calculator"}, {"name": "weather"}, {"name": "open_website"},
            {"name": "open_application"},
            {"name": "fetch_page"}, {"name": "echo"}
        ]);
        let mut user = format!("## Goal\n{goal}\n\n## Conversation\n(none)\n## Knowledge\n(none)\n");
        if let Some(hint) = hint {
            user.push_str(&format!("\n## Replan hint\n{hint}\n"));
        }
        vec![
            Message::system(format!("{PLANNER_MARKER}.\nrules\n\n## Tools\n{tools}\n\n## Plan format\n{{}}")),
            Message::user(user),
        ]
    }

    #[test]
    fn test_trim_location_suffixes() {
        assert_eq!(trim_location("Paris right now"), "Paris");
        assert_eq!(trim_location("Paris right now?"), "Paris");
        assert_eq!(trim_location("Tokyo today please"), "Tokyo");
        assert_eq!(trim_location("Berlin, now"), "Berlin");
        assert_eq!(trim_location("New York"), "New York");
        assert_eq!(trim_location("İstanbul TODAY"), "İstanbul");
    }

    async fn plan(goal: &str, hint: Option<&str>) -> Value {
        let out = RuleBasedLlmClient::new().complete(&prompt(goal, hint)).await.unwrap();
        serde_json::from_str(&out).unwrap()
    }

    #[tokio::test]
    async fn test_math_and_weather_are_independent_steps() {
        let plan = plan("what's 2+2 and then tell me the weather in Paris", None).await;
        let steps = plan["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0]["tool"], "calculator");
        assert_eq!(steps[0]["args"]["expression"], "2+2");
        assert_eq!(steps[1]["tool"], "weather");
        assert_eq!(steps[1]["args"]["location"], "Paris");
        assert_eq!(steps[2]["kind"], "respond");
        assert_eq!(steps[2]["depends_on"], json!(["s1", "s2"]));
    }

    #[tokio::test]
    async fn test_open_known_site() {
        let plan = plan("open github", None).await;
        assert_eq!(plan["steps"][0]["tool"], "open_website");
        assert_eq!(plan["steps"][0]["args"]["target"], "github");
    }

    #[tokio::test]
    async fn test_open_unknown_target_launches_application() {
        let plan = plan("launch the app Firefox", None).await;
        assert_eq!(plan["steps"][0]["tool"], "open_application");
        assert_eq!(plan["steps"][0]["args"]["app"], "Firefox");

        let plan = self::plan("is the bakery open today?", None).await;
        assert_eq!(plan["steps"][0]["kind"], "retrieve");
    }

    #[tokio::test]
    async fn test_question_becomes_retrieval() {
        let plan = plan("What is the capital of Australia?", None).await;
        assert_eq!(plan["steps"][0]["kind"], "retrieve");
        assert_eq!(plan["steps"][0]["args"]["query"], "What is the capital of Australia?");
    }

    #[tokio::test]
    async fn test_chit_chat_has_only_respond() {
        let plan = plan("thanks a lot", None).await;
        let steps = plan["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0]["kind"], "respond");
    }

    #[tokio::test]
    async fn test_avoids_tool_named_in_hint() {
        let plan = plan("what's the weather in Oslo", Some("Avoid tool: weather")).await;
        let steps = plan["steps"].as_array().unwrap();
        assert!(steps.iter().all(|s| s["tool"] != "weather"));
    }

    #[tokio::test]
    async fn test_chinese_weather_location() {
        let plan = plan("北京天气怎么样", None).await;
        assert_eq!(plan["steps"][0]["tool"], "weather");
        assert_eq!(plan["steps"][0]["args"]["location"], "北京");
    }

    #[tokio::test]
    async fn test_non_planning_prompt_is_error() {
        let messages = vec![Message::system("You are the grounding checker"), Message::user("x")];
        assert!(RuleBasedLlmClient::new().complete(&messages).await.is_err());
    }
}
