//! 网页抓取工具：域名白名单、超时、结果大小限制
//!
//! 仅允许配置中的域名；GET 请求带超时与 User-Agent；响应超过 max_result_chars 时截断。
//! 对 HTML 响应使用 html2text 提取可读文本。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use reqwest::Client;
use serde_json::Value;

use crate::tools::{SideEffectClass, Tool, ToolDescriptor, ToolOutput};

pub struct FetchPageTool {
    descriptor: ToolDescriptor,
    client: Client,
    allowed_domains: HashSet<String>,
    max_result_chars: usize,
}

/// 简易去除 HTML 标签（html2text 失败时的回退）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("<!")
        || s.starts_with("<html")
        || s.starts_with("<HTML")
        || (s.contains('<') && (s.contains("</") || s.contains("<head") || s.contains("<title")))
}

/// 从 URL 中提取 host（小写，不含端口）
pub(crate) fn extract_domain(url: &str) -> Option<String> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split('/').next()?.split(':').next()?;
    if host.is_empty() {
        return None;
    }
    Some(host.to_lowercase())
}

impl FetchPageTool {
    pub fn new(allowed_domains: Vec<String>, timeout_secs: u64, max_result_chars: usize) -> Self {
        let descriptor = ToolDescriptor::new(
            "fetch_page",
            "Fetch a web page from an allow-listed domain and return its readable text. Args: {\"url\": \"https://...\"}",
            SideEffectClass::Idempotent,
        )
        .with_input_schema(serde_json::json!({
            "type": "object",
            "properties": {"url": {"type": "string", "pattern": "^https?://"}},
            "required": ["url"]
        }))
        .with_output_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "url": {"type": "string"},
                "text": {"type": "string"},
                "truncated": {"type": "boolean"}
            },
            "required": ["url", "text"]
        }));
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("Mozilla/5.0 (compatible; jarvis/0.1)")
            .build()
            .unwrap_or_default();
        Self {
            descriptor,
            client,
            allowed_domains: allowed_domains.into_iter().map(|s| s.to_lowercase()).collect(),
            max_result_chars,
        }
    }

    fn is_allowed(&self, url: &str) -> Result<(), String> {
        let domain = extract_domain(url).ok_or_else(|| "Invalid or missing URL".to_string())?;
        if self.allowed_domains.contains(&domain) {
            return Ok(());
        }
        Err(format!("Domain not in allowlist: {}", domain))
    }

    fn html_to_text(&self, html: &str) -> String {
        match from_read(html.as_bytes(), 120) {
            Ok(text) if !text.trim().is_empty() => text,
            _ => strip_html_tags(html),
        }
    }

    fn truncate(&self, body: String) -> (String, bool) {
        if body.chars().count() > self.max_result_chars {
            (body.chars().take(self.max_result_chars).collect(), true)
        } else {
            (body, false)
        }
    }
}

#[async_trait]
impl Tool for FetchPageTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, args: Value) -> Result<ToolOutput, String> {
        let url = args
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing url".to_string())?;
        self.is_allowed(url)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let body = resp.text().await.map_err(|e| format!("Read body: {}", e))?;
        let body = body.trim_start_matches('\u{FEFF}');
        let text = if looks_like_html(body) {
            self.html_to_text(body)
        } else {
            body.to_string()
        };
        let (text, truncated) = self.truncate(text);
        Ok(ToolOutput::new(serde_json::json!({
            "url": url,
            "text": text,
            "truncated": truncated,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("https://Docs.rs/tokio"), Some("docs.rs".to_string()));
        assert_eq!(extract_domain("http://localhost:8080/x"), Some("localhost".to_string()));
        assert_eq!(extract_domain("docs.rs"), None);
    }

    #[tokio::test]
    async fn test_rejects_domain_outside_allowlist() {
        let tool = FetchPageTool::new(vec!["docs.rs".to_string()], 5, 1000);
        let err = tool
            .invoke(serde_json::json!({"url": "https://example.com"}))
            .await
            .unwrap_err();
        assert!(err.contains("allowlist"));
    }

    #[test]
    fn test_strip_tags_fallback() {
        assert_eq!(strip_html_tags("<p>Hello <b>world</b></p>"), "Hello world");
    }

    #[test]
    fn test_truncate_marks_result() {
        let tool = FetchPageTool::new(vec![], 5, 3);
        assert_eq!(tool.truncate("abcdef".to_string()), ("abc".to_string(), true));
        assert_eq!(tool.truncate("ab".to_string()), ("ab".to_string(), false));
    }
}
