//! 系统动作：打开网站（默认浏览器）与打开本地应用（配置的应用路径表）
//!
//! 两者都是非幂等动作，不自动重试。常用站点名（google、github ...）映射到域名，缺少协议时补 https://；
//! 应用名按小写查表，路径不存在时拒绝启动。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::tools::{SideEffectClass, Tool, ToolDescriptor, ToolOutput};

/// 常用站点名 -> 域名
const WEBSITES: &[(&str, &str)] = &[
    ("google", "google.com"),
    ("youtube", "youtube.com"),
    ("facebook", "facebook.com"),
    ("twitter", "twitter.com"),
    ("instagram", "instagram.com"),
    ("linkedin", "linkedin.com"),
    ("github", "github.com"),
    ("reddit", "reddit.com"),
    ("amazon", "amazon.com"),
    ("netflix", "netflix.com"),
    ("spotify", "spotify.com"),
    ("gmail", "gmail.com"),
    ("outlook", "outlook.com"),
    ("yahoo", "yahoo.com"),
    ("bing", "bing.com"),
    ("duckduckgo", "duckduckgo.com"),
    ("wikipedia", "wikipedia.org"),
    ("stackoverflow", "stackoverflow.com"),
    ("medium", "medium.com"),
    ("quora", "quora.com"),
];

/// 站点名或 URL -> 完整 URL；无法识别时返回 None
pub fn resolve_website(target: &str) -> Option<String> {
    let target = target.trim().trim_end_matches(['.', '!', '?']);
    if target.is_empty() || target.contains(char::is_whitespace) {
        return None;
    }
    if target.starts_with("http://") || target.starts_with("https://") {
        return Some(target.to_string());
    }
    let lower = target.to_lowercase();
    if let Some((_, domain)) = WEBSITES.iter().find(|(name, _)| *name == lower) {
        return Some(format!("https://{domain}"));
    }
    if lower.contains('.') {
        return Some(format!("https://{lower}"));
    }
    None
}

pub struct OpenWebsiteTool {
    descriptor: ToolDescriptor,
    enabled: bool,
}

impl OpenWebsiteTool {
    /// enabled = false 时拒绝执行（无图形环境的服务端部署）
    pub fn new(enabled: bool) -> Self {
        let descriptor = ToolDescriptor::new(
            "open_website",
            "Open a website in the default browser. Args: {\"target\": \"github\" | \"example.com\" | \"https://...\"}",
            SideEffectClass::NonIdempotent,
        )
        .with_input_schema(serde_json::json!({
            "type": "object",
            "properties": {"target": {"type": "string", "minLength": 1}},
            "required": ["target"]
        }))
        .with_output_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "url": {"type": "string"},
                "opened": {"type": "boolean"}
            },
            "required": ["url", "opened"]
        }));
        Self { descriptor, enabled }
    }
}

fn opener_command(url: &str) -> Command {
    if cfg!(target_os = "macos") {
        let mut cmd = Command::new("open");
        cmd.arg(url);
        cmd
    } else if cfg!(target_os = "windows") {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", "start", "", url]);
        cmd
    } else {
        let mut cmd = Command::new("xdg-open");
        cmd.arg(url);
        cmd
    }
}

#[async_trait]
impl Tool for OpenWebsiteTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, args: Value) -> Result<ToolOutput, String> {
        let target = args
            .get("target")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing target".to_string())?;
        let url = resolve_website(target).ok_or_else(|| format!("Unknown website: {target}"))?;
        if !self.enabled {
            return Err("system actions are disabled by configuration".to_string());
        }
        tracing::info!(url = %url, "opening website");
        let status = opener_command(&url)
            .status()
            .await
            .map_err(|e| format!("Failed to launch browser: {}", e))?;
        if !status.success() {
            return Err(format!("Browser launcher exited with {}", status));
        }
        Ok(ToolOutput::changed(serde_json::json!({ "url": url, "opened": true })))
    }
}

/// 当前平台的常见应用路径
pub fn default_app_paths() -> BTreeMap<String, PathBuf> {
    let table: &[(&str, &str)] = if cfg!(target_os = "windows") {
        &[
            ("chrome", r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
            ("firefox", r"C:\Program Files\Mozilla Firefox\firefox.exe"),
            ("edge", r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe"),
            ("notepad", r"C:\Windows\System32\notepad.exe"),
            ("calculator", r"C:\Windows\System32\calc.exe"),
            ("explorer", r"C:\Windows\explorer.exe"),
        ]
    } else if cfg!(target_os = "macos") {
        &[
            ("chrome", "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            ("firefox", "/Applications/Firefox.app/Contents/MacOS/firefox"),
            ("safari", "/Applications/Safari.app/Contents/MacOS/Safari"),
            ("calculator", "/Applications/Calculator.app/Contents/MacOS/Calculator"),
            ("finder", "/System/Library/CoreServices/Finder.app/Contents/MacOS/Finder"),
        ]
    } else {
        &[
            ("chrome", "/usr/bin/google-chrome"),
            ("firefox", "/usr/bin/firefox"),
            ("calculator", "/usr/bin/gnome-calculator"),
            ("file_manager", "/usr/bin/nautilus"),
        ]
    };
    table
        .iter()
        .map(|(name, path)| (name.to_string(), PathBuf::from(path)))
        .collect()
}

pub struct OpenApplicationTool {
    descriptor: ToolDescriptor,
    apps: BTreeMap<String, PathBuf>,
    enabled: bool,
}

impl OpenApplicationTool {
    /// apps：应用名 -> 可执行文件路径（名称不区分大小写）
    pub fn new(apps: BTreeMap<String, PathBuf>, enabled: bool) -> Self {
        let apps: BTreeMap<String, PathBuf> = apps
            .into_iter()
            .map(|(name, path)| (name.trim().to_lowercase(), path))
            .collect();
        let known = apps.keys().cloned().collect::<Vec<_>>().join(", ");
        let descriptor = ToolDescriptor::new(
            "open_application",
            format!("Launch a configured desktop application. Known apps: {known}. Args: {{\"app\": \"firefox\"}}"),
            SideEffectClass::NonIdempotent,
        )
        .with_input_schema(serde_json::json!({
            "type": "object",
            "properties": {"app": {"type": "string", "minLength": 1}},
            "required": ["app"]
        }))
        .with_output_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "app": {"type": "string"},
                "path": {"type": "string"},
                "opened": {"type": "boolean"}
            },
            "required": ["app", "opened"]
        }));
        Self {
            descriptor,
            apps,
            enabled,
        }
    }

    fn resolve(&self, app: &str) -> Result<&Path, String> {
        let path = self
            .apps
            .get(&app.trim().to_lowercase())
            .ok_or_else(|| format!("Application {app} not found in configuration"))?;
        if !path.exists() {
            return Err(format!("Application path does not exist: {}", path.display()));
        }
        Ok(path)
    }
}

#[async_trait]
impl Tool for OpenApplicationTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, args: Value) -> Result<ToolOutput, String> {
        let app = args
            .get("app")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing app".to_string())?;
        let path = self.resolve(app)?;
        if !self.enabled {
            return Err("system actions are disabled by configuration".to_string());
        }
        tracing::info!(app, path = %path.display(), "opening application");
        // 不等待应用退出
        Command::new(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("Failed to launch {app}: {e}"))?;
        Ok(ToolOutput::changed(serde_json::json!({
            "app": app.trim().to_lowercase(),
            "path": path.display().to_string(),
            "opened": true,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_website() {
        assert_eq!(resolve_website("GitHub"), Some("https://github.com".to_string()));
        assert_eq!(resolve_website("example.com"), Some("https://example.com".to_string()));
        assert_eq!(
            resolve_website("http://localhost:3000"),
            Some("http://localhost:3000".to_string())
        );
        assert_eq!(resolve_website("my files"), None);
        assert_eq!(resolve_website("nothing"), None);
    }

    #[tokio::test]
    async fn test_disabled_launcher_refuses() {
        let tool = OpenWebsiteTool::new(false);
        let err = tool
            .invoke(serde_json::json!({"target": "github"}))
            .await
            .unwrap_err();
        assert!(err.contains("disabled"));
    }

    fn app_tool(enabled: bool) -> (tempfile::TempDir, OpenApplicationTool) {
        let dir = tempfile::tempdir().unwrap();
        let installed = dir.path().join("editor");
        std::fs::write(&installed, "").unwrap();
        let mut apps = BTreeMap::new();
        apps.insert("Editor".to_string(), installed);
        apps.insert("ghost".to_string(), dir.path().join("missing"));
        (dir, OpenApplicationTool::new(apps, enabled))
    }

    #[tokio::test]
    async fn test_unknown_application_rejected() {
        let (_dir, tool) = app_tool(true);
        let err = tool
            .invoke(serde_json::json!({"app": "photoshop"}))
            .await
            .unwrap_err();
        assert_eq!(err, "Application photoshop not found in configuration");
        assert!(tool.descriptor().description.contains("editor, ghost"));
        assert_eq!(tool.descriptor().side_effect, SideEffectClass::NonIdempotent);
    }

    #[tokio::test]
    async fn test_missing_application_path_rejected() {
        let (_dir, tool) = app_tool(true);
        let err = tool.invoke(serde_json::json!({"app": "ghost"})).await.unwrap_err();
        assert!(err.starts_with("Application path does not exist"), "{err}");
    }

    #[tokio::test]
    async fn test_disabled_application_launcher_refuses() {
        let (_dir, tool) = app_tool(false);
        let err = tool.invoke(serde_json::json!({"app": "EDITOR"})).await.unwrap_err();
        assert!(err.contains("disabled"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launches_configured_application() {
        let mut apps = BTreeMap::new();
        apps.insert("shell".to_string(), PathBuf::from("/bin/sh"));
        let tool = OpenApplicationTool::new(apps, true);
        let out = tool.invoke(serde_json::json!({"app": "shell"})).await.unwrap();
        assert!(out.state_changed);
        assert_eq!(out.value["path"], "/bin/sh");
        assert_eq!(out.value["opened"], true);
    }

    #[test]
    fn test_default_app_paths_not_empty() {
        let apps = default_app_paths();
        assert!(apps.contains_key("chrome"));
        assert!(apps.contains_key("firefox"));
    }
}
