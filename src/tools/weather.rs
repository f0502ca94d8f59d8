//! 天气工具：查询 wttr.in 的 JSON 接口（format=j1）
//!
//! 查询类接口，幂等，可重试；未指定地点时使用配置的默认城市。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::tools::{SideEffectClass, Tool, ToolDescriptor, ToolOutput};

pub struct WeatherTool {
    descriptor: ToolDescriptor,
    client: Client,
    base_url: String,
    default_location: String,
}

impl WeatherTool {
    pub fn new(base_url: impl Into<String>, default_location: impl Into<String>, timeout_secs: u64) -> Self {
        let descriptor = ToolDescriptor::new(
            "weather",
            "Current weather for a location. Args: {\"location\": \"Beijing\"} (location optional)",
            SideEffectClass::Idempotent,
        )
        .with_input_schema(serde_json::json!({
            "type": "object",
            "properties": {"location": {"type": "string"}}
        }))
        .with_output_schema(weather_output_schema());
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("jarvis/0.1")
            .build()
            .unwrap_or_default();
        Self {
            descriptor,
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_location: default_location.into(),
        }
    }
}

/// weather 工具的输出 Schema（测试桩复用）
pub fn weather_output_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "location": {"type": "string"},
            "temperature_c": {"type": "number"},
            "condition": {"type": "string"},
            "humidity": {"type": "number"}
        },
        "required": ["location", "temperature_c", "condition"]
    })
}

/// 从 wttr.in j1 响应中提取当前天气
fn parse_current(location: &str, body: &Value) -> Result<Value, String> {
    let current = body
        .get("current_condition")
        .and_then(|c| c.get(0))
        .ok_or_else(|| "response has no current_condition".to_string())?;
    let number = |key: &str| -> Option<f64> {
        current.get(key).and_then(|v| match v {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        })
    };
    let temperature = number("temp_C").ok_or_else(|| "response has no temp_C".to_string())?;
    let condition = current
        .get("weatherDesc")
        .and_then(|d| d.get(0))
        .and_then(|d| d.get("value"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .trim()
        .to_string();
    let mut out = serde_json::json!({
        "location": location,
        "temperature_c": temperature,
        "condition": condition,
    });
    if let Some(humidity) = number("humidity") {
        out["humidity"] = Value::from(humidity);
    }
    Ok(out)
}

#[async_trait]
impl Tool for WeatherTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, args: Value) -> Result<ToolOutput, String> {
        let location = args
            .get("location")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.default_location)
            .to_string();
        let url = format!("{}/{}", self.base_url, location.replace(' ', "+"));
        let resp = self
            .client
            .get(&url)
            .query(&[("format", "j1")])
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let body: Value = resp.json().await.map_err(|e| format!("Invalid JSON: {}", e))?;
        Ok(ToolOutput::new(parse_current(&location, &body)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_current_condition() {
        let body = serde_json::json!({
            "current_condition": [{
                "temp_C": "21",
                "humidity": "40",
                "weatherDesc": [{"value": "Sunny "}]
            }]
        });
        let out = parse_current("Paris", &body).unwrap();
        assert_eq!(out["temperature_c"], serde_json::json!(21.0));
        assert_eq!(out["condition"], "Sunny");
        assert_eq!(out["humidity"], serde_json::json!(40.0));
    }

    #[test]
    fn test_parse_missing_condition() {
        assert!(parse_current("Paris", &serde_json::json!({})).is_err());
    }
}
