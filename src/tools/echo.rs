//! Echo 工具（诊断 / 测试用）

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{SideEffectClass, Tool, ToolDescriptor, ToolOutput};

/// Echo 工具：原样返回 text
pub struct EchoTool {
    descriptor: ToolDescriptor,
}

impl EchoTool {
    pub fn new() -> Self {
        let descriptor = ToolDescriptor::new(
            "echo",
            "Echo text back (diagnostics). Args: {\"text\": \"message\"}",
            SideEffectClass::Pure,
        )
        .with_input_schema(serde_json::json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        }))
        .with_output_schema(serde_json::json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        }));
        Self { descriptor }
    }
}

impl Default for EchoTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, args: Value) -> Result<ToolOutput, String> {
        let text = args
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        Ok(ToolOutput::new(serde_json::json!({ "text": text })))
    }
}
