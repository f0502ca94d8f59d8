//! 工具注册表
//!
//! 所有工具实现 Tool trait（descriptor / invoke），由 ToolRegistry 按名注册与查找。
//! 注册时编译输入/输出 Schema；invoke 在分发前校验参数、返回前校验结果。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde_json::Value;
use thiserror::Error;

use crate::core::ToolError;
use crate::tools::descriptor::{ToolDescriptor, ToolOutput};

/// 工具 trait：描述（名称、Schema、副作用等级）+ 异步调用（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    /// 工具名称（Plan 中 step.tool 字段）
    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// 执行工具；错误为可读描述，由注册表包装为 ToolError::ExecutionError
    async fn invoke(&self, args: Value) -> Result<ToolOutput, String>;
}

/// 注册错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tool already registered: {0}")]
    DuplicateTool(String),
    #[error("tool {tool} has an invalid schema: {detail}")]
    InvalidSchema { tool: String, detail: String },
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    input: JSONSchema,
    output: JSONSchema,
}

/// 工具注册表：启动时注册，之后只读共享（Arc<ToolRegistry>）
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let descriptor = tool.descriptor();
        let name = descriptor.name.clone();
        if self.tools.contains_key(&name) {
            return Err(RegistryError::DuplicateTool(name));
        }
        if !descriptor.is_fully_specified() {
            return Err(RegistryError::InvalidSchema {
                tool: name,
                detail: "input and output schemas must be objects with a \"type\"".to_string(),
            });
        }
        let input = compile(&name, &descriptor.input_schema)?;
        let output = compile(&name, &descriptor.output_schema)?;
        tracing::debug!(tool = %name, side_effect = ?descriptor.side_effect, "tool registered");
        self.tools.insert(name, RegisteredTool { tool, input, output });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|t| t.tool.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name).map(|t| t.tool.descriptor())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 按输入 Schema 校验参数（不调用工具）
    pub fn validate_args(&self, name: &str, args: &Value) -> Result<(), ToolError> {
        let entry = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::Unregistered(name.to_string()))?;
        check(name, &entry.input, args, "input")
    }

    /// 校验参数 -> 调用 -> 校验输出
    pub async fn invoke(&self, name: &str, args: Value) -> Result<ToolOutput, ToolError> {
        let entry = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::Unregistered(name.to_string()))?;
        check(name, &entry.input, &args, "input")?;
        let output = entry
            .tool
            .invoke(args)
            .await
            .map_err(|detail| ToolError::ExecutionError {
                tool: name.to_string(),
                detail,
            })?;
        check(name, &entry.output, &output.value, "output")?;
        Ok(output)
    }

    /// 按名称排序的工具描述
    pub fn catalog(&self) -> Vec<ToolDescriptor> {
        self.tools.values().map(|t| t.tool.descriptor().clone()).collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 工具目录 JSON，拼入规划 prompt
    pub fn to_schema_json(&self) -> String {
        catalog_json(&self.catalog())
    }
}

/// 将工具描述列表序列化为 prompt 用的 JSON
pub fn catalog_json(catalog: &[ToolDescriptor]) -> String {
    let tools: Vec<Value> = catalog
        .iter()
        .map(|d| {
            serde_json::json!({
                "name": d.name,
                "description": d.description,
                "side_effect": d.side_effect,
                "parameters": d.input_schema,
            })
        })
        .collect();
    serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
}

fn compile(tool: &str, schema: &Value) -> Result<JSONSchema, RegistryError> {
    JSONSchema::compile(schema).map_err(|e| RegistryError::InvalidSchema {
        tool: tool.to_string(),
        detail: e.to_string(),
    })
}

fn check(tool: &str, schema: &JSONSchema, value: &Value, which: &str) -> Result<(), ToolError> {
    if let Err(errors) = schema.validate(value) {
        let detail = errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
        return Err(ToolError::SchemaViolation {
            tool: tool.to_string(),
            detail: format!("{which}: {detail}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, SideEffectClass};

    struct BadOutput {
        descriptor: ToolDescriptor,
    }

    #[async_trait]
    impl Tool for BadOutput {
        fn descriptor(&self) -> &ToolDescriptor {
            &self.descriptor
        }

        async fn invoke(&self, _args: Value) -> Result<ToolOutput, String> {
            Ok(ToolOutput::new(serde_json::json!({"count": "not a number"})))
        }
    }

    fn bad_output() -> BadOutput {
        BadOutput {
            descriptor: ToolDescriptor::new("bad", "returns malformed output", SideEffectClass::Pure)
                .with_output_schema(serde_json::json!({
                    "type": "object",
                    "properties": {"count": {"type": "integer"}},
                    "required": ["count"]
                })),
        }
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool::new()).unwrap();
        assert_eq!(
            registry.register(EchoTool::new()),
            Err(RegistryError::DuplicateTool("echo".to_string()))
        );
    }

    #[test]
    fn test_incomplete_schema_rejected() {
        let mut tool = bad_output();
        tool.descriptor.input_schema = serde_json::json!({});
        let mut registry = ToolRegistry::new();
        assert!(matches!(
            registry.register(tool),
            Err(RegistryError::InvalidSchema { .. })
        ));
    }

    #[tokio::test]
    async fn test_invoke_validates_args() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool::new()).unwrap();
        let err = registry.invoke("echo", serde_json::json!({"text": 42})).await.unwrap_err();
        assert!(matches!(err, ToolError::SchemaViolation { .. }));
        let out = registry.invoke("echo", serde_json::json!({"text": "hi"})).await.unwrap();
        assert_eq!(out.value["text"], "hi");
    }

    #[tokio::test]
    async fn test_invoke_validates_output() {
        let mut registry = ToolRegistry::new();
        registry.register(bad_output()).unwrap();
        let err = registry.invoke("bad", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::SchemaViolation { detail, .. } if detail.starts_with("output")));
    }

    #[tokio::test]
    async fn test_unregistered_tool() {
        let registry = ToolRegistry::new();
        let err = registry.invoke("fly_to_moon", serde_json::json!({})).await.unwrap_err();
        assert_eq!(err, ToolError::Unregistered("fly_to_moon".to_string()));
    }

    #[test]
    fn test_catalog_sorted_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(bad_output()).unwrap();
        registry.register(EchoTool::new()).unwrap();
        let names: Vec<String> = registry.catalog().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["bad", "echo"]);
        assert!(registry.to_schema_json().contains("\"echo\""));
    }
}
