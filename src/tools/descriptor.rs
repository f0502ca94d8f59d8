//! 工具描述：名称、描述、输入/输出 Schema、副作用等级

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 副作用等级，决定执行器能否自动重试
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectClass {
    /// 无外部状态变化
    Pure,
    /// 重复调用结果一致（如查询类接口）
    Idempotent,
    /// 每次调用都会产生新的外部效果（发邮件、打开应用）
    NonIdempotent,
}

impl SideEffectClass {
    pub fn is_retryable(self) -> bool {
        !matches!(self, SideEffectClass::NonIdempotent)
    }
}

/// 工具描述，注册时校验并编译 Schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
    pub side_effect: SideEffectClass,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        side_effect: SideEffectClass,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::json!({ "type": "object", "properties": {} }),
            output_schema: serde_json::json!({ "type": "object" }),
            side_effect,
        }
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    /// 输入与输出都是带 "type" 的对象 Schema
    pub fn is_fully_specified(&self) -> bool {
        is_typed_object(&self.input_schema) && is_typed_object(&self.output_schema)
    }
}

fn is_typed_object(schema: &Value) -> bool {
    schema
        .as_object()
        .map(|o| o.contains_key("type"))
        .unwrap_or(false)
}

/// 工具调用结果：输出值 + 是否改变了外部状态
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub value: Value,
    pub state_changed: bool,
}

impl ToolOutput {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            state_changed: false,
        }
    }

    pub fn changed(value: Value) -> Self {
        Self {
            value,
            state_changed: true,
        }
    }
}
