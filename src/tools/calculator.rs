//! 计算器工具：四则运算、括号、幂、取模的递归下降求值

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{SideEffectClass, Tool, ToolDescriptor, ToolOutput};

pub struct CalculatorTool {
    descriptor: ToolDescriptor,
}

impl CalculatorTool {
    pub fn new() -> Self {
        let descriptor = ToolDescriptor::new(
            "calculator",
            "Evaluate an arithmetic expression (+ - * / % ^ and parentheses). Args: {\"expression\": \"2+2\"}",
            SideEffectClass::Pure,
        )
        .with_input_schema(serde_json::json!({
            "type": "object",
            "properties": {"expression": {"type": "string", "minLength": 1}},
            "required": ["expression"]
        }))
        .with_output_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "expression": {"type": "string"},
                "result": {"type": "number"}
            },
            "required": ["result"]
        }));
        Self { descriptor }
    }
}

impl Default for CalculatorTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for CalculatorTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, args: Value) -> Result<ToolOutput, String> {
        let expression = args
            .get("expression")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing expression".to_string())?;
        let result = evaluate(expression)?;
        // 整数结果输出为整数，避免 "4.0"
        let number = if result.fract() == 0.0 && result.abs() < i64::MAX as f64 {
            Value::from(result as i64)
        } else {
            serde_json::Number::from_f64(result)
                .map(Value::Number)
                .ok_or_else(|| format!("result is not finite: {result}"))?
        };
        Ok(ToolOutput::new(serde_json::json!({
            "expression": expression,
            "result": number,
        })))
    }
}

/// 求值算术表达式
pub fn evaluate(expression: &str) -> Result<f64, String> {
    let mut parser = Parser {
        chars: expression.chars().filter(|c| !c.is_whitespace()).collect(),
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    if parser.pos != parser.chars.len() {
        return Err(format!(
            "unexpected character '{}' at {}",
            parser.chars[parser.pos], parser.pos
        ));
    }
    if !value.is_finite() {
        return Err("division by zero".to_string());
    }
    Ok(value)
}

/// 括号、一元符号与幂的最大嵌套深度
const MAX_DEPTH: usize = 256;

struct Parser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn descend(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err("expression nested too deeply".to_string());
        }
        Ok(())
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> Result<f64, String> {
        let mut value = self.term()?;
        while let Some(op) = self.peek() {
            match op {
                '+' => {
                    self.pos += 1;
                    value += self.term()?;
                }
                '-' => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    // term := power (('*' | '/' | '%') power)*
    fn term(&mut self) -> Result<f64, String> {
        let mut value = self.power()?;
        while let Some(op) = self.peek() {
            match op {
                '*' | '×' => {
                    self.pos += 1;
                    value *= self.power()?;
                }
                '/' | '÷' => {
                    self.pos += 1;
                    let rhs = self.power()?;
                    if rhs == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    value /= rhs;
                }
                '%' => {
                    self.pos += 1;
                    let rhs = self.power()?;
                    if rhs == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    value %= rhs;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    // power := unary ('^' power)?   右结合
    fn power(&mut self) -> Result<f64, String> {
        let base = self.unary()?;
        if self.peek() == Some('^') {
            self.pos += 1;
            self.descend()?;
            let exp = self.power()?;
            self.depth -= 1;
            return Ok(base.powf(exp));
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some('-') => {
                self.pos += 1;
                self.descend()?;
                let value = -self.unary()?;
                self.depth -= 1;
                Ok(value)
            }
            Some('+') => {
                self.pos += 1;
                self.descend()?;
                let value = self.unary()?;
                self.depth -= 1;
                Ok(value)
            }
            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                self.descend()?;
                let value = self.expr()?;
                self.depth -= 1;
                if self.peek() != Some(')') {
                    return Err("missing closing parenthesis".to_string());
                }
                self.pos += 1;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => {
                let start = self.pos;
                while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
                    self.pos += 1;
                }
                let literal: String = self.chars[start..self.pos].iter().collect();
                literal
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number: {literal}"))
            }
            Some(c) => Err(format!("unexpected character '{c}' at {}", self.pos)),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}
