//! 脚本化 LLM 客户端（测试用，无需 API）
//!
//! 按顺序返回预置回复，并记录每次收到的消息，便于断言 prompt 内容与调用次数。
//! token 用量按空白分词计数。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, TokenUsage};
use crate::memory::Message;

#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: Mutex<Vec<Vec<Message>>>,
    usage: TokenUsage,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(|s| Ok(s.into())).collect()),
            calls: Mutex::new(Vec::new()),
            usage: TokenUsage::default(),
        }
    }

    /// 追加一次失败的调用
    pub fn push_error(&self, error: LlmError) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(Err(error));
        }
    }

    pub fn push(&self, response: impl Into<String>) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(Ok(response.into()));
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(messages.to_vec());
        }
        let response = self
            .responses
            .lock()
            .map_err(|_| LlmError::Request("scripted client lock poisoned".to_string()))?
            .pop_front()
            .unwrap_or(Err(LlmError::Exhausted))?;
        let prompt = messages
            .iter()
            .map(|m| m.content.split_whitespace().count() as u64)
            .sum();
        self.usage.add(prompt, response.split_whitespace().count() as u64);
        Ok(response)
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_responses_in_order() {
        let client = ScriptedLlmClient::new(["one", "two"]);
        client.push_error(LlmError::EmptyResponse);
        let msgs = [Message::user("hi")];
        assert_eq!(client.complete(&msgs).await.unwrap(), "one");
        assert_eq!(client.complete(&msgs).await.unwrap(), "two");
        assert_eq!(client.complete(&msgs).await, Err(LlmError::EmptyResponse));
        assert_eq!(client.complete(&msgs).await, Err(LlmError::Exhausted));
        assert_eq!(client.call_count(), 4);
        // 只有成功的调用计入用量
        assert_eq!(client.token_usage(), (2, 2, 4));
    }
}
