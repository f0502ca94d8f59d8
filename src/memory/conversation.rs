//! 对话窗口
//!
//! 会话内保留最近 N 轮（user/assistant 对），超出时丢弃最旧的消息。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 最近 max_turns 轮对话（约 max_turns*2 条消息）
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    messages: Vec<Message>,
    max_turns: usize,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_turns,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
        let keep = self.max_turns * 2;
        if self.messages.len() > keep {
            self.messages.drain(..self.messages.len() - keep);
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_user(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_keeps_latest_turns() {
        let mut memory = ConversationMemory::new(2);
        for i in 0..3 {
            memory.push(Message::user(format!("q{i}")));
            memory.push(Message::assistant(format!("a{i}")));
        }
        assert_eq!(memory.len(), 4);
        assert_eq!(memory.messages()[0].content, "q1");
        assert_eq!(memory.last_user().map(|m| m.content.as_str()), Some("q2"));
    }

    #[test]
    fn test_zero_turn_window_keeps_nothing() {
        let mut memory = ConversationMemory::new(0);
        memory.push(Message::user("hi"));
        assert!(memory.is_empty());
    }
}
