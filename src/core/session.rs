//! 会话：一个用户对话的上下文
//!
//! 每轮以 `&mut Session` 传入 Brain，同一会话同时只有一个活动轮次；
//! 持有 CancellationToken，用户中断时取消当前轮次的在途步骤。

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::memory::{ConversationMemory, Message};
use crate::plan::ContextRef;

#[derive(Debug)]
pub struct Session {
    id: String,
    turns: u64,
    conversation: ConversationMemory,
    cancel_token: CancellationToken,
    started_at: DateTime<Utc>,
}

impl Session {
    /// max_context_turns：对话窗口保留的轮数
    pub fn new(max_context_turns: usize) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), max_context_turns)
    }

    pub fn with_id(id: impl Into<String>, max_context_turns: usize) -> Self {
        Self {
            id: id.into(),
            turns: 0,
            conversation: ConversationMemory::new(max_context_turns),
            cancel_token: CancellationToken::new(),
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn turns(&self) -> u64 {
        self.turns
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// 开始新一轮，返回其上下文引用（轮次从 1 开始）
    pub fn next_turn(&mut self) -> ContextRef {
        self.turns += 1;
        // 上一轮被取消后，新一轮使用新的令牌
        if self.cancel_token.is_cancelled() {
            self.cancel_token = CancellationToken::new();
        }
        ContextRef {
            session_id: self.id.clone(),
            turn: self.turns,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 中断当前轮次
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn conversation(&self) -> &ConversationMemory {
        &self.conversation
    }

    /// 记录一次完整交互（user + assistant）
    pub fn record_exchange(&mut self, utterance: &str, answer: &str) {
        self.conversation.push(Message::user(utterance));
        self.conversation.push(Message::assistant(answer));
    }

    /// 短期记忆中本会话记录的 key 前缀
    pub fn short_term_prefix(&self) -> String {
        short_term_prefix(&self.id)
    }
}

pub fn short_term_prefix(session_id: &str) -> String {
    format!("session/{session_id}/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turns_increment() {
        let mut session = Session::with_id("s-1", 4);
        assert_eq!(session.next_turn().turn, 1);
        let ctx = session.next_turn();
        assert_eq!(ctx.turn, 2);
        assert_eq!(ctx.session_id, "s-1");
        assert_eq!(session.short_term_prefix(), "session/s-1/");
    }

    #[test]
    fn test_cancelled_token_renewed_next_turn() {
        let mut session = Session::new(4);
        session.cancel();
        assert!(session.cancel_token().is_cancelled());
        session.next_turn();
        assert!(!session.cancel_token().is_cancelled());
    }

    #[test]
    fn test_conversation_window_pruned() {
        let mut session = Session::new(1);
        session.record_exchange("hi", "hello");
        session.record_exchange("2+2?", "4");
        assert_eq!(session.conversation().len(), 2);
        assert_eq!(session.conversation().messages()[0].content, "2+2?");
    }
}
