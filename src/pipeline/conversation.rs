//! Rolling conversation history for the language-model stage.
//!
//! [`Conversation`] keeps recent `(user, reply)` exchanges and turns them
//! into the message list for each chat-completion call:
//!
//! ```text
//! system   <system prompt>
//! user     <exchange n-k user>       ┐
//! assistant<exchange n-k reply>      │ last `context_len` exchanges
//! ...                                ┘
//! user     <current utterance>
//! ```
//!
//! Twice `context_len` exchanges are retained so a caller can inspect a
//! little more history than is sent.

use std::collections::VecDeque;

use crate::services::ChatMessage;

/// Prompt used when none is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are RoverSeer, a helpful voice assistant. \
Answer in one to three short spoken sentences. Do not use markdown, lists, code or emoji.";

/// One completed question and answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub user: String,
    pub reply: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    exchanges: VecDeque<Exchange>,
    context_len: usize,
    system_prompt: String,
}

impl Conversation {
    pub fn new(context_len: usize, system_prompt: Option<&str>) -> Self {
        let system_prompt = system_prompt
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_SYSTEM_PROMPT)
            .to_string();
        Self {
            exchanges: VecDeque::with_capacity(context_len * 2 + 1),
            context_len,
            system_prompt,
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Record a completed exchange, dropping the oldest beyond the retained
    /// window.
    pub fn push(&mut self, user: impl Into<String>, reply: impl Into<String>, model: &str) {
        self.exchanges.push_back(Exchange {
            user: user.into(),
            reply: reply.into(),
            model: model.to_string(),
        });
        while self.exchanges.len() > self.context_len * 2 {
            self.exchanges.pop_front();
        }
    }

    /// Messages for a request about `user_text`.
    pub fn build_messages(&self, user_text: &str) -> Vec<ChatMessage> {
        let skip = self.exchanges.len().saturating_sub(self.context_len);
        let mut messages = Vec::with_capacity(self.context_len * 2 + 2);
        messages.push(ChatMessage::system(self.system_prompt.as_str()));
        for ex in self.exchanges.iter().skip(skip) {
            messages.push(ChatMessage::user(ex.user.as_str()));
            messages.push(ChatMessage::assistant(ex.reply.as_str()));
        }
        messages.push(ChatMessage::user(user_text));
        messages
    }

    pub fn exchanges(&self) -> impl Iterator<Item = &Exchange> {
        self.exchanges.iter()
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    pub fn clear(&mut self) {
        self.exchanges.clear();
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new(4, None)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::Role;

    #[test]
    fn empty_history_sends_system_and_user() {
        let conv = Conversation::default();
        let msgs = conv.build_messages("hello");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[0].content, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(msgs[1], ChatMessage::user("hello"));
    }

    #[test]
    fn blank_prompt_falls_back_to_default() {
        let conv = Conversation::new(4, Some("   "));
        assert_eq!(conv.system_prompt(), DEFAULT_SYSTEM_PROMPT);
        let conv = Conversation::new(4, Some("Be terse."));
        assert_eq!(conv.system_prompt(), "Be terse.");
    }

    #[test]
    fn only_recent_exchanges_are_sent() {
        let mut conv = Conversation::new(2, None);
        for i in 0..3 {
            conv.push(format!("q{i}"), format!("a{i}"), "m");
        }
        let msgs = conv.build_messages("now");
        let contents: Vec<_> = msgs.iter().skip(1).map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q1", "a1", "q2", "a2", "now"]);
    }

    #[test]
    fn twice_the_context_is_retained() {
        let mut conv = Conversation::new(2, None);
        for i in 0..10 {
            conv.push(format!("q{i}"), format!("a{i}"), "m");
        }
        assert_eq!(conv.len(), 4);
        assert_eq!(conv.exchanges().next().map(|e| e.user.as_str()), Some("q6"));
        conv.clear();
        assert!(conv.is_empty());
    }
}
