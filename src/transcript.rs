//! session transcript: an append-only, ordered record of chat turns.
//!
//! one `Transcript` lives on each `ChatSession` entity and is only ever
//! touched from the main thread (the dispatch and drain systems). there is
//! no edit, delete, or reorder operation; consumers re-render off bevy
//! change detection (`Changed<Transcript>`) and the completion events.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use crate::provider::ProviderError;
use crate::reasoning::split_reasoning;
use llm::chat::ChatMessage;

/// who produced a turn. fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// one message in the conversation.
///
/// `reasoning` is only ever `Some` on assistant turns, and `content` of a
/// reconciled assistant turn never contains the `<think>` markers (they are
/// stripped before storage).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            reasoning: None,
        }
    }

    /// finalize a fully buffered completion: split off the reasoning
    /// section and store the cleaned visible text.
    pub fn assistant_from_raw(raw: &str) -> Self {
        let (content, reasoning) = split_reasoning(raw);
        Self {
            role: Role::Assistant,
            content,
            reasoning,
        }
    }

    /// provider failures still produce a visible assistant turn so every
    /// user turn is answered by exactly one assistant turn.
    pub fn provider_failure(error: &ProviderError) -> Self {
        Self {
            role: Role::Assistant,
            content: format!("Error: {error}"),
            reasoning: None,
        }
    }
}

/// ordered, append-only turn history for one session entity.
#[derive(Component, Debug, Clone, Default)]
pub struct Transcript {
    turns: Vec<Turn>,
    scroll_pending: bool,
}

impl Transcript {
    /// append one turn at the end and flag the display surface to scroll
    /// to the newest entry.
    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
        self.scroll_pending = true;
    }

    /// the full ordered history.
    pub fn all(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// the history as provider request messages, in original order.
    /// reasoning annotations never leave the store; only role and visible
    /// content are sent back to the model.
    pub fn provider_messages(&self) -> Vec<ChatMessage> {
        self.turns
            .iter()
            .map(|turn| match turn.role {
                Role::User => ChatMessage::user().content(turn.content.clone()).build(),
                Role::Assistant => ChatMessage::assistant()
                    .content(turn.content.clone())
                    .build(),
            })
            .collect()
    }

    /// read-and-clear the autoscroll flag. the display surface owner calls
    /// this once it has scheduled a scroll-into-view.
    pub fn take_scroll_pending(&mut self) -> bool {
        std::mem::take(&mut self.scroll_pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm::chat::ChatRole;
    use pretty_assertions::assert_eq;

    #[test]
    fn append_preserves_insertion_order() {
        let mut t = Transcript::default();
        t.append(Turn::user("first"));
        t.append(Turn::assistant_from_raw("second"));
        t.append(Turn::user("third"));

        let contents: Vec<&str> = t.all().iter().map(|x| x.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn provider_messages_exclude_reasoning() {
        let mut t = Transcript::default();
        t.append(Turn::user("how are you?"));
        t.append(Turn::assistant_from_raw(
            "<think>checking in</think>doing fine",
        ));

        let msgs = t.provider_messages();
        assert_eq!(msgs.len(), 2);
        assert!(matches!(msgs[0].role, ChatRole::User));
        assert_eq!(msgs[0].content, "how are you?");
        assert!(matches!(msgs[1].role, ChatRole::Assistant));
        // cleaned content only; the reasoning annotation stays local
        assert_eq!(msgs[1].content, "doing fine");
    }

    #[test]
    fn assistant_from_raw_splits_reasoning() {
        let turn = Turn::assistant_from_raw("A<think>B</think>C");
        assert_eq!(turn.role, Role::Assistant);
        assert_eq!(turn.content, "AC");
        assert_eq!(turn.reasoning.as_deref(), Some("B"));
    }

    #[test]
    fn provider_failure_turn_is_readable() {
        let err = ProviderError::Request("401 unauthorized".into());
        let turn = Turn::provider_failure(&err);
        assert_eq!(turn.role, Role::Assistant);
        assert!(turn.content.starts_with("Error: "));
        assert!(turn.content.contains("401 unauthorized"));
        assert_eq!(turn.reasoning, None);
    }

    #[test]
    fn scroll_flag_sets_on_append_and_clears_on_take() {
        let mut t = Transcript::default();
        assert!(!t.take_scroll_pending());

        t.append(Turn::user("hi"));
        assert!(t.take_scroll_pending());
        assert!(!t.take_scroll_pending());
    }
}
