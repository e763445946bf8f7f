//! Ordered assistant conversation.
//!
//! The first turn is always the (hidden) system prompt. Turns are only
//! appended; the one exception is the trailing assistant turn, whose text
//! may be patched while it is streaming.

use serde::Serialize;
use thiserror::Error;

use crate::models::{Role, Turn};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConversationError {
    #[error("last turn is not streaming")]
    NotStreaming,

    #[error("cannot append while the last turn is still streaming")]
    StillStreaming,

    #[error("conversation already has a system turn")]
    DuplicateSystemTurn,
}

/// Change applied to the streaming turn.
#[derive(Debug, Clone, Default)]
pub struct TurnPatch {
    pub text: Option<String>,
    pub is_streaming: Option<bool>,
}

impl TurnPatch {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            is_streaming: None,
        }
    }

    pub fn finish(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            is_streaming: Some(false),
        }
    }
}

/// Immutable view for rendering.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSnapshot {
    pub revision: u64,
    pub turns: Vec<Turn>,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    turns: Vec<Turn>,
    revision: u64,
}

impl Conversation {
    /// New session seeded with the system prompt and a greeting.
    pub fn new(system_prompt: impl Into<String>, greeting: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::system(system_prompt), Turn::assistant(greeting)],
            revision: 0,
        }
    }

    pub fn append(&mut self, turn: Turn) -> Result<(), ConversationError> {
        if turn.role == Role::System {
            return Err(ConversationError::DuplicateSystemTurn);
        }
        if self.is_streaming() {
            return Err(ConversationError::StillStreaming);
        }
        self.turns.push(turn);
        self.revision += 1;
        Ok(())
    }

    /// Patch the trailing turn. Only legal while it is streaming.
    pub fn mutate_last(&mut self, patch: TurnPatch) -> Result<(), ConversationError> {
        let last = match self.turns.last_mut() {
            Some(t) if t.is_streaming => t,
            _ => return Err(ConversationError::NotStreaming),
        };
        if let Some(text) = patch.text {
            last.text = text;
        }
        if let Some(streaming) = patch.is_streaming {
            last.is_streaming = streaming;
        }
        self.revision += 1;
        Ok(())
    }

    pub fn is_streaming(&self) -> bool {
        self.turns.last().map(|t| t.is_streaming).unwrap_or(false)
    }

    pub fn system_prompt(&self) -> &str {
        &self.turns[0].text
    }

    /// All non-system turns, oldest first.
    pub fn history(&self) -> &[Turn] {
        &self.turns[1..]
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            revision: self.revision,
            turns: self.history().to_vec(),
        }
    }
}
