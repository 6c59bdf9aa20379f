//! Errors reported by the conversation engine.

use std::error::Error;
use std::fmt;

use crate::core::generation::GenerationError;
use crate::core::message::TurnId;

/// Which way a navigation request was heading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Previous,
    Next,
}

#[derive(Debug)]
pub enum ChatError {
    /// No turn with this id exists (never existed or was deleted).
    TurnNotFound(TurnId),
    /// Navigation ran off either end of the history.
    NoAdjacentExchange(Direction),
    /// The operation conflicts with the current state of the turns involved,
    /// e.g. pairing a turn that already has a different partner.
    InvalidState(String),
    /// The generation backend failed mid-stream. Partial content is kept.
    Backend(GenerationError),
}

impl ChatError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ChatError::TurnNotFound(_) | ChatError::NoAdjacentExchange(_)
        )
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::TurnNotFound(id) => write!(f, "message {id} not found"),
            ChatError::NoAdjacentExchange(Direction::Previous) => {
                write!(f, "no previous message")
            }
            ChatError::NoAdjacentExchange(Direction::Next) => write!(f, "no next message"),
            ChatError::InvalidState(reason) => write!(f, "invalid state: {reason}"),
            ChatError::Backend(err) => write!(f, "generation failed: {err}"),
        }
    }
}

impl Error for ChatError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ChatError::Backend(err) => Some(err),
            _ => None,
        }
    }
}

impl From<GenerationError> for ChatError {
    fn from(value: GenerationError) -> Self {
        ChatError::Backend(value)
    }
}
