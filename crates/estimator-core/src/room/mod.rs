// Room aggregate: the authoritative per-room state and its operations.

mod aggregate;
pub mod model;

use thiserror::Error;

use crate::store::StoreError;

pub use aggregate::Room;
pub use model::{canonical_deck, RoomId, RoomState, User, Vote, VoteView, COFFEE_BREAK};

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("field `{field}` is required")]
    MissingField { field: &'static str },

    #[error("user `{id}` does not exist")]
    UserNotFound { id: String },

    #[error("only the room admin may {action}")]
    NotAdmin { action: &'static str },

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl RoomError {
    /// HTTP-style status code for reporting the error to a caller.
    pub fn status(&self) -> u16 {
        match self {
            RoomError::MissingField { .. } => 400,
            RoomError::NotAdmin { .. } => 403,
            RoomError::UserNotFound { .. } => 404,
            RoomError::Storage(_) => 500,
        }
    }
}

/// Reject blank required fields before touching any state.
pub(crate) fn require<'a>(value: Option<&'a str>, field: &'static str) -> Result<&'a str, RoomError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(RoomError::MissingField { field }),
    }
}
