//! Typed error hierarchy for the kitchen display engine.
//!
//! `KdsError` is what store operations return; the HTTP layer maps each
//! variant onto a status code in `kitchen::api`.

use kds_common::{Action, Role, TransitionError};
use thiserror::Error;

pub type KdsResult<T> = std::result::Result<T, KdsError>;

#[derive(Debug, Error)]
pub enum KdsError {
    #[error("Missing or unrecognised staff role")]
    Unauthenticated,

    #[error("Role '{role}' may not {action}")]
    Forbidden { role: Role, action: Action },

    #[error("Order {id} not found")]
    OrderNotFound { id: i64 },

    #[error("Ticket {id} not found")]
    TicketNotFound { id: i64 },

    #[error("Ticket item {id} not found")]
    TicketItemNotFound { id: i64 },

    #[error("Invalid transition: {0}")]
    InvalidTransition(#[from] TransitionError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Database still busy after {attempts} attempts")]
    Contention { attempts: u32 },

    #[error("Database error: {0:#}")]
    Database(#[from] anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KdsError {
    /// Only contention is worth retrying; everything else fails the same way twice.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Contention { .. })
    }

    pub fn require(role: Role, action: Action) -> KdsResult<()> {
        if role.permits(action) {
            Ok(())
        } else {
            Err(Self::Forbidden { role, action })
        }
    }
}
