//! Error types for session orchestration.

use thiserror::Error;

use crate::descriptor::SessionId;

/// Errors surfaced by [`crate::session::Session`] and [`crate::table::SessionTable`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionCoreError {
    /// No session is registered under this id (spec.md §8 table invariant).
    #[error("no session registered with id {0}")]
    SessionNotFound(SessionId),

    /// The offer/control message referenced a resource name not present
    /// in the profile's resource factory (spec.md §7 "Resource unknown").
    #[error("no such resource: {0}")]
    NoSuchResource(String),

    /// The resource exists but its engine is missing or refused
    /// `create_channel` (spec.md §7 "Resource engine unavailable").
    #[error("resource engine unavailable for resource: {0}")]
    EngineUnavailable(String),

    /// A control message referenced a channel that does not exist, or a
    /// channel without a resource/state machine bound yet.
    #[error("channel not found or not ready: {0}")]
    ChannelNotReady(String),

    /// The media context rejected a termination because it is at capacity
    /// (spec.md §7 "Capacity exhausted in context").
    #[error("media context capacity exhausted")]
    CapacityExhausted,
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, SessionCoreError>;
