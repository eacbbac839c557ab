//! Error types for the media core.
//!
//! A single `thiserror`-derived enum plus a crate-level `Result` alias.

use thiserror::Error;

/// Errors surfaced by [`crate::context::MediaContext`] and
/// [`crate::engine::MediaEngine`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// `add_termination` was called on a context that already holds
    /// `capacity` terminations.
    #[error("media context at capacity ({capacity} terminations)")]
    CapacityExhausted {
        /// The context's fixed capacity.
        capacity: usize,
    },

    /// A termination/association operation referenced a slot index the
    /// context does not currently hold (already subtracted, or never
    /// added).
    #[error("termination slot {slot} is not bound in this context")]
    UnknownTermination {
        /// The slot index that was looked up.
        slot: usize,
    },

    /// A task message referenced a context id the engine has no record of.
    #[error("media engine has no context with id {context_id}")]
    UnknownContext {
        /// The context id from the task message.
        context_id: u64,
    },
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
