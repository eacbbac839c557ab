//! # mrcp-media-core
//!
//! The media-topology half of the MRCP gateway session core: terminations
//! (C1), the per-session association matrix and its processing-object
//! factory (C2), and the single-threaded media engine that ticks that
//! factory and applies topology mutations off the signaling loop (C3).
//!
//! This crate knows nothing about MRCP signaling, resources, or control
//! channels — see `mrcp-session-core` for those. It only knows about
//! terminations, directed associations between them, and the bridges
//! materialised from an `on` association.

pub mod bridge;
pub mod context;
pub mod engine;
pub mod error;
pub mod termination;

pub use bridge::{ConnectionDiagnostic, MediaObject, NullBridge, TranscodingBridge};
pub use context::{ContextFactory, MediaContext, TerminationDescriptor};
pub use engine::{CommandId, MediaEngine, TaskMessage, TaskOutcome, TaskResponse};
pub use error::{Error, Result};
pub use termination::{AudioStream, CodecDescriptor, StreamMode, Termination};
