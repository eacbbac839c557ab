//! C4, C5, C6 — the per-resource channel stack.

pub mod control;
pub mod engine_channel;
pub mod mrcp_channel;

pub use control::{ConnectionAgent, ControlChannel};
pub use engine_channel::{EngineChannel, ResourceEngine};
pub use mrcp_channel::MrcpChannel;
