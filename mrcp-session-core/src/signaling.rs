//! C1's signaling loop, as seen from session-core: the upcall surface a
//! session uses to push results back out to the network side (spec.md §5
//! "Signaling loop").

use async_trait::async_trait;

use crate::descriptor::{SessionDescriptor, SessionId};

/// External collaborator that owns the actual SIP/SDP or RTSP wire
/// encoding and transport (spec.md §1 Non-goals: "parsing or generating
/// SDP/SIP/RTSP wire text"). Session-core calls this trait with already
/// fully-resolved descriptors and expects the implementation to render
/// and transmit them.
#[async_trait]
pub trait SignalingAgent: Send + Sync {
    /// Send a completed answer for `session_id` (spec.md §4.1 step 8).
    async fn answer(&self, session_id: SessionId, answer: SessionDescriptor);

    /// Acknowledge a terminate request once every channel has torn down
    /// (spec.md §4.3 "Terminate a session").
    async fn terminate_response(&self, session_id: SessionId);

    /// Deliver an MRCP response/event back to the client on the control
    /// channel (spec.md §4.1 "Response/Event -> forward to signaling").
    async fn control_response(&self, session_id: SessionId, message: crate::message::MrcpMessage);
}
