//! C6 — MRCP Channel: aggregates a control channel (C4) and an engine
//! channel (C5) for a single resource inside a session.

use std::sync::Arc;

use crate::callback::ChannelId;
use crate::channel::control::ControlChannel;
use crate::channel::engine_channel::EngineChannel;
use crate::descriptor::SessionId;
use crate::state_machine::ResourceStateMachine;

/// One resource's worth of channel state inside a session (spec.md §3
/// "MRCP channel").
pub struct MrcpChannel {
    pub resource_name: String,
    pub session_id: SessionId,
    pub control_channel: Option<ControlChannel>,
    pub engine_channel: Option<EngineChannel>,
    pub state_machine: Option<Arc<dyn ResourceStateMachine>>,
    /// SDP media position (the `control`/`answer` array index) this
    /// channel corresponds to — distinct from its position in the
    /// session's `channels` vec, which is assignment order and can
    /// diverge from the SDP position once an earlier offer entry fails
    /// synchronously without a channel ever being pushed for it.
    pub id: ChannelId,
    /// Control-media-id grouping this channel with an RTP termination slot.
    pub cmid: Option<u32>,
}

impl MrcpChannel {
    /// A freshly created channel with neither leg open yet.
    pub fn new(session_id: SessionId, resource_name: impl Into<String>, id: ChannelId, cmid: Option<u32>) -> Self {
        Self {
            resource_name: resource_name.into(),
            session_id,
            control_channel: None,
            engine_channel: None,
            state_machine: None,
            id,
            cmid,
        }
    }

    /// A channel is fully torn down once both legs are gone (spec.md §3
    /// invariant "A channel is torn down only after both its
    /// control-channel and its engine-channel acknowledge closure").
    pub fn is_torn_down(&self) -> bool {
        self.control_channel.is_none() && self.engine_channel.is_none()
    }
}
