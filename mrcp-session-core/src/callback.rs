//! Tagged message variants carried across the loop boundaries named in
//! spec.md §5 and recommended by §9's design notes ("Callback vtables on
//! state machines, control channels, and engine channels should become
//! tagged message variants sent across channels between loops").
//!
//! Every asynchronous completion from C3 (media engine), C4 (control
//! channel / connection agent), C5 (engine channel / resource engine), and
//! the per-resource state machine funnels through one
//! [`SessionCallback`] channel that the C8 dispatcher demultiplexes by
//! `session_id`.

use mrcp_media_core::TaskResponse;

use crate::descriptor::SessionId;
use crate::message::MrcpMessage;

/// Position of an `MrcpChannel` within its session's channel array — the
/// SDP media position (spec.md §3 "id").
pub type ChannelId = usize;

/// One asynchronous completion bound for a specific session.
#[derive(Debug)]
pub enum SessionCallback {
    /// A [`TaskResponse`] from the media engine (C3).
    Media(TaskResponse),

    /// `on_channel_modify` — the connection agent (C4) finished an
    /// add/modify.
    ChannelModified {
        session_id: SessionId,
        channel_id: ChannelId,
        command_id: u64,
        accepted: bool,
    },

    /// `on_channel_remove` — the connection agent (C4) finished a remove.
    ChannelRemoved { session_id: SessionId, channel_id: ChannelId, command_id: u64 },

    /// `on_engine_channel_open` — the resource engine (C5) finished
    /// opening a channel.
    EngineChannelOpened {
        session_id: SessionId,
        channel_id: ChannelId,
        command_id: u64,
        opened: bool,
    },

    /// `on_engine_channel_close` — the resource engine (C5) finished
    /// closing a channel.
    EngineChannelClosed { session_id: SessionId, channel_id: ChannelId, command_id: u64 },

    /// `on_dispatch` — a channel's state machine produced a message bound
    /// for either the engine channel (`Request`) or the client
    /// (`Response`/`Event`).
    StateMachineDispatch {
        session_id: SessionId,
        channel_id: ChannelId,
        message: MrcpMessage,
    },

    /// `on_state_machine_deactivate` — a channel's state machine finished
    /// its deactivation sequence.
    StateMachineDeactivated { session_id: SessionId, channel_id: ChannelId },
}

impl SessionCallback {
    /// The session this callback is bound for. `Media` responses carry
    /// the session id as a plain string (set by the session when it built
    /// the originating [`mrcp_media_core::TaskMessage`]).
    pub fn session_id(&self) -> &str {
        match self {
            SessionCallback::Media(response) => &response.session_id,
            SessionCallback::ChannelModified { session_id, .. }
            | SessionCallback::ChannelRemoved { session_id, .. }
            | SessionCallback::EngineChannelOpened { session_id, .. }
            | SessionCallback::EngineChannelClosed { session_id, .. }
            | SessionCallback::StateMachineDispatch { session_id, .. }
            | SessionCallback::StateMachineDeactivated { session_id, .. } => session_id.as_str(),
        }
    }
}
