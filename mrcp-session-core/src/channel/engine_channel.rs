//! C5 — Engine Channel: the per-resource binding to a resource-engine
//! plugin, carrying one termination and one MRCP state machine.

use std::sync::Arc;

use async_trait::async_trait;
use mrcp_media_core::Termination;
use tokio::sync::mpsc;

use crate::callback::{ChannelId, SessionCallback};
use crate::descriptor::SessionId;
use crate::message::MrcpMessage;
use crate::state_machine::ResourceStateMachine;

/// External collaborator that owns resource-engine plugin state (spec.md
/// §5 "Resource-engine loops"). Each resource (`speechsynth`,
/// `speechrecog`, ...) has exactly one `ResourceEngine` in the profile's
/// engine table.
///
/// `open_channel`/`close_channel` return synchronously whether the
/// request was accepted for asynchronous processing; a later
/// [`SessionCallback::EngineChannelOpened`]/[`SessionCallback::EngineChannelClosed`]
/// on `callbacks` carries the outcome.
#[async_trait]
pub trait ResourceEngine: Send + Sync {
    async fn open_channel(
        &self,
        session_id: SessionId,
        channel_id: ChannelId,
        command_id: u64,
        callbacks: mpsc::UnboundedSender<SessionCallback>,
    ) -> bool;

    async fn close_channel(
        &self,
        session_id: SessionId,
        channel_id: ChannelId,
        command_id: u64,
        callbacks: mpsc::UnboundedSender<SessionCallback>,
    ) -> bool;

    /// Build the per-channel termination this resource exposes into the
    /// media context (its internal synth/recog audio endpoint).
    fn create_termination(&self, resource_name: &str) -> Termination;

    /// Build the per-channel MRCP state machine for this resource
    /// (spec.md §4.1 "created by the resource plugin").
    fn create_state_machine(
        &self,
        session_id: SessionId,
        channel_id: ChannelId,
        callbacks: mpsc::UnboundedSender<SessionCallback>,
        version: crate::descriptor::MrcpVersion,
    ) -> Arc<dyn ResourceStateMachine>;

    /// Forward a client `Request` message into the resource engine
    /// (spec.md §4.1 "Request → forward to engine channel's
    /// `request_process`"). The resource engine eventually feeds a
    /// `Response`/`Event` back through the same channel's state machine
    /// via `on_engine_message`.
    async fn request_process(&self, channel_id: ChannelId, message: MrcpMessage);
}

/// Per-resource handle pairing a resource engine with the termination and
/// state machine it created for this channel (spec.md §3 "MRCP channel
/// ... optional engine-channel handle").
pub struct EngineChannel {
    engine: Arc<dyn ResourceEngine>,
    channel_id: ChannelId,
    termination_slot: usize,
    state_machine: Arc<dyn ResourceStateMachine>,
}

impl EngineChannel {
    pub fn new(
        engine: Arc<dyn ResourceEngine>,
        channel_id: ChannelId,
        termination_slot: usize,
        state_machine: Arc<dyn ResourceStateMachine>,
    ) -> Self {
        Self {
            engine,
            channel_id,
            termination_slot,
            state_machine,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// The row/column this resource's termination is bound to in the
    /// session's media context.
    pub fn termination_slot(&self) -> usize {
        self.termination_slot
    }

    pub fn state_machine(&self) -> &Arc<dyn ResourceStateMachine> {
        &self.state_machine
    }

    pub async fn open(
        &self,
        session_id: SessionId,
        command_id: u64,
        callbacks: mpsc::UnboundedSender<SessionCallback>,
    ) -> bool {
        self.engine.open_channel(session_id, self.channel_id, command_id, callbacks).await
    }

    pub async fn close(
        &self,
        session_id: SessionId,
        command_id: u64,
        callbacks: mpsc::UnboundedSender<SessionCallback>,
    ) -> bool {
        self.engine.close_channel(session_id, self.channel_id, command_id, callbacks).await
    }

    /// Forward a request from the client into the resource engine.
    pub async fn request_process(&self, message: MrcpMessage) {
        self.engine.request_process(self.channel_id, message).await
    }
}
