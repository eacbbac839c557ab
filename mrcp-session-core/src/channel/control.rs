//! C4 — Control Channel: the per-resource signalling leg against a
//! connection agent.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::callback::{ChannelId, SessionCallback};
use crate::descriptor::SessionId;

/// External collaborator that owns MRCP-v2 TCP/TLS connections and
/// control-channel handles (spec.md §5 "Connection-agent loop").
///
/// `modify`/`remove` return synchronously whether the request was
/// *accepted for asynchronous processing*; a later
/// [`SessionCallback::ChannelModified`]/[`SessionCallback::ChannelRemoved`]
/// on `callbacks` carries the actual outcome. Returning `false` here is
/// the "Control-channel modify/add rejected synchronously" path from
/// spec.md §7 — no callback follows in that case.
#[async_trait]
pub trait ConnectionAgent: Send + Sync {
    async fn modify(
        &self,
        session_id: SessionId,
        channel_id: ChannelId,
        command_id: u64,
        resource_name: String,
        callbacks: mpsc::UnboundedSender<SessionCallback>,
    ) -> bool;

    async fn remove(
        &self,
        session_id: SessionId,
        channel_id: ChannelId,
        command_id: u64,
        callbacks: mpsc::UnboundedSender<SessionCallback>,
    ) -> bool;
}

/// Per-resource handle pairing a channel id with the shared connection
/// agent (spec.md §3 "MRCP channel ... optional control-channel handle").
pub struct ControlChannel {
    agent: std::sync::Arc<dyn ConnectionAgent>,
    channel_id: ChannelId,
}

impl ControlChannel {
    pub fn new(agent: std::sync::Arc<dyn ConnectionAgent>, channel_id: ChannelId) -> Self {
        Self { agent, channel_id }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Issue `modify` (covers both "add" and "modify" — spec.md §4.1 uses
    /// the same verb for both in the v2 path).
    pub async fn modify(
        &self,
        session_id: SessionId,
        command_id: u64,
        resource_name: String,
        callbacks: mpsc::UnboundedSender<SessionCallback>,
    ) -> bool {
        self.agent.modify(session_id, self.channel_id, command_id, resource_name, callbacks).await
    }

    /// Issue `remove`.
    pub async fn remove(&self, session_id: SessionId, command_id: u64, callbacks: mpsc::UnboundedSender<SessionCallback>) -> bool {
        self.agent.remove(session_id, self.channel_id, command_id, callbacks).await
    }
}
