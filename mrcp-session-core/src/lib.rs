//! # mrcp-session-core
//!
//! The MRCP-signaling half of the gateway session core: the control/engine
//! channel stack (C4–C6), the per-session orchestrator (C7), and the
//! process-wide session table and callback dispatcher (C8). Built on top
//! of `mrcp-media-core`'s termination/context/engine primitives.

pub mod callback;
pub mod channel;
pub mod descriptor;
pub mod error;
pub mod message;
pub mod profile;
pub mod rtp;
pub mod session;
pub mod signaling;
pub mod state_machine;
pub mod table;

use std::sync::Arc;

use tokio::sync::mpsc;

use mrcp_media_core::TaskResponse;

pub use callback::{ChannelId, SessionCallback};
pub use descriptor::{ControlMediaDescriptor, MediaSlot, MediaSlotDescriptor, MrcpVersion, ResourceState, SessionDescriptor, SessionId, SessionStatus};
pub use error::{Result, SessionCoreError};
pub use message::{MrcpMessage, MrcpMessageKind};
pub use profile::{EngineTable, Profile, ProfileBuilder, ResourceFactory};
pub use rtp::{RtpTerminationFactory, RtpTerminationSlot};
pub use session::{Session, SessionState};
pub use signaling::SignalingAgent;
pub use state_machine::{GenericState, GenericStateMachine, ResourceStateMachine};
pub use table::{SessionTable, SessionTableStats};

/// Top-level facade wiring a [`Profile`], a [`SignalingAgent`], and the
/// media engine's response stream into one running [`SessionTable`] plus
/// its background dispatcher task (spec.md §2 control-flow summary: "a
/// signaling message enters C7 via C8").
pub struct SessionCore {
    table: Arc<SessionTable>,
}

impl SessionCore {
    /// Spawn the dispatcher loop and return a handle to drive sessions
    /// through it. `media_responses` must be the receiver half of the
    /// channel the `Profile`'s `MediaEngine` was spawned with.
    pub fn new(profile: Arc<Profile>, signaling: Arc<dyn SignalingAgent>, media_responses: mpsc::UnboundedReceiver<TaskResponse>) -> Self {
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        let table = Arc::new(SessionTable::new(profile, signaling, callback_tx));
        tokio::spawn(table::run_dispatcher(table.clone(), callback_rx, media_responses));
        Self { table }
    }

    /// Accept an offer for a brand-new session, generating its id
    /// (spec.md §3: "identified by a unique hex string ... generated on
    /// the first offer").
    pub async fn offer_new(&self, descriptor: SessionDescriptor) -> SessionId {
        let id = SessionId::generate();
        let handle = self.table.create_session(id.clone());
        handle.lock().await.offer(descriptor).await;
        id
    }

    /// Submit a follow-up offer (v1 resource add/remove, or a v2
    /// renegotiation) against an already-established session.
    pub async fn offer(&self, session_id: &SessionId, descriptor: SessionDescriptor) -> Result<()> {
        let handle = self.table.get(session_id)?;
        handle.lock().await.offer(descriptor).await;
        Ok(())
    }

    pub async fn control(&self, session_id: &SessionId, channel_id: Option<ChannelId>, message: MrcpMessage) -> Result<()> {
        let handle = self.table.get(session_id)?;
        handle.lock().await.control(channel_id, message).await;
        Ok(())
    }

    pub async fn terminate(&self, session_id: &SessionId) -> Result<()> {
        let handle = self.table.get(session_id)?;
        handle.lock().await.terminate().await;
        Ok(())
    }

    pub fn stats(&self) -> SessionTableStats {
        self.table.stats()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.table.session_ids()
    }
}
