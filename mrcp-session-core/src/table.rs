//! C8 — Session Table & Dispatcher: the process-wide `session-id ->
//! session` map, and the loop that demultiplexes asynchronous callbacks
//! from the media engine, connection agent, resource engines, and state
//! machines back onto the right session (spec.md §2, §5 "Signaling loop
//! ... owns sessions and the session table; sole mutator of session
//! state").

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use mrcp_media_core::TaskResponse;

use crate::callback::SessionCallback;
use crate::descriptor::SessionId;
use crate::error::{Result, SessionCoreError};
use crate::profile::Profile;
use crate::session::Session;
use crate::signaling::SignalingAgent;

/// Gateway-level visibility into how many sessions are currently live.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionTableStats {
    pub active_sessions: usize,
}

/// Process-wide registry of live sessions (spec.md §2 "C8 Session Table &
/// Dispatcher"). Each session is wrapped in its own `Mutex` so the
/// dispatcher loop can hold the table's `DashMap` lock only long enough to
/// clone a handle, never while awaiting inside a session's async methods.
pub struct SessionTable {
    sessions: DashMap<SessionId, Arc<Mutex<Session>>>,
    profile: Arc<Profile>,
    signaling: Arc<dyn SignalingAgent>,
    callback_tx: mpsc::UnboundedSender<SessionCallback>,
}

impl SessionTable {
    pub fn new(profile: Arc<Profile>, signaling: Arc<dyn SignalingAgent>, callback_tx: mpsc::UnboundedSender<SessionCallback>) -> Self {
        Self {
            sessions: DashMap::new(),
            profile,
            signaling,
            callback_tx,
        }
    }

    /// Register a freshly generated session id. `offer()` calls this
    /// itself the first time a session is seen (spec.md §4.1 step 1
    /// "register it in C8"); exposed separately so tests and adapters that
    /// already know the id (e.g. replaying a v1 `terminate` by id) can
    /// register ahead of the first offer.
    pub fn create_session(&self, id: SessionId) -> Arc<Mutex<Session>> {
        let session = Arc::new(Mutex::new(Session::new(
            id.clone(),
            self.profile.clone(),
            self.signaling.clone(),
            self.callback_tx.clone(),
        )));
        self.sessions.insert(id, session.clone());
        session
    }

    pub fn get(&self, id: &SessionId) -> Result<Arc<Mutex<Session>>> {
        self.sessions.get(id).map(|entry| entry.clone()).ok_or_else(|| SessionCoreError::SessionNotFound(id.clone()))
    }

    pub fn remove(&self, id: &SessionId) {
        self.sessions.remove(id);
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn stats(&self) -> SessionTableStats {
        SessionTableStats { active_sessions: self.sessions.len() }
    }
}

/// Drains the shared [`SessionCallback`] channel and the media engine's
/// [`TaskResponse`] channel, routing each item to its session by id
/// (spec.md §5 design note: "Callback vtables ... should become tagged
/// message variants sent across channels between loops"). Runs as one
/// tokio task for the lifetime of the process.
pub async fn run_dispatcher(
    table: Arc<SessionTable>,
    mut callbacks: mpsc::UnboundedReceiver<SessionCallback>,
    mut media_responses: mpsc::UnboundedReceiver<TaskResponse>,
) {
    loop {
        tokio::select! {
            callback = callbacks.recv() => {
                let Some(callback) = callback else { break };
                dispatch_callback(&table, callback).await;
            }
            response = media_responses.recv() => {
                let Some(response) = response else { break };
                dispatch_media_response(&table, response).await;
            }
        }
    }
}

async fn dispatch_callback(table: &SessionTable, callback: SessionCallback) {
    let id = SessionId::from_str_unchecked(callback.session_id());
    let Ok(handle) = table.get(&id) else {
        warn!(session = %id, "callback for unknown session, dropping");
        return;
    };
    let terminated = {
        let mut session = handle.lock().await;
        session.handle_callback(callback).await;
        session.is_terminated()
    };
    if terminated {
        table.remove(&id);
    }
}

async fn dispatch_media_response(table: &SessionTable, response: TaskResponse) {
    let id = SessionId::from_str_unchecked(response.session_id.clone());
    let Ok(handle) = table.get(&id) else {
        warn!(session = %id, "media response for unknown session, dropping");
        return;
    };
    let terminated = {
        let mut session = handle.lock().await;
        session.handle_callback(SessionCallback::Media(response)).await;
        session.is_terminated()
    };
    if terminated {
        table.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ConnectionAgent, ResourceEngine};
    use crate::descriptor::MrcpVersion;
    use crate::message::MrcpMessage;
    use crate::profile::ProfileBuilder;
    use crate::rtp::RtpTerminationFactory;
    use crate::state_machine::{GenericStateMachine, ResourceStateMachine};
    use async_trait::async_trait;
    use mrcp_media_core::{MediaEngine, Termination};
    use std::time::Duration;

    struct NoopAgent;
    #[async_trait]
    impl ConnectionAgent for NoopAgent {
        async fn modify(&self, _: SessionId, _: crate::callback::ChannelId, _: u64, _: String, _: mpsc::UnboundedSender<SessionCallback>) -> bool {
            true
        }
        async fn remove(&self, _: SessionId, _: crate::callback::ChannelId, _: u64, _: mpsc::UnboundedSender<SessionCallback>) -> bool {
            true
        }
    }

    struct NoopEngine;
    #[async_trait]
    impl ResourceEngine for NoopEngine {
        async fn open_channel(&self, _: SessionId, _: crate::callback::ChannelId, _: u64, _: mpsc::UnboundedSender<SessionCallback>) -> bool {
            true
        }
        async fn close_channel(&self, _: SessionId, _: crate::callback::ChannelId, _: u64, _: mpsc::UnboundedSender<SessionCallback>) -> bool {
            true
        }
        fn create_termination(&self, resource_name: &str) -> Termination {
            Termination::new(resource_name)
        }
        fn create_state_machine(
            &self,
            session_id: SessionId,
            channel_id: crate::callback::ChannelId,
            callbacks: mpsc::UnboundedSender<SessionCallback>,
            version: MrcpVersion,
        ) -> Arc<dyn ResourceStateMachine> {
            Arc::new(GenericStateMachine::new(session_id, channel_id, callbacks, "RESOURCE-COMPLETE", version))
        }
        async fn request_process(&self, _: crate::callback::ChannelId, _: MrcpMessage) {}
    }

    struct NoopRtpFactory;
    #[async_trait]
    impl RtpTerminationFactory for NoopRtpFactory {
        async fn allocate(
            &self,
            _: SessionId,
            _: &crate::descriptor::MediaSlotDescriptor,
            _: &[mrcp_media_core::CodecDescriptor],
        ) -> Option<(Termination, mrcp_media_core::TerminationDescriptor)> {
            None
        }
    }

    #[tokio::test]
    async fn unknown_session_callback_is_dropped_without_panicking() {
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let engine = MediaEngine::spawn(Duration::from_millis(20), resp_tx);
        let profile = Arc::new(
            ProfileBuilder::new()
                .with_resource("speechrecog", Arc::new(NoopEngine))
                .with_connection_agent(Arc::new(NoopAgent))
                .with_media_engine(engine)
                .with_rtp_termination_factory(Arc::new(NoopRtpFactory))
                .build(),
        );
        let (cb_tx, cb_rx) = mpsc::unbounded_channel();
        let table = Arc::new(SessionTable::new(profile, Arc::new(NoTrafficSignaling), cb_tx));

        let dispatcher = tokio::spawn(run_dispatcher(table.clone(), cb_rx, resp_rx));

        // No session registered under this id; dispatch must not panic.
        let ghost = SessionId::from_str_unchecked("0000000000000000");
        dispatch_callback(
            &table,
            SessionCallback::StateMachineDeactivated { session_id: ghost, channel_id: 0 },
        )
        .await;

        assert_eq!(table.stats().active_sessions, 0);
        dispatcher.abort();
    }

    struct NoTrafficSignaling;
    #[async_trait]
    impl SignalingAgent for NoTrafficSignaling {
        async fn answer(&self, _: SessionId, _: crate::descriptor::SessionDescriptor) {}
        async fn terminate_response(&self, _: SessionId) {}
        async fn control_response(&self, _: SessionId, _: MrcpMessage) {}
    }
}
