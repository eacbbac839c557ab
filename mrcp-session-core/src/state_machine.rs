//! Per-resource MRCP state machine (spec.md §4.1 "State machine").
//!
//! One instance per [`crate::channel::MrcpChannel`], created by the
//! resource plugin behind [`crate::channel::ResourceEngine`]. The
//! orchestrator never inspects its internal states (IDLE / SPEAKING /
//! RECOGNIZING / ...) — those are resource-specific. It only ever calls
//! [`ResourceStateMachine::on_client_request`], `on_engine_message`, and
//! `deactivate`, and reacts to the two callbacks the state machine emits
//! back (`on_dispatch`, `on_deactivate`), carried as [`SessionCallback`]
//! variants.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::callback::{ChannelId, SessionCallback};
use crate::descriptor::SessionId;
use crate::message::MrcpMessage;

/// The coarse state every `GenericStateMachine` tracks. Concrete resource
/// plugins are expected to carry far richer internal state (pending
/// requests, in-progress events, per-method transitions); this generic
/// implementation only tracks enough to drive the scenarios in spec.md §8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenericState {
    Idle,
    InProgress,
}

/// The orchestrator-facing contract every per-resource state machine
/// implements (spec.md §4.1).
pub trait ResourceStateMachine: Send + Sync {
    /// Feed an inbound client request into the state machine. Eventually
    /// results in a `StateMachineDispatch` callback carrying a `Request`
    /// message, which the orchestrator forwards to the engine channel.
    fn on_client_request(&self, message: MrcpMessage);

    /// Feed a response/event produced by the resource engine back through
    /// the state machine. Eventually results in a `StateMachineDispatch`
    /// callback carrying a `Response`/`Event` message, which the
    /// orchestrator forwards to the client.
    fn on_engine_message(&self, message: MrcpMessage);

    /// Begin deactivation. A resource with a request in progress
    /// synthesizes its final event first (spec.md §8 scenario 5); either
    /// way this eventually results in a `StateMachineDeactivated` callback.
    fn deactivate(&self);

    /// Current coarse state, exposed for tests/diagnostics.
    fn state(&self) -> GenericState;
}

/// A reference state machine sufficient to drive every scenario in
/// spec.md §8: single pending request at a time, a final event
/// synthesized on deactivation mid-request.
pub struct GenericStateMachine {
    session_id: SessionId,
    channel_id: ChannelId,
    callbacks: mpsc::UnboundedSender<SessionCallback>,
    final_event_name: String,
    in_progress: AtomicBool,
    last_request_version: Mutex<crate::descriptor::MrcpVersion>,
}

impl GenericStateMachine {
    /// Build a state machine bound to one channel. `final_event_name` is
    /// the resource-specific completion event synthesized on deactivation
    /// (e.g. `RECOGNITION-COMPLETE` for a recognizer, `SPEAK-COMPLETE` for
    /// a synthesizer).
    pub fn new(
        session_id: SessionId,
        channel_id: ChannelId,
        callbacks: mpsc::UnboundedSender<SessionCallback>,
        final_event_name: impl Into<String>,
        version: crate::descriptor::MrcpVersion,
    ) -> Self {
        Self {
            session_id,
            channel_id,
            callbacks,
            final_event_name: final_event_name.into(),
            in_progress: AtomicBool::new(false),
            last_request_version: Mutex::new(version),
        }
    }

    fn dispatch(&self, message: MrcpMessage) {
        let _ = self.callbacks.send(SessionCallback::StateMachineDispatch {
            session_id: self.session_id.clone(),
            channel_id: self.channel_id,
            message,
        });
    }
}

impl ResourceStateMachine for GenericStateMachine {
    fn on_client_request(&self, message: MrcpMessage) {
        *self.last_request_version.lock().unwrap() = message.version;
        self.in_progress.store(true, Ordering::SeqCst);
        self.dispatch(message);
    }

    fn on_engine_message(&self, message: MrcpMessage) {
        if !message.is_event() {
            self.in_progress.store(false, Ordering::SeqCst);
        }
        self.dispatch(message);
    }

    fn deactivate(&self) {
        if self.in_progress.swap(false, Ordering::SeqCst) {
            let version = *self.last_request_version.lock().unwrap();
            let event = MrcpMessage::event(version, 0, self.final_event_name.clone());
            self.dispatch(event);
        }
        let _ = self.callbacks.send(SessionCallback::StateMachineDeactivated {
            session_id: self.session_id.clone(),
            channel_id: self.channel_id,
        });
    }

    fn state(&self) -> GenericState {
        if self.in_progress.load(Ordering::SeqCst) {
            GenericState::InProgress
        } else {
            GenericState::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::MrcpVersion;
    use crate::message::MrcpMessageKind;

    #[tokio::test]
    async fn deactivate_mid_request_synthesizes_final_event_before_completing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sm = GenericStateMachine::new(
            SessionId::from_str_unchecked("abc123"),
            0,
            tx,
            "RECOGNITION-COMPLETE",
            MrcpVersion::V2,
        );

        sm.on_client_request(MrcpMessage::request(MrcpVersion::V2, 1, "RECOGNIZE"));
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, SessionCallback::StateMachineDispatch { .. }));
        assert_eq!(sm.state(), GenericState::InProgress);

        sm.deactivate();

        let event = rx.recv().await.unwrap();
        match event {
            SessionCallback::StateMachineDispatch { message, .. } => {
                assert_eq!(message.kind, MrcpMessageKind::Event("RECOGNITION-COMPLETE".into()));
            }
            other => panic!("expected dispatch, got {other:?}"),
        }

        let deactivated = rx.recv().await.unwrap();
        assert!(matches!(deactivated, SessionCallback::StateMachineDeactivated { .. }));
    }

    #[tokio::test]
    async fn deactivate_while_idle_completes_immediately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sm = GenericStateMachine::new(
            SessionId::from_str_unchecked("abc123"),
            0,
            tx,
            "SPEAK-COMPLETE",
            MrcpVersion::V2,
        );

        sm.deactivate();
        let only = rx.recv().await.unwrap();
        assert!(matches!(only, SessionCallback::StateMachineDeactivated { .. }));
    }
}
