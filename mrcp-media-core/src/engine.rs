//! C3 — Media Engine: a single-threaded cooperative component that
//! receives batched task messages from any session and applies them on
//! its own task, ticking the context factory between batches.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::bridge::ConnectionDiagnostic;
use crate::context::{ContextFactory, TerminationDescriptor};
use crate::error::{Error, Result};
use crate::termination::Termination;

/// Opaque identifier the caller attaches to a [`TaskMessage`] so the
/// matching [`TaskResponse`] can be correlated back to the sub-request
/// that issued it (spec.md §9's "sub-request" futures).
pub type CommandId = u64;

/// One item of a batch submitted to the media engine (spec.md §4.3).
/// Every item carries the context it targets, the session that should
/// receive the eventual response, and a caller-chosen command id.
#[derive(Debug)]
pub enum TaskMessage {
    AddTermination {
        context_id: u64,
        command_id: CommandId,
        session_id: String,
        termination: Termination,
        descriptor: Option<TerminationDescriptor>,
    },
    ModifyTermination {
        context_id: u64,
        command_id: CommandId,
        session_id: String,
        slot: usize,
        descriptor: TerminationDescriptor,
    },
    SubtractTermination {
        context_id: u64,
        command_id: CommandId,
        session_id: String,
        slot: usize,
    },
    AddAssociation {
        context_id: u64,
        command_id: CommandId,
        session_id: String,
        slot_a: usize,
        slot_b: usize,
    },
    RemoveAssociation {
        context_id: u64,
        command_id: CommandId,
        session_id: String,
        slot_a: usize,
        slot_b: usize,
    },
    ResetAssociations {
        context_id: u64,
        command_id: CommandId,
        session_id: String,
    },
    ApplyTopology {
        context_id: u64,
        command_id: CommandId,
        session_id: String,
    },
    DestroyTopology {
        context_id: u64,
        command_id: CommandId,
        session_id: String,
    },
}

impl TaskMessage {
    fn session_id(&self) -> &str {
        match self {
            TaskMessage::AddTermination { session_id, .. }
            | TaskMessage::ModifyTermination { session_id, .. }
            | TaskMessage::SubtractTermination { session_id, .. }
            | TaskMessage::AddAssociation { session_id, .. }
            | TaskMessage::RemoveAssociation { session_id, .. }
            | TaskMessage::ResetAssociations { session_id, .. }
            | TaskMessage::ApplyTopology { session_id, .. }
            | TaskMessage::DestroyTopology { session_id, .. } => session_id,
        }
    }

    fn command_id(&self) -> CommandId {
        match self {
            TaskMessage::AddTermination { command_id, .. }
            | TaskMessage::ModifyTermination { command_id, .. }
            | TaskMessage::SubtractTermination { command_id, .. }
            | TaskMessage::AddAssociation { command_id, .. }
            | TaskMessage::RemoveAssociation { command_id, .. }
            | TaskMessage::ResetAssociations { command_id, .. }
            | TaskMessage::ApplyTopology { command_id, .. }
            | TaskMessage::DestroyTopology { command_id, .. } => *command_id,
        }
    }
}

/// Reply to exactly one [`TaskMessage`], carrying the same `command_id`
/// and `session_id` so the receiving session (found via its own
/// `session_id`, spec.md §4.3 "found via `context.obj`") can decrement
/// its sub-request counter for the right request.
#[derive(Debug)]
pub struct TaskResponse {
    pub context_id: u64,
    pub command_id: CommandId,
    pub session_id: String,
    pub outcome: TaskOutcome,
}

#[derive(Debug)]
pub enum TaskOutcome {
    TerminationAdded(Result<usize>),
    TerminationModified(Result<()>),
    TerminationSubtracted(Result<()>),
    AssociationAdded(Result<()>),
    AssociationRemoved(Result<()>),
    AssociationsReset,
    TopologyApplied(Vec<ConnectionDiagnostic>),
    TopologyDestroyed,
}

enum EngineCommand {
    CreateContext {
        capacity: usize,
        reply: oneshot::Sender<u64>,
    },
    DestroyContext {
        context_id: u64,
        reply: oneshot::Sender<()>,
    },
    Submit(Vec<TaskMessage>),
}

/// Handle to a running media engine. Cheap to clone; every clone shares
/// the same background task and context factory.
#[derive(Clone)]
pub struct MediaEngine {
    commands: mpsc::UnboundedSender<EngineCommand>,
}

impl MediaEngine {
    /// Spawn the engine's background task. `tick_period` is the fixed-rate
    /// media-frame timer (spec.md §4.3); `responses` receives one
    /// [`TaskResponse`] per processed [`TaskMessage`], in submission
    /// order, for the C8 dispatcher to demultiplex by `session_id`.
    pub fn spawn(tick_period: Duration, responses: mpsc::UnboundedSender<TaskResponse>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, responses, tick_period));
        Self { commands: tx }
    }

    /// Create a new context with the given capacity. Context creation is
    /// not part of the `TaskMessage` batch protocol (spec.md §4.3 lists
    /// only matrix/topology ops) — it is a management call, but it is
    /// still only ever applied on the engine's own task, preserving "sole
    /// mutator of those structures" (spec.md §5).
    pub async fn create_context(&self, capacity: usize) -> u64 {
        let (reply, rx) = oneshot::channel();
        let _ = self.commands.send(EngineCommand::CreateContext { capacity, reply });
        rx.await.expect("media engine task dropped reply channel")
    }

    /// Destroy a context outright (used when a session tears down).
    pub async fn destroy_context(&self, context_id: u64) {
        let (reply, rx) = oneshot::channel();
        let _ = self.commands.send(EngineCommand::DestroyContext { context_id, reply });
        let _ = rx.await;
    }

    /// `send(batch)` — submit a heterogeneous, ordered batch of task
    /// messages. Responses arrive on the `responses` channel given to
    /// [`MediaEngine::spawn`], in the same order (spec.md §5 "Ordering
    /// guarantees").
    pub fn send(&self, batch: Vec<TaskMessage>) {
        if batch.is_empty() {
            return;
        }
        if self.commands.send(EngineCommand::Submit(batch)).is_err() {
            error!("media engine task is gone, dropping batch");
        }
    }
}

async fn run(
    mut commands: mpsc::UnboundedReceiver<EngineCommand>,
    responses: mpsc::UnboundedSender<TaskResponse>,
    tick_period: Duration,
) {
    let mut factory = ContextFactory::new(5);
    let mut interval = tokio::time::interval(tick_period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                factory.process();
            }
            command = commands.recv() => {
                match command {
                    Some(EngineCommand::CreateContext { capacity, reply }) => {
                        let id = factory.create_context_with_capacity(capacity);
                        debug!(context = id, capacity, "context created");
                        let _ = reply.send(id);
                    }
                    Some(EngineCommand::DestroyContext { context_id, reply }) => {
                        factory.destroy_context(context_id);
                        debug!(context = context_id, "context destroyed");
                        let _ = reply.send(());
                    }
                    Some(EngineCommand::Submit(batch)) => {
                        for message in batch {
                            let response = apply(&mut factory, message);
                            if responses.send(response).is_err() {
                                error!("response receiver dropped, stopping media engine");
                                return;
                            }
                        }
                    }
                    None => return,
                }
            }
        }
    }
}

fn apply(factory: &mut ContextFactory, message: TaskMessage) -> TaskResponse {
    let session_id = message.session_id().to_string();
    let command_id = message.command_id();
    let context_id = context_id_of(&message);

    let outcome = match message {
        TaskMessage::AddTermination {
            context_id,
            termination,
            descriptor,
            ..
        } => {
            let result = factory.add_termination(context_id, termination);
            if let (Ok(slot), Some(descriptor)) = (&result, descriptor) {
                if let Some(ctx) = factory.get_mut(context_id) {
                    let _ = ctx.modify_termination(*slot, descriptor);
                }
            }
            TaskOutcome::TerminationAdded(result)
        }
        TaskMessage::ModifyTermination {
            context_id, slot, descriptor, ..
        } => {
            let result = factory
                .get_mut(context_id)
                .ok_or(Error::UnknownContext { context_id })
                .and_then(|ctx| ctx.modify_termination(slot, descriptor));
            TaskOutcome::TerminationModified(result)
        }
        TaskMessage::SubtractTermination { context_id, slot, .. } => {
            let result = factory.subtract_termination(context_id, slot).map(|_| ());
            TaskOutcome::TerminationSubtracted(result)
        }
        TaskMessage::AddAssociation {
            context_id, slot_a, slot_b, ..
        } => {
            let result = factory
                .get_mut(context_id)
                .ok_or(Error::UnknownContext { context_id })
                .and_then(|ctx| ctx.add_association(slot_a, slot_b));
            TaskOutcome::AssociationAdded(result)
        }
        TaskMessage::RemoveAssociation {
            context_id, slot_a, slot_b, ..
        } => {
            let result = factory
                .get_mut(context_id)
                .ok_or(Error::UnknownContext { context_id })
                .and_then(|ctx| ctx.remove_association(slot_a, slot_b));
            TaskOutcome::AssociationRemoved(result)
        }
        TaskMessage::ResetAssociations { context_id, .. } => {
            if let Some(ctx) = factory.get_mut(context_id) {
                ctx.reset_associations();
            }
            TaskOutcome::AssociationsReset
        }
        TaskMessage::ApplyTopology { context_id, .. } => {
            let diagnostics = factory.get_mut(context_id).map(|ctx| ctx.apply_topology()).unwrap_or_default();
            TaskOutcome::TopologyApplied(diagnostics)
        }
        TaskMessage::DestroyTopology { context_id, .. } => {
            if let Some(ctx) = factory.get_mut(context_id) {
                ctx.destroy_topology();
            }
            TaskOutcome::TopologyDestroyed
        }
    };

    TaskResponse {
        context_id,
        command_id,
        session_id,
        outcome,
    }
}

fn context_id_of(message: &TaskMessage) -> u64 {
    match message {
        TaskMessage::AddTermination { context_id, .. }
        | TaskMessage::ModifyTermination { context_id, .. }
        | TaskMessage::SubtractTermination { context_id, .. }
        | TaskMessage::AddAssociation { context_id, .. }
        | TaskMessage::RemoveAssociation { context_id, .. }
        | TaskMessage::ResetAssociations { context_id, .. }
        | TaskMessage::ApplyTopology { context_id, .. }
        | TaskMessage::DestroyTopology { context_id, .. } => *context_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::termination::{AudioStream, CodecDescriptor, StreamMode};

    fn pcmu_termination(name: &str) -> Termination {
        Termination::with_audio(
            name,
            AudioStream::new(StreamMode::SEND_RECEIVE).with_codec(CodecDescriptor {
                media_type: "audio".into(),
                sampling_rate: 8000,
                channels: 1,
                encoding_name: "PCMU".into(),
                can_decode: true,
                can_encode: true,
            }),
        )
    }

    #[tokio::test]
    async fn add_termination_and_apply_topology_round_trip() {
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        let engine = MediaEngine::spawn(Duration::from_millis(20), resp_tx);
        let ctx_id = engine.create_context(5).await;

        engine.send(vec![
            TaskMessage::AddTermination {
                context_id: ctx_id,
                command_id: 1,
                session_id: "sess-1".into(),
                termination: pcmu_termination("a"),
                descriptor: None,
            },
            TaskMessage::AddTermination {
                context_id: ctx_id,
                command_id: 2,
                session_id: "sess-1".into(),
                termination: pcmu_termination("b"),
                descriptor: None,
            },
        ]);

        let r1 = resp_rx.recv().await.unwrap();
        let r2 = resp_rx.recv().await.unwrap();
        let slot_a = match r1.outcome {
            TaskOutcome::TerminationAdded(Ok(slot)) => slot,
            other => panic!("unexpected outcome: {other:?}"),
        };
        let slot_b = match r2.outcome {
            TaskOutcome::TerminationAdded(Ok(slot)) => slot,
            other => panic!("unexpected outcome: {other:?}"),
        };

        engine.send(vec![
            TaskMessage::AddAssociation {
                context_id: ctx_id,
                command_id: 3,
                session_id: "sess-1".into(),
                slot_a,
                slot_b,
            },
            TaskMessage::ApplyTopology {
                context_id: ctx_id,
                command_id: 4,
                session_id: "sess-1".into(),
            },
        ]);

        let r3 = resp_rx.recv().await.unwrap();
        assert!(matches!(r3.outcome, TaskOutcome::AssociationAdded(Ok(()))));

        let r4 = resp_rx.recv().await.unwrap();
        match r4.outcome {
            TaskOutcome::TopologyApplied(diagnostics) => assert!(diagnostics.is_empty()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_context_surfaces_as_error_response() {
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        let engine = MediaEngine::spawn(Duration::from_millis(20), resp_tx);

        engine.send(vec![TaskMessage::AddAssociation {
            context_id: 9999,
            command_id: 1,
            session_id: "sess-1".into(),
            slot_a: 0,
            slot_b: 1,
        }]);

        let response = resp_rx.recv().await.unwrap();
        match response.outcome {
            TaskOutcome::AssociationAdded(Err(Error::UnknownContext { context_id })) => {
                assert_eq!(context_id, 9999)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
