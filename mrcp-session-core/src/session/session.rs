//! C7 — Session Orchestrator: the per-session state machine that accepts
//! signaling operations, fans sub-requests out across the media engine,
//! connection agent, and resource engines, and answers once every
//! outstanding sub-request has completed (spec.md §4.1).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use mrcp_media_core::{Termination, TaskOutcome, TaskResponse, TerminationDescriptor};

use crate::callback::{ChannelId, SessionCallback};
use crate::channel::{EngineChannel, MrcpChannel};
use crate::descriptor::{MediaSlotDescriptor, MrcpVersion, ResourceState, SessionDescriptor, SessionId, SessionStatus};
use crate::message::MrcpMessage;
use crate::profile::Profile;
use crate::session::state::{PendingRequests, SessionState};
use crate::signaling::SignalingAgent;
use crate::rtp::RtpTerminationSlot;

use mrcp_media_core::TaskMessage;

/// One queued or in-flight signaling operation (spec.md §4.1's four
/// inbound operations, minus the asynchronous-completion ones which never
/// go through the queue).
#[derive(Debug, Clone)]
enum SignalingRequest {
    Offer(SessionDescriptor),
    Control { channel_id: Option<ChannelId>, message: MrcpMessage },
    Terminate,
}

/// Which in-flight add this `TaskResponse`'s command id belongs to, so the
/// orchestrator can finish wiring the termination once its context row is
/// known (context row assignment always crosses the media-engine loop
/// boundary, so it can never be read back synchronously).
#[derive(Debug, Clone, Copy)]
enum ContextOpTarget {
    ChannelTermination(ChannelId),
    RtpSlot(usize),
}

/// The per-session orchestrator (spec.md §3 "Session").
pub struct Session {
    id: SessionId,
    profile: Arc<Profile>,
    signaling: Arc<dyn SignalingAgent>,
    callback_tx: mpsc::UnboundedSender<SessionCallback>,

    context_id: Option<u64>,
    channels: Vec<MrcpChannel>,
    rtp_slots: Vec<RtpTerminationSlot>,

    queue: VecDeque<SignalingRequest>,
    active_request: Option<SignalingRequest>,

    offer: Option<SessionDescriptor>,
    answer: Option<SessionDescriptor>,

    task_buffer: Vec<TaskMessage>,
    pending: PendingRequests,
    pending_context_ops: HashMap<u64, ContextOpTarget>,
    /// Command id issued for each channel's `deactivate()` call, so
    /// `on_state_machine_deactivate` (which carries no command id of its
    /// own) can find the right one to complete.
    deactivating_commands: HashMap<ChannelId, u64>,
    /// `(channel termination slot, rtp termination slot)` pairs already
    /// associated during the current offer — cleared on every
    /// `RESET_ASSOCIATIONS`, so re-running the same offer twice
    /// re-associates everything rather than silently skipping it.
    associated: HashSet<(usize, usize)>,
    /// Set once `APPLY_TOPOLOGY` has been issued for the offer currently
    /// being answered, so [`Session::on_counter_drained`] knows to issue
    /// it exactly once the rest of the offer's sub-requests — including
    /// associations queued reactively once a termination's context row
    /// becomes known — have drained, rather than racing it against them.
    topology_issued: bool,

    state: SessionState,
    terminated: bool,
}

impl Session {
    pub fn new(
        id: SessionId,
        profile: Arc<Profile>,
        signaling: Arc<dyn SignalingAgent>,
        callback_tx: mpsc::UnboundedSender<SessionCallback>,
    ) -> Self {
        Self {
            id,
            profile,
            signaling,
            callback_tx,
            context_id: None,
            channels: Vec::new(),
            rtp_slots: Vec::new(),
            queue: VecDeque::new(),
            active_request: None,
            offer: None,
            answer: None,
            task_buffer: Vec::new(),
            pending: PendingRequests::new(),
            pending_context_ops: HashMap::new(),
            deactivating_commands: HashMap::new(),
            associated: HashSet::new(),
            topology_issued: false,
            state: SessionState::None,
            terminated: false,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True once `terminate_response` has shipped — the C8 dispatcher uses
    /// this to know when it is safe to drop the session from the table.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn session_id_string(&self) -> String {
        self.id.as_str().to_string()
    }

    fn next_command_id(&mut self) -> u64 {
        self.pending.issue()
    }

    // ---- inbound operations (spec.md §4.1 "Public contract") ----

    pub async fn offer(&mut self, descriptor: SessionDescriptor) {
        self.submit(SignalingRequest::Offer(descriptor)).await;
    }

    pub async fn control(&mut self, channel_id: Option<ChannelId>, message: MrcpMessage) {
        self.submit(SignalingRequest::Control { channel_id, message }).await;
    }

    /// `terminate` is idempotent: a session already winding down ignores a
    /// repeat (spec.md §5 "Cancellation & timeouts").
    pub async fn terminate(&mut self) {
        if matches!(self.state, SessionState::Deactivating | SessionState::Terminating) {
            return;
        }
        self.submit(SignalingRequest::Terminate).await;
    }

    async fn submit(&mut self, request: SignalingRequest) {
        if self.active_request.is_some() {
            self.queue.push_back(request);
            return;
        }
        self.active_request = Some(request.clone());
        self.dispatch(request).await;
    }

    async fn dispatch(&mut self, request: SignalingRequest) {
        match request {
            SignalingRequest::Offer(descriptor) => self.run_offer(descriptor).await,
            SignalingRequest::Control { channel_id, message } => self.run_control(channel_id, message).await,
            SignalingRequest::Terminate => self.run_terminate().await,
        }
    }

    async fn pop_and_dispatch_next(&mut self) {
        self.active_request = None;
        if let Some(next) = self.queue.pop_front() {
            self.active_request = Some(next.clone());
            self.dispatch(next).await;
        }
    }

    fn flush_tasks(&mut self) {
        if self.task_buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.task_buffer);
        self.profile.media_engine.send(batch);
    }

    // ---- offer processing (spec.md §4.1 "Offer processing") ----

    async fn run_offer(&mut self, descriptor: SessionDescriptor) {
        // Step 1.
        if self.context_id.is_none() {
            let context_id = self.profile.media_engine.create_context(self.profile.context_capacity).await;
            self.context_id = Some(context_id);
        }
        let context_id = self.context_id.expect("just ensured above");

        // Step 2.
        let mut answer = descriptor.answer_template();

        // Step 3.
        self.state = SessionState::Answering;
        self.topology_issued = false;

        // Step 4.
        self.associated.clear();
        let command_id = self.next_command_id();
        self.task_buffer.push(TaskMessage::ResetAssociations {
            context_id,
            command_id,
            session_id: self.session_id_string(),
        });

        // Step 5.
        match descriptor.version {
            MrcpVersion::V1 => self.run_offer_v1(&descriptor, &mut answer, context_id).await,
            MrcpVersion::V2 => self.run_offer_v2(&descriptor, &mut answer, context_id).await,
        }

        // Step 6.
        self.run_audio_media_processing(&descriptor, &mut answer, context_id).await;

        // Step 6b. Video isn't bridged (spec.md §1 Non-goal); every offered
        // video slot is rejected outright so the answer still satisfies §3's
        // "each slot becomes non-null... or an explicit rejection" invariant.
        self.reject_video_slots(&descriptor, &mut answer);

        // Step 7.
        self.flush_tasks();

        self.offer = Some(descriptor);
        self.answer = Some(answer);

        // Step 8. `APPLY_TOPOLOGY` is deferred to `on_counter_drained`: any
        // association implied by a termination added in this same offer can
        // only be queued once that termination's context row comes back
        // (possibly asynchronously), so topology must not be applied until
        // the whole batch — including those reactive associations — drains.
        self.on_counter_drained().await;
    }

    async fn run_offer_v1(&mut self, descriptor: &SessionDescriptor, answer: &mut SessionDescriptor, context_id: u64) {
        if descriptor.resource_state != ResourceState::Add {
            return;
        }
        let resource_name = descriptor.resource_name.clone();
        if self.channels.iter().any(|c| c.resource_name == resource_name) {
            // Open Question resolved per spec.md §9: repeated offers of an
            // already-open resource are idempotent.
            return;
        }
        // v1 has no cmid/mid grouping of its own (that's a v2 control-connection
        // concept); fold its one control leg and one audio leg onto cmid 0, the
        // same default `add_new_rtp_slot` gives an audio slot with no `mid`.
        let offer_control_slot = descriptor.control.first().cloned().flatten();
        self.create_and_open_channel(&resource_name, Some(0), context_id, 0, offer_control_slot, answer).await;
    }

    async fn run_offer_v2(&mut self, descriptor: &SessionDescriptor, answer: &mut SessionDescriptor, context_id: u64) {
        for (idx, entry) in descriptor.control_media_arr.iter().enumerate() {
            if idx < self.channels.len() {
                let offer_control_slot = descriptor.control.get(idx).cloned().flatten();
                self.reconcile_existing_channel(idx, entry.resource_name.clone(), offer_control_slot, answer).await;
            } else {
                let offer_control_slot = descriptor.control.get(idx).cloned().flatten();
                self.create_new_v2_channel(idx, entry.resource_name.clone(), entry.cmid, context_id, offer_control_slot, answer)
                    .await;
            }
        }
    }

    async fn reconcile_existing_channel(
        &mut self,
        channel_idx: usize,
        resource_name: String,
        offer_control_slot: Option<MediaSlotDescriptor>,
        answer: &mut SessionDescriptor,
    ) {
        // The answer is indexed by SDP position (`channel.id`), not by
        // `channel_idx` (the channel's position in `self.channels`) — they
        // diverge once an earlier offer entry failed synchronously without
        // ever pushing a channel.
        let answer_idx = self.channels[channel_idx].id;
        if self.channels[channel_idx].resource_name != resource_name {
            // Resource reassigned on an existing position: treat as unacceptable
            // rather than silently rebind an established engine channel.
            self.set_slot_status(answer, answer_idx, SessionStatus::UnacceptableResource);
            return;
        }
        if self.channels[channel_idx].control_channel.is_none() {
            return;
        }
        let command_id = self.next_command_id();
        let accepted = self.channels[channel_idx]
            .control_channel
            .as_ref()
            .unwrap()
            .modify(self.id.clone(), command_id, resource_name, self.callback_tx.clone())
            .await;
        if !accepted {
            self.pending.complete(command_id);
            self.set_slot_status(answer, answer_idx, SessionStatus::UnacceptableResource);
        } else if answer_idx < answer.control.len() {
            answer.control[answer_idx] = offer_control_slot;
        }
    }

    async fn create_new_v2_channel(
        &mut self,
        answer_idx: usize,
        resource_name: String,
        cmid: Option<u32>,
        context_id: u64,
        offer_control_slot: Option<MediaSlotDescriptor>,
        answer: &mut SessionDescriptor,
    ) {
        let Some(channel_id) = self
            .create_and_open_channel(&resource_name, cmid, context_id, answer_idx, offer_control_slot, answer)
            .await
        else {
            return;
        };
        let agent = self.profile.connection_agent.clone();
        let command_id = self.next_command_id();
        let accepted = agent.modify(self.id.clone(), channel_id, command_id, resource_name, self.callback_tx.clone()).await;
        if accepted {
            self.channels[channel_id].control_channel = Some(crate::channel::ControlChannel::new(agent, channel_id));
        } else {
            self.pending.complete(command_id);
            self.set_slot_status(answer, answer_idx, SessionStatus::UnacceptableResource);
        }
    }

    /// Shared v1/v2 path: look the resource up, create its channel, open
    /// its engine channel, and submit its termination to the context
    /// (spec.md §4.1 step 5). Returns the new channel's id on success.
    ///
    /// Optimistically accepts `answer.control[control_idx]` (echoing the
    /// offered slot, the way an SDP answer confirms a media line) as soon
    /// as the resource and its engine are known to exist; any later
    /// synchronous or asynchronous failure overwrites that slot with an
    /// explicit rejection via [`Session::set_slot_status`] or
    /// [`Session::on_engine_channel_open`], so the slot is never left
    /// `None` by the time the answer ships (spec.md §3 invariant).
    async fn create_and_open_channel(
        &mut self,
        resource_name: &str,
        cmid: Option<u32>,
        context_id: u64,
        control_idx: usize,
        offer_control_slot: Option<MediaSlotDescriptor>,
        answer: &mut SessionDescriptor,
    ) -> Option<ChannelId> {
        if !self.profile.resource_factory.contains_key(resource_name) {
            answer.status = SessionStatus::NoSuchResource;
            if control_idx < answer.control.len() {
                answer.control[control_idx] = Some(MediaSlotDescriptor::rejected("TCP/TLS/MRCPv2"));
            }
            return None;
        }
        let Some(engine) = self.profile.engine_table.get(resource_name).cloned() else {
            answer.status = SessionStatus::UnacceptableResource;
            if control_idx < answer.control.len() {
                answer.control[control_idx] = Some(MediaSlotDescriptor::rejected("TCP/TLS/MRCPv2"));
            }
            return None;
        };

        let channel_id = self.channels.len();
        // `channel.id` is the SDP position (`control_idx`), not the vec
        // index `channel_id` — they diverge once an earlier offer entry
        // fails synchronously above without ever pushing a channel.
        let mut channel = MrcpChannel::new(self.id.clone(), resource_name, control_idx, cmid);

        let state_machine = engine.create_state_machine(self.id.clone(), channel_id, self.callback_tx.clone(), MrcpVersion::V2);
        channel.state_machine = Some(state_machine);
        self.channels.push(channel);

        if control_idx < answer.control.len() {
            answer.control[control_idx] = offer_control_slot.or_else(|| {
                let mut slot = MediaSlotDescriptor::rejected("TCP/TLS/MRCPv2");
                slot.port = 1;
                slot.resource_name = Some(resource_name.to_string());
                Some(slot)
            });
        }

        let open_command_id = self.next_command_id();
        let opened = engine.open_channel(self.id.clone(), channel_id, open_command_id, self.callback_tx.clone()).await;
        if !opened {
            self.pending.complete(open_command_id);
            self.set_slot_status(answer, control_idx, SessionStatus::UnavailableResource);
        }

        let termination = engine.create_termination(resource_name);
        let add_command_id = self.next_command_id();
        self.pending_context_ops.insert(add_command_id, ContextOpTarget::ChannelTermination(channel_id));
        self.task_buffer.push(TaskMessage::AddTermination {
            context_id,
            command_id: add_command_id,
            session_id: self.session_id_string(),
            termination,
            descriptor: None,
        });

        Some(channel_id)
    }

    /// Reject every offered video slot; video isn't bridged, so the only way
    /// to resolve a video position is an explicit port-0 rejection rather
    /// than accepting and never opening anything for it.
    fn reject_video_slots(&mut self, descriptor: &SessionDescriptor, answer: &mut SessionDescriptor) {
        for (idx, slot) in descriptor.video.iter().enumerate() {
            let Some(slot) = slot else { continue };
            if idx < answer.video.len() {
                answer.video[idx] = Some(MediaSlotDescriptor::rejected(slot.protocol.clone()));
            }
        }
    }

    async fn run_audio_media_processing(&mut self, descriptor: &SessionDescriptor, answer: &mut SessionDescriptor, context_id: u64) {
        let existing_count = self.rtp_slots.len();
        for (idx, slot) in descriptor.audio.iter().enumerate() {
            let Some(slot) = slot else { continue };
            if idx < existing_count {
                self.modify_existing_rtp_slot(idx, slot.protocol.clone(), context_id, answer, idx);
                self.associate_channels_for_rtp_slot(idx);
            } else {
                self.add_new_rtp_slot(slot, context_id, answer, idx).await;
            }
        }
    }

    /// A re-offer against an already-established RTP leg: issue
    /// `MODIFY_TERMINATION` and echo the slot's already-negotiated codec
    /// and socket back into the answer (spec.md §4.1 step 6).
    fn modify_existing_rtp_slot(&mut self, slot_idx: usize, protocol: String, context_id: u64, answer: &mut SessionDescriptor, answer_idx: usize) {
        let command_id = self.next_command_id();
        let rtp = &self.rtp_slots[slot_idx];
        let context_row = rtp.context_row;
        let accepted_slot = build_accepted_audio_slot(protocol, rtp.cmid, &rtp.termination, &rtp.descriptor);
        if answer_idx < answer.audio.len() {
            answer.audio[answer_idx] = Some(accepted_slot);
        }
        self.task_buffer.push(TaskMessage::ModifyTermination {
            context_id,
            command_id,
            session_id: self.session_id_string(),
            slot: context_row,
            descriptor: TerminationDescriptor::default(),
        });
    }

    async fn add_new_rtp_slot(&mut self, slot: &MediaSlotDescriptor, context_id: u64, answer: &mut SessionDescriptor, answer_idx: usize) {
        let offered_codecs: Vec<_> = slot.codec.iter().cloned().collect();
        let Some((termination, descriptor)) = self.profile.rtp_termination_factory.allocate(self.id.clone(), slot, &offered_codecs).await
        else {
            if answer_idx < answer.audio.len() {
                answer.audio[answer_idx] = Some(MediaSlotDescriptor::rejected(slot.protocol.clone()));
            }
            return;
        };

        let cmid = slot.mid.unwrap_or(0);
        if answer_idx < answer.audio.len() {
            answer.audio[answer_idx] = Some(build_accepted_audio_slot(slot.protocol.clone(), Some(cmid), &termination, &descriptor));
        }

        let rtp_idx = self.rtp_slots.len();
        self.rtp_slots.push(RtpTerminationSlot::new(cmid, termination.clone(), descriptor.clone(), usize::MAX));

        let command_id = self.next_command_id();
        self.pending_context_ops.insert(command_id, ContextOpTarget::RtpSlot(rtp_idx));
        self.task_buffer.push(TaskMessage::AddTermination {
            context_id,
            command_id,
            session_id: self.session_id_string(),
            termination,
            descriptor: Some(descriptor),
        });
    }

    /// Issue `ADD_ASSOCIATION` for every channel/RTP-slot pair sharing a
    /// `cmid`, once both sides' context rows are known. Safe to call
    /// repeatedly — already-associated pairs are skipped via `associated`.
    fn associate_channels_for_rtp_slot(&mut self, rtp_idx: usize) {
        let context_id = match self.context_id {
            Some(id) => id,
            None => return,
        };
        let rtp = &self.rtp_slots[rtp_idx];
        if rtp.context_row == usize::MAX {
            return;
        }
        let rtp_row = rtp.context_row;
        let cmid = rtp.cmid;

        let matches: Vec<usize> = self
            .channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.cmid == Some(cmid) && c.engine_channel.is_some())
            .map(|(i, _)| i)
            .collect();

        for channel_idx in matches {
            let channel_slot = self.channels[channel_idx].engine_channel.as_ref().unwrap().termination_slot();
            if !self.associated.insert((channel_slot, rtp_row)) {
                continue;
            }
            let command_id = self.next_command_id();
            self.task_buffer.push(TaskMessage::AddAssociation {
                context_id,
                command_id,
                session_id: self.session_id_string(),
                slot_a: channel_slot,
                slot_b: rtp_row,
            });
        }
    }

    fn associate_rtp_slots_for_channel(&mut self, channel_id: ChannelId) {
        let context_id = match self.context_id {
            Some(id) => id,
            None => return,
        };
        let Some(cmid) = self.channels[channel_id].cmid else { return };
        let Some(channel_slot) = self.channels[channel_id].engine_channel.as_ref().map(|ec| ec.termination_slot()) else {
            return;
        };

        let matches: Vec<usize> = self
            .rtp_slots
            .iter()
            .enumerate()
            .filter(|(_, r)| r.cmid == cmid && r.context_row != usize::MAX)
            .map(|(i, _)| i)
            .collect();

        for rtp_idx in matches {
            let rtp_row = self.rtp_slots[rtp_idx].context_row;
            if !self.associated.insert((channel_slot, rtp_row)) {
                continue;
            }
            let command_id = self.next_command_id();
            self.task_buffer.push(TaskMessage::AddAssociation {
                context_id,
                command_id,
                session_id: self.session_id_string(),
                slot_a: channel_slot,
                slot_b: rtp_row,
            });
        }
    }

    fn set_slot_status(&mut self, answer: &mut SessionDescriptor, idx: usize, status: SessionStatus) {
        answer.status = status;
        if idx < answer.control.len() {
            answer.control[idx] = Some(MediaSlotDescriptor::rejected("TCP/TLS/MRCPv2"));
        }
    }

    async fn finish_offer(&mut self) {
        self.state = SessionState::None;
        self.offer = None;
        if let Some(answer) = self.answer.take() {
            self.signaling.answer(self.id.clone(), answer).await;
        }
        self.pop_and_dispatch_next().await;
    }

    // ---- control-message routing (spec.md §4.1 "Control-message routing") ----

    async fn run_control(&mut self, channel_id: Option<ChannelId>, message: MrcpMessage) {
        let resolved = match channel_id {
            Some(id) => Some(id),
            None => self.find_channel_by_resource_name_hint(&message),
        };

        let Some(channel_id) = resolved else {
            warn!(session = %self.id, "control message with no resolvable channel, dropping");
            self.pop_and_dispatch_next().await;
            return;
        };

        let has_state_machine = self.channels.get(channel_id).map(|c| c.state_machine.is_some()).unwrap_or(false);

        if !has_state_machine {
            warn!(session = %self.id, channel_id, "control message for channel without a state machine, dropping");
            self.pop_and_dispatch_next().await;
            return;
        }

        let state_machine = self.channels[channel_id].state_machine.clone().unwrap();
        state_machine.on_client_request(message);
        // The dispatch and eventual pop-next happen via `on_state_machine_dispatch`
        // once the state machine calls back with the forwarded message.
    }

    /// A control message without an explicit channel id names its resource
    /// in an MRCP header in a real gateway; this crate does not parse MRCP
    /// headers (that lives in the signaling adapter), so callers normally
    /// supply `channel_id` directly. Kept as a narrow fallback for a
    /// single-channel session.
    fn find_channel_by_resource_name_hint(&self, _message: &MrcpMessage) -> Option<ChannelId> {
        if self.channels.len() == 1 {
            Some(0)
        } else {
            None
        }
    }

    async fn on_state_machine_dispatch(&mut self, channel_id: ChannelId, message: MrcpMessage) {
        let Some(channel) = self.channels.get(channel_id) else { return };

        if message.is_request() {
            if let Some(engine_channel) = channel.engine_channel.as_ref() {
                engine_channel.request_process(message).await;
            }
            return;
        }

        self.signaling.control_response(self.id.clone(), message.clone()).await;

        if !message.is_event() {
            self.pop_and_dispatch_next().await;
        }
    }

    // ---- terminate handling (spec.md §4.1 "Terminate handling") ----

    async fn run_terminate(&mut self) {
        self.state = SessionState::Deactivating;
        for idx in 0..self.channels.len() {
            let Some(state_machine) = self.channels[idx].state_machine.clone() else { continue };
            let command_id = self.next_command_id();
            self.deactivating_commands.insert(idx, command_id);
            state_machine.deactivate();
        }
        if self.pending.is_empty() {
            self.finish_deactivating().await;
        }
    }

    async fn finish_deactivating(&mut self) {
        self.state = SessionState::Terminating;
        let Some(context_id) = self.context_id else {
            self.finish_terminate().await;
            return;
        };

        let command_id = self.next_command_id();
        self.task_buffer.push(TaskMessage::ResetAssociations {
            context_id,
            command_id,
            session_id: self.session_id_string(),
        });

        for idx in 0..self.channels.len() {
            if let Some(control_channel) = self.channels[idx].control_channel.take() {
                let command_id = self.next_command_id();
                let accepted = control_channel.remove(self.id.clone(), command_id, self.callback_tx.clone()).await;
                if !accepted {
                    self.pending.complete(command_id);
                }
            }
            if let Some(engine_channel) = self.channels[idx].engine_channel.take() {
                let command_id = self.next_command_id();
                self.task_buffer.push(TaskMessage::SubtractTermination {
                    context_id,
                    command_id,
                    session_id: self.session_id_string(),
                    slot: engine_channel.termination_slot(),
                });

                let close_command_id = self.next_command_id();
                let closed = engine_channel.close(self.id.clone(), close_command_id, self.callback_tx.clone()).await;
                if !closed {
                    self.pending.complete(close_command_id);
                }
            }
        }

        for rtp_slot in &self.rtp_slots {
            if rtp_slot.context_row == usize::MAX {
                continue;
            }
            let command_id = self.next_command_id();
            self.task_buffer.push(TaskMessage::SubtractTermination {
                context_id,
                command_id,
                session_id: self.session_id_string(),
                slot: rtp_slot.context_row,
            });
        }

        self.flush_tasks();

        if self.pending.is_empty() {
            self.finish_terminate().await;
        }
    }

    async fn finish_terminate(&mut self) {
        self.channels.clear();
        self.rtp_slots.clear();
        self.signaling.terminate_response(self.id.clone()).await;
        self.terminated = true;
        debug!(session = %self.id, "terminate_response sent");
    }

    // ---- asynchronous callback handlers (spec.md §4.1 last bullet) ----

    pub async fn handle_callback(&mut self, callback: SessionCallback) {
        match callback {
            SessionCallback::Media(response) => self.on_media_response(response).await,
            SessionCallback::ChannelModified { channel_id, command_id, accepted, .. } => {
                self.on_channel_modify(channel_id, command_id, accepted).await;
            }
            SessionCallback::ChannelRemoved { command_id, .. } => {
                self.on_channel_remove(command_id).await;
            }
            SessionCallback::EngineChannelOpened { channel_id, command_id, opened, .. } => {
                self.on_engine_channel_open(channel_id, command_id, opened).await;
            }
            SessionCallback::EngineChannelClosed { command_id, .. } => {
                self.on_engine_channel_close(command_id).await;
            }
            SessionCallback::StateMachineDispatch { channel_id, message, .. } => {
                self.on_state_machine_dispatch(channel_id, message).await;
            }
            SessionCallback::StateMachineDeactivated { channel_id, .. } => {
                self.on_state_machine_deactivate(channel_id).await;
            }
        }
    }

    async fn on_media_response(&mut self, response: TaskResponse) {
        let command_id = response.command_id;
        match response.outcome {
            TaskOutcome::TerminationAdded(Ok(slot)) => {
                if let Some(target) = self.pending_context_ops.remove(&command_id) {
                    self.finish_termination_added(target, slot).await;
                }
            }
            TaskOutcome::TerminationAdded(Err(err)) => {
                warn!(session = %self.id, %err, "termination add failed");
                if let Some(answer) = self.answer.as_mut() {
                    answer.status = SessionStatus::UnavailableResource;
                }
            }
            TaskOutcome::TerminationModified(Err(err)) => {
                warn!(session = %self.id, %err, "termination modify failed");
            }
            TaskOutcome::TerminationSubtracted(Err(err)) => {
                warn!(session = %self.id, %err, "termination subtract failed");
            }
            TaskOutcome::AssociationAdded(Err(err)) => {
                warn!(session = %self.id, %err, "association add failed");
            }
            TaskOutcome::AssociationRemoved(Err(err)) => {
                warn!(session = %self.id, %err, "association remove failed");
            }
            _ => {}
        }

        self.pending.complete(command_id);
        self.on_counter_drained().await;
    }

    async fn finish_termination_added(&mut self, target: ContextOpTarget, slot: usize) {
        match target {
            ContextOpTarget::ChannelTermination(channel_id) => {
                let Some(channel) = self.channels.get_mut(channel_id) else { return };
                let resource_name = channel.resource_name.clone();
                if let (Some(engine), Some(state_machine)) =
                    (self.profile.engine_table.get(&resource_name).cloned(), channel.state_machine.clone())
                {
                    channel.engine_channel = Some(EngineChannel::new(engine, channel_id, slot, state_machine));
                }
                self.associate_rtp_slots_for_channel(channel_id);
            }
            ContextOpTarget::RtpSlot(rtp_idx) => {
                if let Some(rtp_slot) = self.rtp_slots.get_mut(rtp_idx) {
                    rtp_slot.context_row = slot;
                }
                self.associate_channels_for_rtp_slot(rtp_idx);
            }
        }
        // Associations above were only buffered; a termination's context row
        // can become known well after the offer's initial batch already
        // shipped, so send them now rather than waiting on a later flush.
        self.flush_tasks();
    }

    async fn on_channel_modify(&mut self, channel_id: ChannelId, command_id: u64, accepted: bool) {
        if !accepted {
            // `channel_id` is the vec index; the answer is indexed by the
            // channel's SDP position (`channel.id`), which diverges from
            // the vec index once an earlier offer entry failed
            // synchronously without ever pushing a channel.
            let answer_idx = self.channels.get(channel_id).map(|c| c.id);
            if let Some(answer_idx) = answer_idx {
                if let Some(mut answer) = self.answer.take() {
                    self.set_slot_status(&mut answer, answer_idx, SessionStatus::UnacceptableResource);
                    self.answer = Some(answer);
                }
            }
        }
        self.pending.complete(command_id);
        self.on_counter_drained().await;
    }

    async fn on_channel_remove(&mut self, command_id: u64) {
        self.pending.complete(command_id);
        self.on_counter_drained().await;
    }

    async fn on_engine_channel_open(&mut self, channel_id: ChannelId, command_id: u64, opened: bool) {
        if !opened {
            let answer_idx = self.channels.get(channel_id).map(|c| c.id);
            if let Some(answer_idx) = answer_idx {
                if let Some(mut answer) = self.answer.take() {
                    self.set_slot_status(&mut answer, answer_idx, SessionStatus::UnavailableResource);
                    self.answer = Some(answer);
                }
            }
        }
        self.pending.complete(command_id);
        self.on_counter_drained().await;
    }

    async fn on_engine_channel_close(&mut self, command_id: u64) {
        self.pending.complete(command_id);
        self.on_counter_drained().await;
    }

    async fn on_state_machine_deactivate(&mut self, channel_id: ChannelId) {
        if let Some(command_id) = self.deactivating_commands.remove(&channel_id) {
            self.pending.complete(command_id);
        }
        self.on_counter_drained().await;
    }

    async fn on_counter_drained(&mut self) {
        if !self.pending.is_empty() {
            return;
        }
        match self.state {
            SessionState::Answering => {
                if !self.topology_issued {
                    self.topology_issued = true;
                    let context_id = self.context_id.expect("context exists while answering");
                    let command_id = self.next_command_id();
                    self.task_buffer.push(TaskMessage::ApplyTopology {
                        context_id,
                        command_id,
                        session_id: self.session_id_string(),
                    });
                    self.flush_tasks();
                } else {
                    self.finish_offer().await;
                }
            }
            SessionState::Deactivating => self.finish_deactivating().await,
            SessionState::Terminating => self.finish_terminate().await,
            _ => {}
        }
    }
}

/// Build an accepted audio slot for an RTP leg: the negotiated codec and
/// mode come off the termination itself, the port off the socket the
/// factory bound (spec.md §8 scenario 1 "answer audio slot has a local IP
/// and a port allocated by the RTP factory").
fn build_accepted_audio_slot(
    protocol: String,
    cmid: Option<u32>,
    termination: &Termination,
    descriptor: &TerminationDescriptor,
) -> MediaSlotDescriptor {
    let port = descriptor.local_address.map(|addr| addr.port()).unwrap_or(0);
    let (codec, mode) = match termination.audio.as_ref() {
        Some(audio) => (audio.codec.clone(), Some(audio.mode)),
        None => (None, None),
    };
    MediaSlotDescriptor {
        port,
        protocol,
        resource_name: None,
        cmid: None,
        mid: cmid,
        codec,
        mode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use mrcp_media_core::{AudioStream, CodecDescriptor, MediaEngine, StreamMode};

    use crate::channel::{ConnectionAgent, ResourceEngine};
    use crate::profile::ProfileBuilder;
    use crate::rtp::RtpTerminationFactory;
    use crate::state_machine::GenericStateMachine;

    fn pcmu() -> CodecDescriptor {
        CodecDescriptor {
            media_type: "audio".into(),
            sampling_rate: 8000,
            channels: 1,
            encoding_name: "PCMU".into(),
            can_decode: true,
            can_encode: true,
        }
    }

    /// A connection agent that answers synchronously for this test's
    /// purposes — speechrecog's v1 path never calls it, it exists only so
    /// `ProfileBuilder::build` has one to hand out.
    struct ImmediateAgent;
    #[async_trait]
    impl ConnectionAgent for ImmediateAgent {
        async fn modify(&self, _: SessionId, _: ChannelId, _: u64, _: String, _: mpsc::UnboundedSender<SessionCallback>) -> bool {
            true
        }
        async fn remove(&self, _: SessionId, _: ChannelId, _: u64, _: mpsc::UnboundedSender<SessionCallback>) -> bool {
            true
        }
    }

    /// A resource engine that actually completes asynchronously: it
    /// returns `true` to signal the request was accepted, then posts the
    /// matching callback itself, the same shape a real plugin's own task
    /// would produce.
    struct ImmediateEngine;
    #[async_trait]
    impl ResourceEngine for ImmediateEngine {
        async fn open_channel(
            &self,
            session_id: SessionId,
            channel_id: ChannelId,
            command_id: u64,
            callbacks: mpsc::UnboundedSender<SessionCallback>,
        ) -> bool {
            let _ = callbacks.send(SessionCallback::EngineChannelOpened {
                session_id,
                channel_id,
                command_id,
                opened: true,
            });
            true
        }
        async fn close_channel(
            &self,
            session_id: SessionId,
            channel_id: ChannelId,
            command_id: u64,
            callbacks: mpsc::UnboundedSender<SessionCallback>,
        ) -> bool {
            let _ = callbacks.send(SessionCallback::EngineChannelClosed { session_id, channel_id, command_id });
            true
        }
        fn create_termination(&self, resource_name: &str) -> Termination {
            Termination::with_audio(resource_name, AudioStream::new(StreamMode::RECEIVE).with_codec(pcmu()))
        }
        fn create_state_machine(
            &self,
            session_id: SessionId,
            channel_id: ChannelId,
            callbacks: mpsc::UnboundedSender<SessionCallback>,
            version: MrcpVersion,
        ) -> Arc<dyn crate::state_machine::ResourceStateMachine> {
            Arc::new(GenericStateMachine::new(session_id, channel_id, callbacks, "RECOGNITION-COMPLETE", version))
        }
        async fn request_process(&self, _: ChannelId, _: MrcpMessage) {}
    }

    /// Allocates a termination with the same PCMU codec the offer carries
    /// and a bound local socket, so `apply_topology` finds the two sides
    /// mode-compatible and builds a real bridge.
    struct ImmediateRtpFactory;
    #[async_trait]
    impl RtpTerminationFactory for ImmediateRtpFactory {
        async fn allocate(
            &self,
            _: SessionId,
            _: &MediaSlotDescriptor,
            _: &[CodecDescriptor],
        ) -> Option<(Termination, TerminationDescriptor)> {
            let termination = Termination::with_audio("rtp", AudioStream::new(StreamMode::SEND_RECEIVE).with_codec(pcmu()));
            let descriptor = TerminationDescriptor {
                local_address: Some("127.0.0.1:43210".parse::<SocketAddr>().unwrap()),
                remote_address: None,
            };
            Some((termination, descriptor))
        }
    }

    /// Captures whatever answer the orchestrator ships, so the test can
    /// block on it without a full signaling-adapter stand-in.
    struct CapturingSignaling {
        answer: StdMutex<Option<SessionDescriptor>>,
    }
    #[async_trait]
    impl SignalingAgent for CapturingSignaling {
        async fn answer(&self, _: SessionId, answer: SessionDescriptor) {
            *self.answer.lock().unwrap() = Some(answer);
        }
        async fn terminate_response(&self, _: SessionId) {}
        async fn control_response(&self, _: SessionId, _: MrcpMessage) {}
    }

    fn v1_offer() -> SessionDescriptor {
        SessionDescriptor {
            version: MrcpVersion::V1,
            resource_name: "speechrecog".into(),
            resource_state: ResourceState::Add,
            status: SessionStatus::Ok,
            control: vec![Some(MediaSlotDescriptor {
                port: 1,
                protocol: "RTSP".into(),
                resource_name: Some("speechrecog".into()),
                cmid: None,
                mid: None,
                codec: None,
                mode: None,
            })],
            audio: vec![Some(MediaSlotDescriptor {
                port: 20000,
                protocol: "RTP/AVP".into(),
                resource_name: None,
                cmid: None,
                mid: None,
                codec: Some(pcmu()),
                mode: Some(StreamMode::SEND_RECEIVE),
            })],
            video: vec![],
            origin: "- 0 0 IN IP4 127.0.0.1".into(),
            bind_ip: "127.0.0.1".parse().unwrap(),
            external_ip: None,
            control_media_arr: vec![],
        }
    }

    /// Drives one `v1` offer (one recognizer channel plus one RTP leg,
    /// spec.md §8 scenario 1) through a real `MediaEngine`, pumping both the
    /// media-response and session-callback channels until an answer ships.
    /// This is exactly the path where the association between the
    /// engine-channel termination and the RTP termination can only be
    /// queued once the engine-channel's `AddTermination` response (an
    /// asynchronous completion) reports its context row — the case the
    /// `topology_issued` deferral exists for.
    #[tokio::test]
    async fn v1_offer_associates_before_topology_is_applied() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("mrcp_session_core=debug,mrcp_media_core=debug")
            .try_init();

        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        let engine = MediaEngine::spawn(Duration::from_millis(10), resp_tx);
        let profile = Arc::new(
            ProfileBuilder::new()
                .with_resource("speechrecog", Arc::new(ImmediateEngine))
                .with_connection_agent(Arc::new(ImmediateAgent))
                .with_media_engine(engine)
                .with_rtp_termination_factory(Arc::new(ImmediateRtpFactory))
                .build(),
        );
        let (cb_tx, mut cb_rx) = mpsc::unbounded_channel();
        let signaling = Arc::new(CapturingSignaling { answer: StdMutex::new(None) });

        let session = Arc::new(Mutex::new(Session::new(
            SessionId::from_str_unchecked("0123456789abcdef"),
            profile,
            signaling.clone(),
            cb_tx,
        )));

        {
            let mut guard = session.lock().await;
            guard.offer(v1_offer()).await;
        }

        loop {
            if signaling.answer.lock().unwrap().is_some() {
                break;
            }
            tokio::select! {
                Some(response) = resp_rx.recv() => {
                    session.lock().await.handle_callback(SessionCallback::Media(response)).await;
                }
                Some(callback) = cb_rx.recv() => {
                    session.lock().await.handle_callback(callback).await;
                }
                else => panic!("both channels closed before an answer shipped"),
            }
        }

        let answer = signaling.answer.lock().unwrap().take().expect("answer captured");
        assert_eq!(answer.status, SessionStatus::Ok);
        assert!(answer.all_slots_resolved());
        let audio_slot = answer.audio[0].as_ref().expect("audio slot resolved");
        assert_ne!(audio_slot.port, 0, "RTP leg should be accepted, not rejected");
        assert_eq!(audio_slot.codec, Some(pcmu()));
    }
}
