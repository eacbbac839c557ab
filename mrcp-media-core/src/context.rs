//! C2 — Media Context: a fixed-capacity association matrix over
//! terminations, plus the C2 "Factory" ring that the media engine ticks
//! every frame.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::bridge::{ConnectionDiagnostic, MediaObject, NullBridge, TranscodingBridge};
use crate::error::{Error, Result};
use crate::termination::Termination;

/// Opaque payload carried alongside `ADD_TERMINATION`/`MODIFY_TERMINATION`
/// (spec.md §4.3): the local/remote socket the termination binds to. Media
/// core treats this as inert data — actual RTP I/O is out of scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationDescriptor {
    pub local_address: Option<SocketAddr>,
    pub remote_address: Option<SocketAddr>,
}

#[derive(Debug)]
struct HeaderRow {
    termination: Termination,
    descriptor: Option<TerminationDescriptor>,
    tx_count: usize,
    rx_count: usize,
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Per-session mixing matrix (spec.md §3 "Media context").
///
/// `matrix[i * capacity + j]` is the `on`/`off` bit for the directed
/// association `i -> j`. `headers[i]` is `None` for a free row/column.
#[derive(Debug)]
pub struct MediaContext {
    id: u64,
    capacity: usize,
    matrix: Vec<bool>,
    headers: Vec<Option<HeaderRow>>,
    count: usize,
    objects: Vec<Box<dyn MediaObject>>,
}

impl MediaContext {
    fn new(capacity: usize) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            matrix: vec![false; capacity * capacity],
            headers: (0..capacity).map(|_| None).collect(),
            count: 0,
            objects: Vec::new(),
        }
    }

    /// Process-wide unique id for this context.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Fixed capacity this context was created with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of terminations currently bound.
    pub fn count(&self) -> usize {
        self.count
    }

    /// True once every slot is free.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of materialised media-processing objects.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn cell(&self, i: usize, j: usize) -> bool {
        self.matrix[i * self.capacity + j]
    }

    fn set_cell(&mut self, i: usize, j: usize, on: bool) {
        self.matrix[i * self.capacity + j] = on;
    }

    /// Termination bound to `slot`, if any.
    pub fn termination(&self, slot: usize) -> Option<&Termination> {
        self.headers.get(slot).and_then(|h| h.as_ref()).map(|h| &h.termination)
    }

    /// `tx_count[i]` — number of associations with `i` as source.
    pub fn tx_count(&self, slot: usize) -> Option<usize> {
        self.headers.get(slot).and_then(|h| h.as_ref()).map(|h| h.tx_count)
    }

    /// `rx_count[j]` — number of associations with `j` as sink.
    pub fn rx_count(&self, slot: usize) -> Option<usize> {
        self.headers.get(slot).and_then(|h| h.as_ref()).map(|h| h.rx_count)
    }

    /// `add_termination(t)` — find the first free slot and bind it.
    pub fn add_termination(&mut self, mut termination: Termination) -> Result<usize> {
        let slot = self
            .headers
            .iter()
            .position(|h| h.is_none())
            .ok_or(Error::CapacityExhausted { capacity: self.capacity })?;

        termination.bind_slot(slot);
        self.headers[slot] = Some(HeaderRow {
            termination,
            descriptor: None,
            tx_count: 0,
            rx_count: 0,
        });
        self.count += 1;
        trace!(context = self.id, slot, "termination added");
        Ok(slot)
    }

    /// Attach/replace the descriptor (e.g. RTP local/remote address) on an
    /// already-bound slot (`MODIFY_TERMINATION`).
    pub fn modify_termination(&mut self, slot: usize, descriptor: TerminationDescriptor) -> Result<()> {
        let header = self
            .headers
            .get_mut(slot)
            .and_then(|h| h.as_mut())
            .ok_or(Error::UnknownTermination { slot })?;
        header.descriptor = Some(descriptor);
        Ok(())
    }

    /// `subtract_termination(t)` — clear row/column `slot`, unbind it, and
    /// return the termination.
    pub fn subtract_termination(&mut self, slot: usize) -> Result<Termination> {
        if self.headers.get(slot).map(|h| h.is_none()).unwrap_or(true) {
            return Err(Error::UnknownTermination { slot });
        }

        for j in 0..self.capacity {
            if self.cell(slot, j) {
                self.set_cell(slot, j, false);
                if let Some(h) = self.headers[j].as_mut() {
                    h.rx_count -= 1;
                }
            }
        }
        for i in 0..self.capacity {
            if self.cell(i, slot) {
                self.set_cell(i, slot, false);
                if let Some(h) = self.headers[i].as_mut() {
                    h.tx_count -= 1;
                }
            }
        }

        let mut header = self.headers[slot].take().expect("checked above");
        header.termination.unbind_slot();
        self.count -= 1;
        trace!(context = self.id, slot, "termination subtracted");
        Ok(header.termination)
    }

    fn direction_on(&self, source: usize, sink: usize) -> Result<bool> {
        if self.headers.get(source).map(|h| h.is_none()).unwrap_or(true) {
            return Err(Error::UnknownTermination { slot: source });
        }
        if self.headers.get(sink).map(|h| h.is_none()).unwrap_or(true) {
            return Err(Error::UnknownTermination { slot: sink });
        }
        Ok(self.cell(source, sink))
    }

    fn set_direction(&mut self, source: usize, sink: usize, on: bool) {
        self.set_cell(source, sink, on);
        if on {
            self.headers[source].as_mut().unwrap().tx_count += 1;
            self.headers[sink].as_mut().unwrap().rx_count += 1;
        } else {
            self.headers[source].as_mut().unwrap().tx_count -= 1;
            self.headers[sink].as_mut().unwrap().rx_count -= 1;
        }
    }

    /// `add_association(t1, t2)` — for each direction independently, turn
    /// the cell on if it is currently off and the source can receive while
    /// the sink can send (spec.md §4.2).
    ///
    /// Note the source/sink roles per direction: for `1 -> 2`, `t1` is the
    /// *sink* of the media the cell represents (it receives what `t2`
    /// sends)? spec.md phrases this the other way: "if ... the *source*'s
    /// stream mode contains `receive` and the *sink*'s stream mode
    /// contains `send`" — i.e. a directed cell `i -> j` models "j feeds
    /// audio into i", so the row `i` is where the signal arrives (must be
    /// able to `receive`) and the column `j` is where it originates (must
    /// be able to `send`). We keep that convention throughout.
    pub fn add_association(&mut self, slot1: usize, slot2: usize) -> Result<()> {
        for (source, sink) in [(slot1, slot2), (slot2, slot1)] {
            if self.direction_on(source, sink)? {
                continue;
            }
            let compatible = self.direction_compatible(source, sink);
            if compatible {
                self.set_direction(source, sink, true);
                trace!(context = self.id, source, sink, "association added");
            }
        }
        Ok(())
    }

    fn direction_compatible(&self, source: usize, sink: usize) -> bool {
        let source_mode = self.headers[source]
            .as_ref()
            .and_then(|h| h.termination.audio.as_ref())
            .map(|a| a.mode);
        let sink_mode = self.headers[sink]
            .as_ref()
            .and_then(|h| h.termination.audio.as_ref())
            .map(|a| a.mode);
        match (source_mode, sink_mode) {
            (Some(source_mode), Some(sink_mode)) => source_mode.can_receive() && sink_mode.can_send(),
            _ => false,
        }
    }

    /// `remove_association(t1, t2)` — symmetric to `add_association`: turn
    /// off any currently-on direction between the two slots.
    pub fn remove_association(&mut self, slot1: usize, slot2: usize) -> Result<()> {
        for (source, sink) in [(slot1, slot2), (slot2, slot1)] {
            if self.direction_on(source, sink)? {
                self.set_direction(source, sink, false);
                trace!(context = self.id, source, sink, "association removed");
            }
        }
        Ok(())
    }

    /// `reset_associations()` — clear every `on` cell, but only walk rows
    /// that actually carry associations (spec.md §4.2 optimisation).
    pub fn reset_associations(&mut self) {
        self.destroy_topology();
        for i in 0..self.capacity {
            let has_any = match &self.headers[i] {
                Some(h) if h.tx_count > 0 || h.rx_count > 0 => true,
                _ => false,
            };
            if !has_any {
                continue;
            }
            for j in 0..self.capacity {
                if self.cell(i, j) {
                    self.set_cell(i, j, false);
                    self.headers[i].as_mut().unwrap().tx_count -= 1;
                    if let Some(h) = self.headers[j].as_mut() {
                        h.rx_count -= 1;
                    }
                }
            }
        }
    }

    /// `apply_topology()` — destroy the current topology and materialise a
    /// fresh one from every `on` cell. Returns diagnostics for cells that
    /// were `on` but produced no processing object.
    pub fn apply_topology(&mut self) -> Vec<ConnectionDiagnostic> {
        self.destroy_topology();
        let mut diagnostics = Vec::new();
        for i in 0..self.capacity {
            if self.headers[i].is_none() {
                continue;
            }
            for j in 0..self.capacity {
                if !self.cell(i, j) {
                    continue;
                }
                let source = &self.headers[i].as_ref().unwrap().termination;
                let sink = &self.headers[j].as_ref().unwrap().termination;
                match build_connection(source, sink, i, j) {
                    (Some(object), None) => self.objects.push(object),
                    (None, Some(diag)) => {
                        warn!(context = self.id, %diag, "no media object for association");
                        diagnostics.push(diag);
                    }
                    _ => {}
                }
            }
        }
        debug!(context = self.id, objects = self.objects.len(), "topology applied");
        diagnostics
    }

    /// `destroy_topology()` — invoke `destroy` on every stored object and
    /// clear the list.
    pub fn destroy_topology(&mut self) {
        for mut object in self.objects.drain(..) {
            object.destroy();
        }
    }

    /// `process()` — invoke `process` on each stored object, in insertion
    /// order.
    pub fn process(&mut self) {
        for object in self.objects.iter_mut() {
            object.process();
        }
    }
}

/// Build the directed media-processing object from `source` to `sink`
/// (spec.md §4.2 "Connection construction"). Returns either the object or
/// a diagnostic, never both, and sometimes neither (silently-skipped
/// pairs are not reachable here since the caller only calls this for `on`
/// cells).
pub fn build_connection(
    source: &Termination,
    sink: &Termination,
    source_slot: usize,
    sink_slot: usize,
) -> (Option<Box<dyn MediaObject>>, Option<ConnectionDiagnostic>) {
    let (Some(source_stream), Some(sink_stream)) = (source.audio.as_ref(), sink.audio.as_ref()) else {
        return (
            None,
            Some(ConnectionDiagnostic::IncompatibleModes { source_slot, sink_slot }),
        );
    };
    if !source_stream.mode.can_receive() || !sink_stream.mode.can_send() {
        return (
            None,
            Some(ConnectionDiagnostic::IncompatibleModes { source_slot, sink_slot }),
        );
    }

    let (Some(source_codec), Some(sink_codec)) = (source_stream.codec.as_ref(), sink_stream.codec.as_ref()) else {
        return (
            None,
            Some(ConnectionDiagnostic::IncompatibleModes { source_slot, sink_slot }),
        );
    };

    if source_codec.matches(sink_codec) {
        return (Some(Box::new(NullBridge::new(source_slot, sink_slot))), None);
    }

    if source_codec.sampling_rate != sink_codec.sampling_rate {
        return (
            None,
            Some(ConnectionDiagnostic::SamplingRateMismatch {
                source_slot,
                sink_slot,
                source_rate: source_codec.sampling_rate,
                sink_rate: sink_codec.sampling_rate,
            }),
        );
    }

    let bridge = TranscodingBridge::new(source_slot, sink_slot, source_codec.can_decode, sink_codec.can_encode);
    (Some(Box::new(bridge)), None)
}

/// C2's "Factory": owns every currently-live context and the ring of
/// contexts with `count > 0`, which the media engine ticks every frame.
#[derive(Debug, Default)]
pub struct ContextFactory {
    contexts: HashMap<u64, MediaContext>,
    ring: Vec<u64>,
    default_capacity: usize,
}

impl ContextFactory {
    /// Create an empty factory. `default_capacity` is the capacity used by
    /// [`ContextFactory::create_context`]'s unsized variant; callers can
    /// always override it via [`ContextFactory::create_context_with_capacity`].
    pub fn new(default_capacity: usize) -> Self {
        Self {
            contexts: HashMap::new(),
            ring: Vec::new(),
            default_capacity,
        }
    }

    /// Create a new, empty context and register it (not yet linked into
    /// the ring since it has no terminations).
    pub fn create_context(&mut self) -> u64 {
        self.create_context_with_capacity(self.default_capacity)
    }

    /// As [`ContextFactory::create_context`] but with an explicit capacity.
    pub fn create_context_with_capacity(&mut self, capacity: usize) -> u64 {
        let ctx = MediaContext::new(capacity);
        let id = ctx.id();
        self.contexts.insert(id, ctx);
        id
    }

    /// Destroy a context outright, unlinking it from the ring if present.
    pub fn destroy_context(&mut self, context_id: u64) -> Option<MediaContext> {
        self.ring.retain(|id| *id != context_id);
        self.contexts.remove(&context_id)
    }

    /// Borrow a context, if it exists.
    pub fn get(&self, context_id: u64) -> Option<&MediaContext> {
        self.contexts.get(&context_id)
    }

    /// Mutably borrow a context, if it exists.
    pub fn get_mut(&mut self, context_id: u64) -> Option<&mut MediaContext> {
        self.contexts.get_mut(&context_id)
    }

    /// Number of contexts currently linked into the processing ring.
    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }

    fn sync_ring_membership(&mut self, context_id: u64) {
        let linked = self.ring.contains(&context_id);
        let should_link = self.contexts.get(&context_id).map(|c| c.count() > 0).unwrap_or(false);
        match (linked, should_link) {
            (false, true) => self.ring.push(context_id),
            (true, false) => self.ring.retain(|id| *id != context_id),
            _ => {}
        }
    }

    /// Add a termination to `context_id`'s matrix, linking the context
    /// into the ring if this is its first termination.
    pub fn add_termination(&mut self, context_id: u64, termination: Termination) -> Result<usize> {
        let ctx = self.get_mut(context_id).ok_or(Error::UnknownContext { context_id })?;
        let slot = ctx.add_termination(termination)?;
        self.sync_ring_membership(context_id);
        Ok(slot)
    }

    /// Subtract a termination, unlinking the context from the ring once
    /// empty.
    pub fn subtract_termination(&mut self, context_id: u64, slot: usize) -> Result<Termination> {
        let ctx = self.get_mut(context_id).ok_or(Error::UnknownContext { context_id })?;
        let t = ctx.subtract_termination(slot)?;
        self.sync_ring_membership(context_id);
        Ok(t)
    }

    /// `factory.process()` — iterate the ring in insertion order and call
    /// `context.process()` on each (spec.md §4.2 "Factory"). This is the
    /// media-frame tick driven by C3.
    pub fn process(&mut self) {
        for context_id in &self.ring {
            if let Some(ctx) = self.contexts.get_mut(context_id) {
                ctx.process();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::termination::{AudioStream, CodecDescriptor, StreamMode};

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

    fn sendrecv_termination(name: &str) -> Termination {
        Termination::with_audio(name, AudioStream::new(StreamMode::SEND_RECEIVE).with_codec(pcmu()))
    }

    #[test]
    fn add_subtract_round_trip_restores_membership_and_ring() {
        let mut factory = ContextFactory::new(5);
        let ctx_id = factory.create_context();
        assert_eq!(factory.ring_len(), 0);

        let slot = factory.add_termination(ctx_id, sendrecv_termination("a")).unwrap();
        assert_eq!(factory.ring_len(), 1);
        assert_eq!(factory.get(ctx_id).unwrap().count(), 1);

        factory.subtract_termination(ctx_id, slot).unwrap();
        assert_eq!(factory.ring_len(), 0);
        assert_eq!(factory.get(ctx_id).unwrap().count(), 0);
    }

    #[test]
    fn add_remove_association_round_trip_restores_counts() {
        let mut ctx = MediaContext::new(5);
        let a = ctx.add_termination(sendrecv_termination("a")).unwrap();
        let b = ctx.add_termination(sendrecv_termination("b")).unwrap();

        ctx.add_association(a, b).unwrap();
        assert_eq!(ctx.tx_count(a), Some(1));
        assert_eq!(ctx.rx_count(a), Some(1));
        assert_eq!(ctx.tx_count(b), Some(1));
        assert_eq!(ctx.rx_count(b), Some(1));

        ctx.remove_association(a, b).unwrap();
        assert_eq!(ctx.tx_count(a), Some(0));
        assert_eq!(ctx.rx_count(a), Some(0));
        assert_eq!(ctx.tx_count(b), Some(0));
        assert_eq!(ctx.rx_count(b), Some(0));
    }

    #[test]
    fn tx_rx_counts_match_matrix_sums() {
        let mut ctx = MediaContext::new(4);
        let a = ctx.add_termination(sendrecv_termination("a")).unwrap();
        let b = ctx.add_termination(sendrecv_termination("b")).unwrap();
        let c = ctx.add_termination(sendrecv_termination("c")).unwrap();

        ctx.add_association(a, b).unwrap();
        ctx.add_association(a, c).unwrap();

        for i in 0..ctx.capacity() {
            let tx: usize = (0..ctx.capacity()).filter(|&j| ctx.cell(i, j)).count();
            let rx: usize = (0..ctx.capacity()).filter(|&j| ctx.cell(j, i)).count();
            assert_eq!(ctx.tx_count(i).unwrap_or(0), tx);
            assert_eq!(ctx.rx_count(i).unwrap_or(0), rx);
        }
    }

    #[test]
    fn apply_then_destroy_topology_is_a_no_op_on_the_matrix() {
        let mut ctx = MediaContext::new(4);
        let a = ctx.add_termination(sendrecv_termination("a")).unwrap();
        let b = ctx.add_termination(sendrecv_termination("b")).unwrap();
        ctx.add_association(a, b).unwrap();

        let before = ctx.matrix.clone();
        let diagnostics = ctx.apply_topology();
        assert!(diagnostics.is_empty());
        assert_eq!(ctx.object_count(), 2);

        ctx.destroy_topology();
        assert_eq!(ctx.object_count(), 0);
        assert_eq!(ctx.matrix, before);
    }

    #[test]
    fn sampling_rate_mismatch_produces_diagnostic_and_no_object() {
        let mut ctx = MediaContext::new(4);
        let narrowband = sendrecv_termination("narrowband");
        let mut wideband_codec = pcmu();
        wideband_codec.sampling_rate = 16000;
        let wideband = Termination::with_audio(
            "wideband",
            AudioStream::new(StreamMode::SEND_RECEIVE).with_codec(wideband_codec),
        );

        let a = ctx.add_termination(narrowband).unwrap();
        let b = ctx.add_termination(wideband).unwrap();
        ctx.add_association(a, b).unwrap();

        let diagnostics = ctx.apply_topology();
        assert_eq!(diagnostics.len(), 1);
        assert!(matches!(diagnostics[0], ConnectionDiagnostic::SamplingRateMismatch { .. }));
        assert_eq!(ctx.object_count(), 0);
    }

    #[test]
    fn capacity_exhausted_is_reported() {
        let mut ctx = MediaContext::new(1);
        ctx.add_termination(sendrecv_termination("a")).unwrap();
        let err = ctx.add_termination(sendrecv_termination("b")).unwrap_err();
        assert_eq!(err, Error::CapacityExhausted { capacity: 1 });
    }
}
