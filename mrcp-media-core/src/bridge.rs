//! Media-processing objects materialised by
//! [`crate::context::MediaContext::apply_topology`].
//!
//! Actual frame codecs/DSP are out of scope (spec.md §1 Non-goals); these
//! objects only model the *shape* of the processing graph — which
//! termination feeds which, and whether a decode/encode step sits between
//! them — and expose the `process`/`destroy` lifecycle the factory ring
//! drives every tick.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A materialised directed connection between two termination slots.
///
/// Built by [`crate::context::build_connection`] for every `on` matrix
/// cell whose endpoints are mode-compatible.
pub trait MediaObject: fmt::Debug + Send {
    /// Advance this connection by one media frame. Called once per tick
    /// by [`crate::context::ContextFactory::process`], in the order the
    /// objects were inserted into the context (spec.md §4.2 `process`).
    fn process(&mut self);

    /// Release any resources this object holds. Called once, right
    /// before the object is dropped from the context's object list.
    fn destroy(&mut self) {}

    /// Row (source) this connection reads from.
    fn source_slot(&self) -> usize;

    /// Column (sink) this connection writes to.
    fn sink_slot(&self) -> usize;
}

/// Direct frame copy: source and sink negotiated byte-for-byte identical
/// codecs, so no transcoding is needed (spec.md §4.2 step 2).
#[derive(Debug)]
pub struct NullBridge {
    source_slot: usize,
    sink_slot: usize,
    frames_forwarded: u64,
}

impl NullBridge {
    /// Build a null bridge between two bound slots.
    pub fn new(source_slot: usize, sink_slot: usize) -> Self {
        Self {
            source_slot,
            sink_slot,
            frames_forwarded: 0,
        }
    }

    /// Frames forwarded since construction, exposed for tests/metrics.
    pub fn frames_forwarded(&self) -> u64 {
        self.frames_forwarded
    }
}

impl MediaObject for NullBridge {
    fn process(&mut self) {
        self.frames_forwarded += 1;
    }

    fn source_slot(&self) -> usize {
        self.source_slot
    }

    fn sink_slot(&self) -> usize {
        self.sink_slot
    }
}

/// Source and sink share a sampling rate but differ in encoding; a
/// decoder is inserted in front of the source (if its codec defines
/// `decode`) and an encoder after the sink (if its codec defines
/// `encode`), per spec.md §4.2 step 4.
#[derive(Debug)]
pub struct TranscodingBridge {
    source_slot: usize,
    sink_slot: usize,
    has_decode_stage: bool,
    has_encode_stage: bool,
    frames_transcoded: u64,
}

impl TranscodingBridge {
    /// Build a transcoding bridge. `has_decode_stage`/`has_encode_stage`
    /// record whether the source/sink codec actually exposed the
    /// corresponding transform — a bridge with neither stage still
    /// forwards raw frames, it just doesn't transform them.
    pub fn new(source_slot: usize, sink_slot: usize, has_decode_stage: bool, has_encode_stage: bool) -> Self {
        Self {
            source_slot,
            sink_slot,
            has_decode_stage,
            has_encode_stage,
            frames_transcoded: 0,
        }
    }

    /// Whether a decode stage runs in front of the source.
    pub fn has_decode_stage(&self) -> bool {
        self.has_decode_stage
    }

    /// Whether an encode stage runs after the sink.
    pub fn has_encode_stage(&self) -> bool {
        self.has_encode_stage
    }

    /// Frames transcoded since construction, exposed for tests/metrics.
    pub fn frames_transcoded(&self) -> u64 {
        self.frames_transcoded
    }
}

impl MediaObject for TranscodingBridge {
    fn process(&mut self) {
        self.frames_transcoded += 1;
    }

    fn source_slot(&self) -> usize {
        self.source_slot
    }

    fn sink_slot(&self) -> usize {
        self.sink_slot
    }
}

/// Non-fatal diagnostics emitted by connection construction when a
/// matrix cell is `on` but no processing object could be built for it
/// (spec.md §4.2, §7 "Incompatible stream modes or incompatible codecs").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionDiagnostic {
    /// Source/sink streams negotiated at different sampling rates;
    /// resampling is explicitly unimplemented (spec.md §4.2 step 3).
    SamplingRateMismatch {
        source_slot: usize,
        sink_slot: usize,
        source_rate: u32,
        sink_rate: u32,
    },
    /// Either side is missing an audio stream, or the source cannot
    /// receive / the sink cannot send.
    IncompatibleModes { source_slot: usize, sink_slot: usize },
}

impl fmt::Display for ConnectionDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionDiagnostic::SamplingRateMismatch {
                source_slot,
                sink_slot,
                source_rate,
                sink_rate,
            } => write!(
                f,
                "cannot bridge slot {source_slot} ({source_rate} Hz) into slot {sink_slot} ({sink_rate} Hz): resampling unimplemented"
            ),
            ConnectionDiagnostic::IncompatibleModes { source_slot, sink_slot } => {
                write!(f, "slot {source_slot} -> slot {sink_slot}: incompatible stream modes")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_bridge_counts_frames() {
        let mut b = NullBridge::new(0, 1);
        b.process();
        b.process();
        assert_eq!(b.frames_forwarded(), 2);
        assert_eq!(b.source_slot(), 0);
        assert_eq!(b.sink_slot(), 1);
    }

    #[test]
    fn diagnostic_display() {
        let d = ConnectionDiagnostic::SamplingRateMismatch {
            source_slot: 0,
            sink_slot: 1,
            source_rate: 8000,
            sink_rate: 16000,
        };
        assert!(d.to_string().contains("resampling unimplemented"));
    }
}
