//! C1 — Termination: an endpoint inside a [`crate::context::MediaContext`].
//!
//! A termination is either an MRCP-resource endpoint (the engine-channel
//! side of a resource) or an RTP endpoint. It carries at most one
//! bidirectional audio stream.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Direction bits a stream supports. A stream with mode `NONE` is present
/// but currently carries no audio in either direction (e.g. `a=inactive`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamMode(u8);

impl StreamMode {
    const SEND_BIT: u8 = 0b01;
    const RECV_BIT: u8 = 0b10;

    /// Neither direction active (`a=inactive`).
    pub const NONE: StreamMode = StreamMode(0);
    /// Send only (`a=sendonly`).
    pub const SEND: StreamMode = StreamMode(Self::SEND_BIT);
    /// Receive only (`a=recvonly`).
    pub const RECEIVE: StreamMode = StreamMode(Self::RECV_BIT);
    /// Both directions (`a=sendrecv`).
    pub const SEND_RECEIVE: StreamMode = StreamMode(Self::SEND_BIT | Self::RECV_BIT);

    /// True if this mode can send audio out.
    pub fn can_send(self) -> bool {
        self.0 & Self::SEND_BIT != 0
    }

    /// True if this mode can receive audio in.
    pub fn can_receive(self) -> bool {
        self.0 & Self::RECV_BIT != 0
    }
}

/// Static description of a negotiated codec. Two descriptors are
/// "byte-for-byte equal" (spec.md §4.2 step 2) when this struct's
/// `PartialEq` says so.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodecDescriptor {
    /// `audio` / `video` / ... — kept as a string, this crate does not
    /// interpret it beyond equality.
    pub media_type: String,
    /// Sampling rate in Hz (e.g. 8000, 16000).
    pub sampling_rate: u32,
    /// Channel count (1 = mono).
    pub channels: u8,
    /// RTP encoding name (`PCMU`, `PCMA`, `opus`, ...).
    pub encoding_name: String,
    /// Whether this codec exposes a `decode` transform (spec.md §4.2
    /// step 4: "if the source codec defines a `decode` method").
    pub can_decode: bool,
    /// Whether this codec exposes an `encode` transform.
    pub can_encode: bool,
}

impl CodecDescriptor {
    /// Byte-for-byte identity check used by connection construction to
    /// decide between a null bridge and a transcoding chain.
    pub fn matches(&self, other: &CodecDescriptor) -> bool {
        self == other
    }
}

/// One direction's codec plus the stream mode it is negotiated under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioStream {
    /// Negotiated send/receive mode.
    pub mode: StreamMode,
    /// Codec this stream uses. `None` means the stream exists on the
    /// wire but no codec was negotiated for it (rejected media).
    pub codec: Option<CodecDescriptor>,
}

impl AudioStream {
    /// A new stream in the given mode with no codec yet negotiated.
    pub fn new(mode: StreamMode) -> Self {
        Self { mode, codec: None }
    }

    /// Attach a codec to this stream.
    pub fn with_codec(mut self, codec: CodecDescriptor) -> Self {
        self.codec = Some(codec);
        self
    }
}

static NEXT_TERMINATION_ID: AtomicU64 = AtomicU64::new(1);

/// An endpoint that can be bound into a [`crate::context::MediaContext`]'s
/// association matrix. Holds at most one bidirectional audio stream.
///
/// `slot` is `None` until [`crate::context::MediaContext::add_termination`]
/// binds it to a row/column in the matrix; it is cleared again by
/// `subtract_termination`.
#[derive(Debug, Clone)]
pub struct Termination {
    id: u64,
    /// Human-readable name, used only for logging/diagnostics.
    pub name: String,
    /// The audio stream this termination carries, if any.
    pub audio: Option<AudioStream>,
    slot: Option<usize>,
}

impl Termination {
    /// Create a new, unbound termination.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NEXT_TERMINATION_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            audio: None,
            slot: None,
        }
    }

    /// Create a termination carrying the given audio stream.
    pub fn with_audio(name: impl Into<String>, audio: AudioStream) -> Self {
        let mut t = Self::new(name);
        t.audio = Some(audio);
        t
    }

    /// Process-wide unique id, stable across slot rebinding.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The row/column this termination is bound to in its context, if any.
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    pub(crate) fn bind_slot(&mut self, slot: usize) {
        self.slot = Some(slot);
    }

    pub(crate) fn unbind_slot(&mut self) {
        self.slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_mode_directions() {
        assert!(StreamMode::SEND_RECEIVE.can_send());
        assert!(StreamMode::SEND_RECEIVE.can_receive());
        assert!(StreamMode::SEND.can_send());
        assert!(!StreamMode::SEND.can_receive());
        assert!(!StreamMode::NONE.can_send());
        assert!(!StreamMode::NONE.can_receive());
    }

    #[test]
    fn codec_descriptor_equality() {
        let a = CodecDescriptor {
            media_type: "audio".into(),
            sampling_rate: 8000,
            channels: 1,
            encoding_name: "PCMU".into(),
            can_decode: true,
            can_encode: true,
        };
        let b = a.clone();
        assert!(a.matches(&b));
        let mut c = b.clone();
        c.sampling_rate = 16000;
        assert!(!a.matches(&c));
    }
}
