//! RTP termination slot: the audio leg a channel is bound to inside a
//! session's media context (spec.md §3, §4.1 step 6 "bind to or create an
//! RTP termination").

use async_trait::async_trait;

use mrcp_media_core::{CodecDescriptor, Termination, TerminationDescriptor};

use crate::descriptor::{MediaSlotDescriptor, SessionId};

/// A single negotiated RTP leg, shared by every channel whose control
/// media id (`cmid`) points at it (spec.md §4.1 "two channels with the
/// same control-media-id share one RTP termination").
pub struct RtpTerminationSlot {
    pub cmid: u32,
    pub termination: Termination,
    /// Local/remote socket pair the factory allocated for this leg,
    /// carried so a later re-offer against the same slot
    /// (`modify_existing_rtp_slot`) can re-echo the same answer without
    /// re-allocating.
    pub descriptor: TerminationDescriptor,
    /// Index of `termination` inside the session's media context.
    pub context_row: usize,
}

impl RtpTerminationSlot {
    pub fn new(cmid: u32, termination: Termination, descriptor: TerminationDescriptor, context_row: usize) -> Self {
        Self { cmid, termination, descriptor, context_row }
    }
}

/// External collaborator that allocates the gateway-side RTP socket pair
/// for a new termination and reports back the negotiated codec (spec.md
/// §5 "the underlying RTP stack is out of scope; a termination is an
/// opaque capability token").
#[async_trait]
pub trait RtpTerminationFactory: Send + Sync {
    /// Allocate a termination for `slot` in `session_id`, attempting to
    /// agree on one of `offered_codecs`, and the local/remote socket pair
    /// it bound (so the answer can carry a real port and local IP per
    /// spec.md §8 scenario 1). Returns `None` if no codec in the offer is
    /// supported locally (spec.md §4.2 codec mismatch path).
    async fn allocate(
        &self,
        session_id: SessionId,
        slot: &MediaSlotDescriptor,
        offered_codecs: &[CodecDescriptor],
    ) -> Option<(Termination, TerminationDescriptor)>;
}
