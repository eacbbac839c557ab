//! Wire-adjacent descriptor types (spec.md §3, §6).
//!
//! These are typed, already-parsed representations of what an SDP/SIP/RTSP
//! adapter would hand the orchestrator — this crate does not parse SDP
//! text itself (spec.md §1 Non-goals).

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use mrcp_media_core::{CodecDescriptor, StreamMode};

/// Unique per-session identifier: a 16-hex-character string, generated on
/// the first offer (spec.md §3, §6).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh 16-hex-character id from a random UUID.
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        let hex = uuid.simple().to_string();
        Self(hex[..16].to_string())
    }

    /// Wrap an existing id string verbatim (used when a signaling message
    /// names an already-established session).
    pub fn from_str_unchecked(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The raw hex string, as it appears on the wire in `<session-id>@<resource>`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `MRCP/1.0` tunnels control inside RTSP; `MRCP/2.0` uses a separate
/// TCP/TLS control connection (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MrcpVersion {
    V1,
    V2,
}

/// Session-wide status, wire-mapped to an SDP `a=` attribute (spec.md §6,
/// §7). `OK` has no wire attribute; the others map to
/// `a=resource-state:<name>` mirroring how UniMRCP-style gateways surface
/// rejection reasons inline in the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Ok,
    NoSuchResource,
    UnavailableResource,
    UnacceptableResource,
}

impl SessionStatus {
    /// The wire-level attribute value, or `None` for `Ok` (no attribute
    /// is emitted when everything succeeded).
    pub fn wire_attribute(self) -> Option<&'static str> {
        match self {
            SessionStatus::Ok => None,
            SessionStatus::NoSuchResource => Some("a=resource-state:no-such-resource"),
            SessionStatus::UnavailableResource => Some("a=resource-state:unavailable-resource"),
            SessionStatus::UnacceptableResource => Some("a=resource-state:unacceptable-resource"),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Ok => "OK",
            SessionStatus::NoSuchResource => "NO_SUCH_RESOURCE",
            SessionStatus::UnavailableResource => "UNAVAILABLE_RESOURCE",
            SessionStatus::UnacceptableResource => "UNACCEPTABLE_RESOURCE",
        };
        f.write_str(s)
    }
}

/// v1's add/remove flag on a resource descriptor (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    Add,
    Remove,
}

/// One control/audio/video media-position entry. A `None` slot is the
/// "absent" case spec.md §3 calls out explicitly.
pub type MediaSlot = Option<MediaSlotDescriptor>;

/// The payload of a non-absent media slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSlotDescriptor {
    /// SDP port; `0` marks a rejected channel in an answer slot.
    pub port: u16,
    /// Transport protocol id (`RTP/AVP`, `TCP/TLS/MRCPv2`, `RTSP`, ...).
    pub protocol: String,
    /// `a=resource:<name>` for control media.
    pub resource_name: Option<String>,
    /// `a=cmid:<n>` grouping id.
    pub cmid: Option<u32>,
    /// SDP `mid` for audio/video media that a `cmid` refers to.
    pub mid: Option<u32>,
    /// Negotiated codec, if any.
    pub codec: Option<CodecDescriptor>,
    /// Negotiated direction.
    pub mode: Option<StreamMode>,
}

impl MediaSlotDescriptor {
    /// A rejected slot: port 0, everything else empty.
    pub fn rejected(protocol: impl Into<String>) -> Self {
        Self {
            port: 0,
            protocol: protocol.into(),
            resource_name: None,
            cmid: None,
            mid: None,
            codec: None,
            mode: None,
        }
    }
}

/// `a=resource:<name>` + `a=cmid:<n>` control-media entry (spec.md §3
/// "Control-media descriptor"), used by the v2 `control_media_arr` walk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMediaDescriptor {
    pub session_id: SessionId,
    pub cmid: u32,
    pub resource_name: String,
    /// Set to 0 in answers that reject the channel.
    pub port: u16,
}

/// Immutable per-exchange session descriptor (spec.md §3 "Session
/// descriptor"). One of these flows in as an offer; the orchestrator
/// assembles a matching one as the answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub version: MrcpVersion,
    pub resource_name: String,
    pub resource_state: ResourceState,
    pub status: SessionStatus,
    pub control: Vec<MediaSlot>,
    pub audio: Vec<MediaSlot>,
    pub video: Vec<MediaSlot>,
    pub origin: String,
    pub bind_ip: IpAddr,
    pub external_ip: Option<IpAddr>,
    /// Only meaningful for v2: the full set of control-media entries to
    /// reconcile against existing channels (spec.md §4.1 step 5).
    pub control_media_arr: Vec<ControlMediaDescriptor>,
}

impl SessionDescriptor {
    /// Build the in-construction answer template: same control/audio/video
    /// arity as `self`, every slot `None`, status copied from the offer
    /// (spec.md §4.1 step 2).
    pub fn answer_template(&self) -> SessionDescriptor {
        SessionDescriptor {
            version: self.version,
            resource_name: self.resource_name.clone(),
            resource_state: self.resource_state,
            status: self.status,
            control: vec![None; self.control.len()],
            audio: vec![None; self.audio.len()],
            video: vec![None; self.video.len()],
            origin: self.origin.clone(),
            bind_ip: self.bind_ip,
            external_ip: self.external_ip,
            control_media_arr: Vec::new(),
        }
    }

    /// spec.md §3 invariant: "The answer descriptor has exactly the same
    /// control/audio/video arity as the offer."
    pub fn arity_matches(&self, other: &SessionDescriptor) -> bool {
        self.control.len() == other.control.len()
            && self.audio.len() == other.audio.len()
            && self.video.len() == other.video.len()
    }

    /// spec.md §3 invariant: "each slot becomes non-null before the
    /// answer is sent (or is an explicit rejection with port 0)". A slot
    /// counts as resolved once it is non-`None` — port 0 is itself a
    /// legitimate non-`None` rejection value.
    pub fn all_slots_resolved(&self) -> bool {
        self.control.iter().all(Option::is_some)
            && self.audio.iter().all(Option::is_some)
            && self.video.iter().all(Option::is_some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_sixteen_hex_chars() {
        let id = SessionId::generate();
        assert_eq!(id.as_str().len(), 16);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn answer_template_matches_offer_arity_and_has_null_slots() {
        let offer = SessionDescriptor {
            version: MrcpVersion::V2,
            resource_name: "speechrecog".into(),
            resource_state: ResourceState::Add,
            status: SessionStatus::Ok,
            control: vec![None, None],
            audio: vec![None],
            video: vec![],
            origin: "- 0 0 IN IP4 127.0.0.1".into(),
            bind_ip: "127.0.0.1".parse().unwrap(),
            external_ip: None,
            control_media_arr: vec![],
        };
        let answer = offer.answer_template();
        assert!(offer.arity_matches(&answer));
        assert!(!answer.all_slots_resolved());
    }

    #[test]
    fn status_wire_mapping() {
        assert_eq!(SessionStatus::Ok.wire_attribute(), None);
        assert_eq!(
            SessionStatus::NoSuchResource.wire_attribute(),
            Some("a=resource-state:no-such-resource")
        );
    }

    /// Session descriptors cross the signaling-adapter boundary as JSON
    /// (spec.md §6); a round trip through `serde_json` must be lossless.
    #[test]
    fn session_descriptor_json_round_trip() {
        let offer = SessionDescriptor {
            version: MrcpVersion::V2,
            resource_name: "speechrecog".into(),
            resource_state: ResourceState::Add,
            status: SessionStatus::Ok,
            control: vec![Some(MediaSlotDescriptor {
                port: 9,
                protocol: "TCP/TLS/MRCPv2".into(),
                resource_name: Some("speechrecog".into()),
                cmid: Some(1),
                mid: None,
                codec: None,
                mode: None,
            })],
            audio: vec![Some(MediaSlotDescriptor {
                port: 43210,
                protocol: "RTP/AVP".into(),
                resource_name: None,
                cmid: Some(1),
                mid: Some(1),
                codec: Some(CodecDescriptor {
                    media_type: "audio".into(),
                    sampling_rate: 8000,
                    channels: 1,
                    encoding_name: "PCMU".into(),
                    can_decode: false,
                    can_encode: false,
                }),
                mode: Some(StreamMode::SEND_RECEIVE),
            })],
            video: vec![],
            origin: "- 0 0 IN IP4 127.0.0.1".into(),
            bind_ip: "127.0.0.1".parse().unwrap(),
            external_ip: None,
            control_media_arr: vec![],
        };

        let json = serde_json::to_string(&offer).expect("serialize session descriptor");
        let back: SessionDescriptor = serde_json::from_str(&json).expect("deserialize session descriptor");

        assert_eq!(back.resource_name, offer.resource_name);
        assert_eq!(back.control, offer.control);
        assert_eq!(back.audio, offer.audio);
    }
}
