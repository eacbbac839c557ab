//! MRCP message envelope (spec.md §6 "MRCP message").
//!
//! This crate never parses the colon-separated wire form; it only carries
//! the already-decoded envelope between the state machine, the control
//! channel, and the engine channel.

use serde::{Deserialize, Serialize};

use crate::descriptor::MrcpVersion;

/// Which of the three MRCP message kinds this is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MrcpMessageKind {
    /// `<method>` start line, e.g. `SPEAK`, `RECOGNIZE`.
    Request(String),
    /// `<status>` start line, referencing the request it answers.
    Response { status_code: u16, request_id: u64 },
    /// `<event-name>` start line, out-of-band relative to any single request.
    Event(String),
}

/// One MRCP message (spec.md §6): start line, headers, optional body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MrcpMessage {
    pub version: MrcpVersion,
    pub request_id: u64,
    pub kind: MrcpMessageKind,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl MrcpMessage {
    /// Build a bare request with no headers/body.
    pub fn request(version: MrcpVersion, request_id: u64, method: impl Into<String>) -> Self {
        Self {
            version,
            request_id,
            kind: MrcpMessageKind::Request(method.into()),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Build a bare event with no headers/body.
    pub fn event(version: MrcpVersion, request_id: u64, name: impl Into<String>) -> Self {
        Self {
            version,
            request_id,
            kind: MrcpMessageKind::Event(name.into()),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Build a bare response with no headers/body.
    pub fn response(version: MrcpVersion, request_id: u64, status_code: u16) -> Self {
        Self {
            version,
            request_id,
            kind: MrcpMessageKind::Response { status_code, request_id },
            headers: Vec::new(),
            body: None,
        }
    }

    /// True for `Request` messages (routed to the engine channel).
    pub fn is_request(&self) -> bool {
        matches!(self.kind, MrcpMessageKind::Request(_))
    }

    /// True for `Event` messages (never consume the signaling queue head —
    /// spec.md §4.1 "Control-message routing").
    pub fn is_event(&self) -> bool {
        matches!(self.kind, MrcpMessageKind::Event(_))
    }
}
