//! Client callback payloads (spec.md §6 "Callback payloads").
//!
//! Only three shapes ever reach a client: `SUCCESS`, `FAILURE`, and `ABORT`.
//! Everything else (device failures, plugin errors, ignored restarts)
//! surfaces as a return code on the synchronous API instead — see
//! [`crate::error::SoundTriggerError`]. Serde derives follow the teacher
//! crate's IPC event convention (`ipc/events.rs`): camelCase on the wire,
//! snake_case in Rust.

use serde::{Deserialize, Serialize};

/// Why a session was aborted without a client-initiated `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    ConcurrentCapture,
    DeviceLost,
    ServiceRestart,
}

/// One client-visible callback (spec.md §6, §7 "User-visible behavior").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    /// A detection confirmed through every configured stage. `payload` is
    /// the opaque vendor event built by the voice-UI interface
    /// (`build_detection_event`).
    Success {
        stream_id: u64,
        #[serde(with = "serde_bytes_as_base64")]
        payload: Vec<u8>,
    },
    /// A stage-2 rejection the platform is configured to notify.
    Failure { stream_id: u64, reason: String },
    /// Concurrency, device loss, or SSR forced the stream out of an active
    /// session.
    Abort {
        stream_id: u64,
        reason: AbortReason,
    },
}

impl ClientEvent {
    pub fn stream_id(&self) -> u64 {
        match self {
            ClientEvent::Success { stream_id, .. } => *stream_id,
            ClientEvent::Failure { stream_id, .. } => *stream_id,
            ClientEvent::Abort { stream_id, .. } => *stream_id,
        }
    }
}

/// Base64-encodes opaque binary payloads so `ClientEvent` round-trips
/// cleanly through `serde_json`, the same treatment the teacher crate gives
/// binary IPC fields.
mod serde_bytes_as_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(&encoded).map_err(serde::de::Error::custom)
    }
}
