//! Signaling envelope wire format
//!
//! One envelope is built per publish. Field names and the integer action
//! codes are shared with the mobile and web call clients and must not
//! change:
//!
//! ```text
//! {
//!   "message_action": 0,
//!   "message_version": "1.0",
//!   "message_timestamp": 1718000000000,
//!   "fromUserId": 4111,
//!   "remoteUserId": 4222,          // invite only
//!   "fromRoomId": "room_id_test",
//!   "callId": "call-1",
//!   "hangupReason": "declined",    // hangup only
//!   "fromUserExtension": { ... }   // when configured
//! }
//! ```

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{Result, SignalError};

/// Protocol version stamped on every envelope
pub const MESSAGE_VERSION: &str = "1.0";

/// Participant identifier, a signed 32-bit integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i32);

impl From<i32> for UserId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl UserId {
    /// Address of this user's private channel
    pub fn channel(&self) -> String {
        self.to_string()
    }
}

/// Signaling action, encoded as `message_action`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SignalAction {
    Invite = 0,
    CancelCall = 1,
    Accept = 2,
    Reject = 3,
    Hangup = 4,
}

impl From<SignalAction> for u8 {
    fn from(action: SignalAction) -> Self {
        action as u8
    }
}

impl TryFrom<u8> for SignalAction {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Invite),
            1 => Ok(Self::CancelCall),
            2 => Ok(Self::Accept),
            3 => Ok(Self::Reject),
            4 => Ok(Self::Hangup),
            other => Err(format!("unknown message_action {}", other)),
        }
    }
}

/// A single signaling message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(rename = "message_action")]
    pub action: SignalAction,

    #[serde(rename = "message_version")]
    pub version: String,

    /// Milliseconds since epoch at construction
    #[serde(rename = "message_timestamp")]
    pub timestamp: i64,

    /// Sender of this copy
    #[serde(rename = "fromUserId")]
    pub from_user_id: UserId,

    #[serde(rename = "remoteUserId", default, skip_serializing_if = "Option::is_none")]
    pub remote_user_id: Option<UserId>,

    #[serde(rename = "fromRoomId", default)]
    pub from_room_id: String,

    #[serde(rename = "callId", default)]
    pub call_id: String,

    #[serde(rename = "hangupReason", default, skip_serializing_if = "Option::is_none")]
    pub hangup_reason: Option<String>,

    #[serde(rename = "fromUserExtension", default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<Map<String, Value>>,
}

impl SignalEnvelope {
    /// Serialize to UTF-8 JSON for publishing
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse a received payload.
    ///
    /// Envelopes from a different protocol version are rejected rather than
    /// guessed at.
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        let envelope: SignalEnvelope = serde_json::from_slice(payload)
            .map_err(|e| SignalError::InvalidEnvelope(e.to_string()))?;

        if envelope.version != MESSAGE_VERSION {
            return Err(SignalError::UnsupportedVersion(envelope.version));
        }

        Ok(envelope)
    }
}

/// Builds envelopes for one call action.
///
/// Room, call id and extension are shared by both legs; every envelope gets
/// its own timestamp.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeBuilder<'a> {
    room_id: &'a str,
    call_id: &'a str,
    extension: Option<&'a Map<String, Value>>,
}

impl<'a> EnvelopeBuilder<'a> {
    pub fn new(room_id: &'a str, call_id: &'a str) -> Self {
        Self {
            room_id,
            call_id,
            extension: None,
        }
    }

    pub fn with_extension(mut self, extension: Option<&'a Map<String, Value>>) -> Self {
        self.extension = extension;
        self
    }

    /// Invite sent by `from` about a call with `remote`
    pub fn invite(&self, from: UserId, remote: UserId) -> SignalEnvelope {
        let mut envelope = self.base(SignalAction::Invite, from);
        envelope.remote_user_id = Some(remote);
        envelope
    }

    /// Hangup sent by `from`, carrying `reason`
    pub fn hangup(&self, from: UserId, reason: &str) -> SignalEnvelope {
        let mut envelope = self.base(SignalAction::Hangup, from);
        envelope.hangup_reason = Some(reason.to_string());
        envelope
    }

    fn base(&self, action: SignalAction, from: UserId) -> SignalEnvelope {
        SignalEnvelope {
            action,
            version: MESSAGE_VERSION.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            from_user_id: from,
            remote_user_id: None,
            from_room_id: self.room_id.to_string(),
            call_id: self.call_id.to_string(),
            hangup_reason: None,
            extension: self.extension.cloned(),
        }
    }
}

/// Fresh correlation id for a call
pub fn new_call_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
