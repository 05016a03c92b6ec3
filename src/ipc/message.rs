//! IPC message envelope.
//!
//! Every message on a receiver channel is a JSON object of the form
//!
//! ```json
//! {"msg_type": "notify", "msg_val": "frame_ready",
//!  "timestamp": "2024-01-01T00:00:00Z",
//!  "params": {"frame": 3, "buffer_id": 1}}
//! ```
//!
//! Producers and consumers only have to agree on the JSON shape; the relay in
//! the RX thread forwards the encoded bytes untouched.

use crate::error::IpcError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shared_buffer::BufferId;
use std::fmt;

/// Message category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    /// Request expecting a reply
    Cmd,
    /// Successful reply
    Ack,
    /// Rejected request
    Nack,
    /// Unsolicited event
    Notify,
}

/// Message value, i.e. what the command or notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgVal {
    /// Receiver or decoder status
    Status,
    /// Apply configuration parameters
    Configure,
    /// Hand one buffer back for filling
    BufferRelease,
    /// Queue a range of buffers for filling
    BufferPrecharge,
    /// A filled buffer is ready
    FrameReady,
    /// Zero the counters
    ResetStatistics,
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MsgType::Cmd => "cmd",
            MsgType::Ack => "ack",
            MsgType::Nack => "nack",
            MsgType::Notify => "notify",
        };
        write!(f, "{label}")
    }
}

impl fmt::Display for MsgVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MsgVal::Status => "status",
            MsgVal::Configure => "configure",
            MsgVal::BufferRelease => "buffer_release",
            MsgVal::BufferPrecharge => "buffer_precharge",
            MsgVal::FrameReady => "frame_ready",
            MsgVal::ResetStatistics => "reset_statistics",
        };
        write!(f, "{label}")
    }
}

/// A typed control or notification message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcMessage {
    msg_type: MsgType,
    msg_val: MsgVal,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    params: Map<String, Value>,
}

impl IpcMessage {
    /// Create a message stamped with the current time and no parameters.
    #[must_use]
    pub fn new(msg_type: MsgType, msg_val: MsgVal) -> Self {
        Self {
            msg_type,
            msg_val,
            timestamp: Utc::now(),
            params: Map::new(),
        }
    }

    /// Decode a message from its wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, IpcError> {
        serde_json::from_slice(bytes).map_err(IpcError::MessageDecode)
    }

    /// Encode the message to its wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, IpcError> {
        serde_json::to_vec(self).map_err(IpcError::MessageEncode)
    }

    /// Message type
    #[must_use]
    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    /// Message value
    #[must_use]
    pub fn msg_val(&self) -> MsgVal {
        self.msg_val
    }

    /// Creation time
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// All parameters
    #[must_use]
    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// Whether parameter `name` is present
    #[must_use]
    pub fn has_param(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    /// Set a parameter, replacing any previous value.
    pub fn set_param<T: Serialize>(&mut self, name: &str, value: T) -> Result<(), IpcError> {
        let value = serde_json::to_value(value).map_err(IpcError::MessageEncode)?;
        self.params.insert(name.to_string(), value);
        Ok(())
    }

    /// Builder-style [`set_param`](Self::set_param) for values that always serialize.
    #[must_use]
    pub fn with_param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    /// Get a parameter, failing if it is missing or has the wrong type.
    pub fn get_param<T: DeserializeOwned>(&self, name: &str) -> Result<T, IpcError> {
        let value = self.params.get(name).ok_or_else(|| IpcError::Parameter {
            name: name.to_string(),
            reason: "missing".to_string(),
        })?;
        serde_json::from_value(value.clone()).map_err(|e| IpcError::Parameter {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Get a parameter, falling back to `default` if it is missing or mistyped.
    #[must_use]
    pub fn get_param_or<T: DeserializeOwned>(&self, name: &str, default: T) -> T {
        self.get_param(name).unwrap_or(default)
    }

    /// Build the reply to this message carrying the same value.
    #[must_use]
    pub fn reply(&self, msg_type: MsgType) -> Self {
        Self::new(msg_type, self.msg_val)
    }

    /// Build a nack reply with an `error` parameter.
    #[must_use]
    pub fn nack(&self, reason: impl Into<String>) -> Self {
        self.reply(MsgType::Nack).with_param("error", reason.into())
    }

    /// Whether the message has this type and value
    #[must_use]
    pub fn is(&self, msg_type: MsgType, msg_val: MsgVal) -> bool {
        self.msg_type == msg_type && self.msg_val == msg_val
    }
}

impl fmt::Display for IpcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.msg_type, self.msg_val)
    }
}

/// A filled buffer handed from the acquisition thread to the dispatch thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyNotification {
    /// Slot holding the frame
    pub buffer_id: BufferId,
    /// Camera frame counter
    pub frame_number: u64,
}

impl ReadyNotification {
    /// Notification for `buffer_id` holding `frame_number`
    #[must_use]
    pub fn new(buffer_id: BufferId, frame_number: u64) -> Self {
        Self {
            buffer_id,
            frame_number,
        }
    }

    /// Build the `notify/frame_ready` message for this notification.
    #[must_use]
    pub fn to_message(&self) -> IpcMessage {
        IpcMessage::new(MsgType::Notify, MsgVal::FrameReady)
            .with_param("frame", self.frame_number)
            .with_param("buffer_id", self.buffer_id)
    }

    /// Extract a notification from a `notify/frame_ready` message.
    pub fn from_message(message: &IpcMessage) -> Result<Self, IpcError> {
        if !message.is(MsgType::Notify, MsgVal::FrameReady) {
            return Err(IpcError::Parameter {
                name: "msg_val".to_string(),
                reason: format!("expected notify/frame_ready, got {message}"),
            });
        }
        Ok(Self {
            buffer_id: message.get_param("buffer_id")?,
            frame_number: message.get_param("frame")?,
        })
    }
}
