//! Error types for the frame receiver.
//!
//! Errors are grouped by the layer that raises them:
//!
//! - **`IpcError`**: endpoint parsing, channel bind/connect/send/recv, message
//!   decoding and reactor registration.
//! - **`DecoderError`**: decoder lifecycle failures (bind of the control channel,
//!   connect of the notify channel inside the acquisition thread, invalid state
//!   transitions, capture loop failures).
//! - **`ReceiverError`**: the umbrella type returned by the RX thread, the
//!   configuration loader and the binary. It converts from the other two with
//!   `#[from]` so `?` works across layers.
//!
//! The taxonomy follows how failures are handled at run time. Bind failures are
//! fatal to a start attempt and are returned synchronously. Connect failures
//! inside the acquisition thread travel back to the dispatch thread on the
//! decoder's status channel. Malformed messages are logged and dropped by the
//! caller and never reach this module as a hard failure.

use shared_buffer::{BufferId, PoolError};
use thiserror::Error;

/// Convenience alias for results using the receiver error type.
pub type AppResult<T> = std::result::Result<T, ReceiverError>;

/// Errors raised by the IPC layer.
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Endpoint '{0}' is already bound")]
    AddressInUse(String),

    #[error("Binding endpoint '{endpoint}' failed: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connecting to endpoint '{endpoint}' failed: {reason}")]
    ConnectionRefused { endpoint: String, reason: String },

    #[error("Channel is already attached to '{0}'")]
    AlreadyAttached(String),

    #[error("Channel has no connected peer")]
    NotConnected,

    #[error("Unknown peer {0}")]
    UnknownPeer(u64),

    #[error("Operation not supported on a {kind} channel: {operation}")]
    UnsupportedOperation {
        kind: &'static str,
        operation: &'static str,
    },

    #[error("Channel closed")]
    Closed,

    #[error("Timed out waiting for a message")]
    Timeout,

    #[error("Send failed: {0}")]
    Send(#[from] std::io::Error),

    #[error("Failed to decode message: {0}")]
    MessageDecode(#[source] serde_json::Error),

    #[error("Failed to encode message: {0}")]
    MessageEncode(#[source] serde_json::Error),

    #[error("Message parameter '{name}' missing or invalid: {reason}")]
    Parameter { name: String, reason: String },

    #[error("Endpoint '{0}' is already registered with the reactor")]
    AlreadyRegistered(String),
}

/// Errors raised by a frame decoder and its acquisition thread.
#[derive(Error, Debug)]
pub enum DecoderError {
    #[error("Binding control channel endpoint {endpoint} failed: {source}")]
    ControlBind {
        endpoint: String,
        #[source]
        source: IpcError,
    },

    #[error("Connecting notify channel to endpoint {endpoint} failed: {source}")]
    NotifyConnect {
        endpoint: String,
        #[source]
        source: IpcError,
    },

    #[error("Invalid decoder configuration: {0}")]
    Configuration(String),

    #[error("Decoder service is {0}; operation requires a different state")]
    InvalidState(&'static str),

    #[error("Buffer {0} does not belong to the shared buffer region")]
    UnknownBuffer(BufferId),

    #[error("Failed to spawn acquisition thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Acquisition thread panicked")]
    ThreadPanicked,

    #[error("Capture loop failed: {0}")]
    Capture(String),

    #[error(transparent)]
    Ipc(#[from] IpcError),
}

/// Primary error type for the frame receiver.
#[derive(Error, Debug)]
pub enum ReceiverError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Shared buffer error: {0}")]
    SharedBuffer(#[from] PoolError),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Decoder error: {0}")]
    Decoder(#[from] DecoderError),

    #[error("RX thread initialisation failed: {0}")]
    RxThreadInit(String),

    #[error("RX thread panicked")]
    RxThreadPanicked,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ReceiverError {
    fn from(err: figment::Error) -> Self {
        ReceiverError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_bind_error_names_endpoint() {
        let err = DecoderError::ControlBind {
            endpoint: "tcp://*:5060".into(),
            source: IpcError::AddressInUse("tcp://*:5060".into()),
        };
        let text = err.to_string();
        assert!(text.contains("Binding control channel endpoint tcp://*:5060 failed"));
        assert!(text.contains("already bound"));
    }

    #[test]
    fn layers_convert_into_receiver_error() {
        let err: ReceiverError = DecoderError::InvalidState("running").into();
        assert!(matches!(err, ReceiverError::Decoder(_)));

        let err: ReceiverError = IpcError::NotConnected.into();
        assert!(matches!(err, ReceiverError::Ipc(IpcError::NotConnected)));
    }
}
