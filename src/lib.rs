//! # Frame Receiver
//!
//! Acquisition core of a camera frame receiver. A blocking capture loop runs on
//! a dedicated acquisition thread while a reactor-driven RX (dispatch) thread
//! relays its frame notifications downstream and serves control requests.
//!
//! ## Crate Structure
//!
//! - **`config`**: layered configuration (defaults, TOML file, environment) loaded
//!   with `figment`. See [`config::ReceiverConfig`].
//! - **`decoder`**: the decoder contract, the empty-buffer queue, the
//!   acquisition thread and the camera backends.
//! - **`error`**: `thiserror` error types for each layer.
//! - **`ipc`**: message channels, the wire message format and the reactor.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`rx_thread`**: the RX thread that owns the reactor.
//! - **`sink`**: a downstream consumer that releases frames back to the decoder.

pub mod config;
pub mod decoder;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod rx_thread;
pub mod sink;

pub use config::ReceiverConfig;
pub use decoder::{CameraBackend, CameraLinkDecoder, ServiceState};
pub use error::{AppResult, DecoderError, IpcError, ReceiverError};
pub use rx_thread::{FrameReceiverRxThread, RxThreadHandle};
pub use sink::{FrameSink, SinkEvent};
