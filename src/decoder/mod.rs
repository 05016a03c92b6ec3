//! Frame decoders.
//!
//! A decoder owns the acquisition side of the receiver: a control channel bound
//! on the dispatch thread and an acquisition thread that fills shared buffers
//! and announces them on the notify channel.
//!
//! Hardware support plugs in through [`CameraBackend`]. The backend is chosen
//! once, when the [`CameraLinkDecoder`] is constructed, and the RX thread is
//! generic over it.
//!
//! ```text
//!  dispatch thread                          acquisition thread
//!  ───────────────                          ──────────────────
//!  bind notify, register
//!  start_service:
//!    bind ctrl, register
//!    spawn ─────────────────────────────▶   connect notify
//!                                           ◀─ status: connected / failed
//!  push_empty_buffer(id) ──▶ BufferQueue ──▶ try_take_empty_buffer
//!                                           fill buffer
//!  relay ◀──────────── notify/frame_ready ── notify_frame_ready
//!  stop_service:
//!    clear run flag, join ◀─────────────── loop observes flag, returns
//! ```

pub mod acquisition;
pub mod buffer_queue;
pub mod camera_link;
pub mod simulated;

pub use acquisition::CaptureContext;
pub use buffer_queue::BufferQueue;
pub use camera_link::CameraLinkDecoder;
pub use simulated::SimulatedCamera;

use crate::error::DecoderError;
use crate::ipc::IpcMessage;
use std::fmt;

/// Hardware-specific acquisition logic.
///
/// Implementations must return from [`run_capture_loop`](Self::run_capture_loop)
/// promptly once [`CaptureContext::is_running`] turns false: check it at the top
/// of every iteration. A blocking hardware call delays `stop_service` by up to
/// its own duration.
pub trait CameraBackend: Send + Sync + 'static {
    /// Short name used in logs and status replies.
    fn name(&self) -> &str;

    /// Capture frames until the context stops running.
    fn run_capture_loop(&self, ctx: &mut CaptureContext) -> Result<(), DecoderError>;

    /// Answer a control request received while the service is running.
    fn handle_control(&self, request: &IpcMessage) -> IpcMessage {
        request.nack(format!("{} does not handle {request}", self.name()))
    }
}

/// Decoder service lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceState {
    /// No acquisition thread; the control channel is closed
    #[default]
    Stopped,
    /// Acquisition thread spawned, notify connect not yet confirmed
    Starting,
    /// Notify channel connected, capture loop running
    Running,
    /// Stop requested, joining the acquisition thread
    Stopping,
}

impl ServiceState {
    /// Lower-case name used in status replies
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
