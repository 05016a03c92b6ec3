//! Acquisition thread.
//!
//! The thread connects its end of the notify channel, reports the outcome to
//! the dispatch thread, then hands control to the backend's capture loop. Every
//! outcome (connected, capture finished, connect or capture failure) is sent on
//! a status channel that the decoder drains from the dispatch thread, so a
//! failure inside the thread is never lost.

use super::{BufferQueue, CameraBackend};
use crate::error::DecoderError;
use crate::ipc::{ChannelType, IpcChannel, IpcContext, ReadyNotification};
use crossbeam_channel::{unbounded, Receiver, Sender};
use shared_buffer::{BufferAddress, BufferId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Outcome reported by the acquisition thread.
#[derive(Debug)]
pub(crate) enum AcquisitionStatus {
    /// Notify channel connected; the capture loop is about to start.
    Connected,
    /// Capture loop returned normally.
    Exited { frames: u64 },
    /// Connect or capture failed; the thread is exiting.
    Failed(DecoderError),
}

/// What the backend's capture loop can see and do.
///
/// Owned by the acquisition thread for the duration of the capture loop.
pub struct CaptureContext {
    running: Arc<AtomicBool>,
    buffers: Arc<BufferQueue>,
    notify: IpcChannel,
    frames_notified: u64,
}

impl CaptureContext {
    /// Whether the loop should keep going. Check at the top of every iteration.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Take ownership of a free buffer, if any.
    ///
    /// The caller owns the slot until it passes the id to
    /// [`notify_frame_ready`](Self::notify_frame_ready).
    #[must_use]
    pub fn try_take_empty_buffer(&self) -> Option<(BufferId, BufferAddress<'_>)> {
        self.buffers.try_pop()
    }

    /// Size in bytes of every shared buffer.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffers.manager().buffer_size()
    }

    /// Announce a filled buffer to the dispatch thread.
    pub fn notify_frame_ready(
        &mut self,
        buffer_id: BufferId,
        frame_number: u64,
    ) -> Result<(), DecoderError> {
        let message = ReadyNotification::new(buffer_id, frame_number).to_message();
        self.notify.send(message.encode()?)?;
        self.frames_notified += 1;
        debug!(buffer_id, frame = frame_number, "Frame ready");
        Ok(())
    }

    /// Frames announced so far by this loop
    #[must_use]
    pub fn frames_notified(&self) -> u64 {
        self.frames_notified
    }
}

/// Handle on a spawned acquisition thread.
pub(crate) struct AcquisitionThread {
    handle: JoinHandle<()>,
    status: Receiver<AcquisitionStatus>,
}

impl AcquisitionThread {
    /// Spawn the thread. It connects to `notify_endpoint` before capturing.
    ///
    /// The endpoint must already be bound in `context`.
    pub(crate) fn spawn<B: CameraBackend>(
        backend: Arc<B>,
        context: &IpcContext,
        notify_endpoint: &str,
        running: Arc<AtomicBool>,
        buffers: Arc<BufferQueue>,
    ) -> Result<Self, DecoderError> {
        let (status_tx, status) = unbounded();
        let context = context.clone();
        let endpoint = notify_endpoint.to_string();
        let handle = thread::Builder::new()
            .name(format!("acq-{}", backend.name()))
            .spawn(move || run(&*backend, &context, &endpoint, running, buffers, &status_tx))
            .map_err(DecoderError::Spawn)?;
        Ok(Self { handle, status })
    }

    /// Next pending status report, if any.
    pub(crate) fn try_status(&self) -> Option<AcquisitionStatus> {
        self.status.try_recv().ok()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Join the thread, returning any status it reported but nobody read.
    pub(crate) fn join(self) -> Result<Vec<AcquisitionStatus>, DecoderError> {
        let joined = self.handle.join();
        let pending = self.status.try_iter().collect();
        joined.map_err(|_| DecoderError::ThreadPanicked)?;
        Ok(pending)
    }
}

fn run<B: CameraBackend>(
    backend: &B,
    context: &IpcContext,
    notify_endpoint: &str,
    running: Arc<AtomicBool>,
    buffers: Arc<BufferQueue>,
    status: &Sender<AcquisitionStatus>,
) {
    let mut notify = IpcChannel::new(ChannelType::Pair, context);
    if let Err(source) = notify.connect(notify_endpoint) {
        error!(endpoint = notify_endpoint, error = %source, "Notify channel connect failed");
        let _ = status.send(AcquisitionStatus::Failed(DecoderError::NotifyConnect {
            endpoint: notify_endpoint.to_string(),
            source,
        }));
        return;
    }
    debug!(endpoint = notify_endpoint, "Notify channel connected");
    let _ = status.send(AcquisitionStatus::Connected);

    let mut ctx = CaptureContext {
        running,
        buffers,
        notify,
        frames_notified: 0,
    };

    info!(backend = backend.name(), "Capture loop started");
    let outcome = backend.run_capture_loop(&mut ctx);
    let frames = ctx.frames_notified();
    match outcome {
        Ok(()) => {
            info!(backend = backend.name(), frames, "Capture loop exited");
            let _ = status.send(AcquisitionStatus::Exited { frames });
        }
        Err(e) => {
            error!(backend = backend.name(), frames, error = %e, "Capture loop failed");
            let _ = status.send(AcquisitionStatus::Failed(e));
        }
    }
}
