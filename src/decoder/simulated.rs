//! Simulated camera backend.
//!
//! Produces frames without hardware so the receiver can run end to end. Each
//! frame starts with its frame number as 8 little-endian bytes; the rest of the
//! buffer is filled with [`fill_pattern`] so consumers can verify content.

use super::{CameraBackend, CaptureContext};
use crate::config::SimulatorConfig;
use crate::error::DecoderError;
use crate::ipc::{IpcMessage, MsgType, MsgVal};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// How long to wait before retrying when no empty buffer is available.
const EMPTY_QUEUE_BACKOFF: Duration = Duration::from_millis(1);

/// Simple pseudo-random number generator (LCG) for reproducible content.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1_103_515_245).wrapping_add(12_345) & 0x7fff_ffff
}

/// Fill `buffer` with the simulated frame content for `frame_number`.
pub fn fill_pattern(buffer: &mut [u8], frame_number: u64) {
    let header = frame_number.to_le_bytes();
    let split = buffer.len().min(header.len());
    let (head, body) = buffer.split_at_mut(split);
    head.copy_from_slice(&header[..split]);

    let seed = frame_number.wrapping_mul(2_654_435_761);
    for (i, byte) in body.iter_mut().enumerate() {
        *byte = prng(seed ^ i as u64) as u8;
    }
}

/// Frame number stored at the start of a simulated frame, if the buffer is large enough.
#[must_use]
pub fn frame_number_of(buffer: &[u8]) -> Option<u64> {
    let header: [u8; 8] = buffer.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(header))
}

/// Camera backend that synthesizes frames at a fixed rate.
#[derive(Debug)]
pub struct SimulatedCamera {
    frame_interval: Duration,
    max_frames: u64,
    frames_captured: AtomicU64,
    buffer_misses: AtomicU64,
}

impl SimulatedCamera {
    /// Simulated camera with the given pacing and frame limit
    #[must_use]
    pub fn new(config: &SimulatorConfig) -> Self {
        Self {
            frame_interval: config.frame_interval(),
            max_frames: config.max_frames,
            frames_captured: AtomicU64::new(0),
            buffer_misses: AtomicU64::new(0),
        }
    }

    /// Frames produced since creation
    #[must_use]
    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }

    fn limit_reached(&self, frame_number: u64) -> bool {
        self.max_frames > 0 && frame_number >= self.max_frames
    }
}

impl CameraBackend for SimulatedCamera {
    fn name(&self) -> &str {
        "simulated"
    }

    fn run_capture_loop(&self, ctx: &mut CaptureContext) -> Result<(), DecoderError> {
        let mut frame_number = 0u64;
        self.frames_captured.store(0, Ordering::Relaxed);

        while ctx.is_running() {
            if self.limit_reached(frame_number) {
                info!(frames = frame_number, "Frame limit reached");
                break;
            }

            let buffer_id = {
                let Some((buffer_id, mut addr)) = ctx.try_take_empty_buffer() else {
                    self.buffer_misses.fetch_add(1, Ordering::Relaxed);
                    thread::sleep(EMPTY_QUEUE_BACKOFF);
                    continue;
                };
                // SAFETY: the id was just popped from the empty-buffer queue, so this
                // thread owns the slot until it is announced below.
                fill_pattern(unsafe { addr.as_mut_slice() }, frame_number);
                buffer_id
            };

            ctx.notify_frame_ready(buffer_id, frame_number)?;
            frame_number += 1;
            self.frames_captured.store(frame_number, Ordering::Relaxed);

            if !self.frame_interval.is_zero() {
                thread::sleep(self.frame_interval);
            }
        }

        debug!(
            frames = frame_number,
            buffer_misses = self.buffer_misses.load(Ordering::Relaxed),
            "Simulated capture finished"
        );
        Ok(())
    }

    fn handle_control(&self, request: &IpcMessage) -> IpcMessage {
        match (request.msg_type(), request.msg_val()) {
            (MsgType::Cmd, MsgVal::Status) => request
                .reply(MsgType::Ack)
                .with_param("camera", self.name())
                .with_param("frames_captured", self.frames_captured())
                .with_param("buffer_misses", self.buffer_misses.load(Ordering::Relaxed))
                .with_param("max_frames", self.max_frames)
                .with_param("frame_interval_ms", self.frame_interval.as_millis() as u64),
            _ => request.nack(format!("{} does not handle {request}", self.name())),
        }
    }
}
