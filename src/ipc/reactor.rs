//! Single-threaded event loop for the dispatch thread.
//!
//! The reactor waits on every registered channel at once and invokes the
//! channel's callback on the thread that called [`IpcReactor::run`]. Callbacks
//! receive `&mut C`, the state owned by that thread, so a handler can reach the
//! decoder or the pipeline channel without shared ownership.
//!
//! # Semantics
//!
//! - **Level-triggered:** a channel with pending messages is reported ready on
//!   every pass until it is drained. A callback should consume one message; if
//!   more are pending it is called again on the next pass.
//! - **Bounded waits:** each pass waits at most `tick` or until the next timer
//!   deadline, whichever is sooner, so timers keep firing when channels are idle.
//! - **Pruning:** channels that have been closed (typically dropped by their
//!   owner) are removed before each wait.

use super::channel::{Envelope, IpcChannel};
use crate::error::IpcError;
use crossbeam_channel::{bounded, Receiver, Select, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Default upper bound on a single reactor wait.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Callback invoked when a registered channel is readable.
pub type ChannelCallback<C> = Box<dyn FnMut(&mut C)>;

/// Callback invoked when a timer fires.
pub type TimerCallback<C> = Box<dyn FnMut(&mut C)>;

/// Identifier returned by [`IpcReactor::register_timer`].
pub type TimerId = u64;

/// Channel registration seam used by decoders.
///
/// [`IpcReactor`] is the production implementation; tests substitute a
/// recording double to check the order of registrations.
pub trait Reactor<C> {
    /// Invoke `callback` whenever `channel` has a message pending.
    fn register_channel(
        &mut self,
        channel: &IpcChannel,
        callback: ChannelCallback<C>,
    ) -> Result<(), IpcError>;

    /// Stop watching the channel attached to `endpoint`. Returns whether it was registered.
    fn deregister_channel(&mut self, endpoint: &str) -> bool;
}

struct ChannelEntry<C> {
    endpoint: String,
    readiness: Receiver<Envelope>,
    closed: Arc<AtomicBool>,
    callback: ChannelCallback<C>,
}

struct TimerEntry<C> {
    id: TimerId,
    interval: Duration,
    deadline: Instant,
    /// Remaining firings, `None` for a repeating timer.
    remaining: Option<usize>,
    callback: TimerCallback<C>,
}

/// Stops a running reactor from any thread.
#[derive(Clone)]
pub struct ReactorStopHandle {
    stop: Arc<AtomicBool>,
    waker: Sender<()>,
}

impl ReactorStopHandle {
    /// Request the reactor to return from `run` after the current pass.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.waker.try_send(());
    }

    /// Whether a stop has been requested
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Channel and timer reactor driven by [`run`](Self::run).
pub struct IpcReactor<C> {
    channels: Vec<ChannelEntry<C>>,
    timers: Vec<TimerEntry<C>>,
    next_timer_id: TimerId,
    tick: Duration,
    stop: Arc<AtomicBool>,
    waker_tx: Sender<()>,
    waker_rx: Receiver<()>,
}

impl<C> Default for IpcReactor<C> {
    fn default() -> Self {
        Self::new(DEFAULT_TICK)
    }
}

impl<C> IpcReactor<C> {
    /// Create a reactor whose waits are bounded by `tick`.
    #[must_use]
    pub fn new(tick: Duration) -> Self {
        let (waker_tx, waker_rx) = bounded(1);
        Self {
            channels: Vec::new(),
            timers: Vec::new(),
            next_timer_id: 1,
            tick: tick.max(Duration::from_millis(1)),
            stop: Arc::new(AtomicBool::new(false)),
            waker_tx,
            waker_rx,
        }
    }

    /// Handle that stops this reactor from any thread
    #[must_use]
    pub fn stop_handle(&self) -> ReactorStopHandle {
        ReactorStopHandle {
            stop: Arc::clone(&self.stop),
            waker: self.waker_tx.clone(),
        }
    }

    /// Fire `callback` every `interval`; `times == 0` repeats until removed.
    pub fn register_timer(
        &mut self,
        interval: Duration,
        times: usize,
        callback: TimerCallback<C>,
    ) -> TimerId {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timers.push(TimerEntry {
            id,
            interval,
            deadline: Instant::now() + interval,
            remaining: (times > 0).then_some(times),
            callback,
        });
        debug!(timer = id, interval_ms = interval.as_millis() as u64, "Timer registered");
        id
    }

    /// Remove a timer. Returns whether it was still registered.
    pub fn remove_timer(&mut self, id: TimerId) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.id != id);
        before != self.timers.len()
    }

    /// Whether an open channel is registered under `endpoint`.
    #[must_use]
    pub fn is_registered(&self, endpoint: &str) -> bool {
        self.channels
            .iter()
            .any(|c| c.endpoint == endpoint && !c.closed.load(Ordering::Acquire))
    }

    /// Number of registered channels
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of pending timers
    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Run until stopped or until nothing is left to wait on.
    pub fn run(&mut self, state: &mut C) {
        debug!("Reactor started");
        while !self.stop.load(Ordering::Acquire) {
            self.prune_closed();
            if self.channels.is_empty() && self.timers.is_empty() {
                debug!("Reactor has nothing to wait on");
                break;
            }
            self.run_once(state);
        }
        debug!("Reactor stopped");
    }

    /// One pass: fire due timers, wait for readiness, dispatch at most one channel.
    pub fn run_once(&mut self, state: &mut C) {
        self.prune_closed();
        self.fire_timers(state);
        if self.stop.load(Ordering::Acquire) {
            return;
        }

        let wait = self.next_wait();
        let ready = {
            let mut sel = Select::new();
            for entry in &self.channels {
                sel.recv(&entry.readiness);
            }
            let waker_index = sel.recv(&self.waker_rx);
            match sel.ready_timeout(wait) {
                Ok(index) if index == waker_index => {
                    let _ = self.waker_rx.try_recv();
                    None
                }
                Ok(index) => Some(index),
                Err(_) => None,
            }
        };

        if let Some(index) = ready {
            let entry = &mut self.channels[index];
            trace!(endpoint = %entry.endpoint, "Channel readable");
            (entry.callback)(state);
        }
    }

    fn fire_timers(&mut self, state: &mut C) {
        let now = Instant::now();
        for timer in &mut self.timers {
            if timer.deadline > now {
                continue;
            }
            (timer.callback)(state);
            timer.deadline = now + timer.interval;
            if let Some(remaining) = timer.remaining.as_mut() {
                *remaining -= 1;
            }
        }
        self.timers.retain(|t| t.remaining != Some(0));
    }

    fn next_wait(&self) -> Duration {
        let now = Instant::now();
        self.timers
            .iter()
            .map(|t| t.deadline.saturating_duration_since(now))
            .fold(self.tick, Duration::min)
    }

    fn prune_closed(&mut self) {
        self.channels.retain(|entry| {
            let open = !entry.closed.load(Ordering::Acquire);
            if !open {
                debug!(endpoint = %entry.endpoint, "Pruning closed channel");
            }
            open
        });
    }
}

impl<C> Reactor<C> for IpcReactor<C> {
    fn register_channel(
        &mut self,
        channel: &IpcChannel,
        callback: ChannelCallback<C>,
    ) -> Result<(), IpcError> {
        let endpoint = channel.endpoint().ok_or(IpcError::NotConnected)?;
        // A channel closed since the last pass no longer holds its endpoint.
        self.prune_closed();
        if self.is_registered(&endpoint) {
            return Err(IpcError::AlreadyRegistered(endpoint));
        }
        debug!(endpoint = %endpoint, "Channel registered");
        self.channels.push(ChannelEntry {
            endpoint,
            readiness: channel.readiness(),
            closed: channel.closed_flag(),
            callback,
        });
        Ok(())
    }

    fn deregister_channel(&mut self, endpoint: &str) -> bool {
        let before = self.channels.len();
        self.channels.retain(|c| c.endpoint != endpoint);
        let removed = before != self.channels.len();
        if removed {
            debug!(endpoint, "Channel deregistered");
        }
        removed
    }
}
