//! CameraLink frame decoder.
//!
//! Binds the control channel on the dispatch thread, runs the backend's capture
//! loop on an acquisition thread, and exposes the empty-buffer queue both
//! threads share.
//!
//! # Start sequence
//!
//! The caller (the RX thread) binds the notify endpoint and registers it with
//! its reactor first. [`start_service`](CameraLinkDecoder::start_service) then:
//!
//! 1. binds the control channel, failing fast on a bad or busy endpoint;
//! 2. registers the control channel with the reactor;
//! 3. spawns the acquisition thread, which connects to the notify endpoint.
//!
//! Nothing is spawned until the notify endpoint is bound and both channels are
//! registered, so the acquisition thread can never connect to an endpoint that
//! does not exist yet. If the connect still fails (e.g. the caller passed the
//! wrong endpoint) the thread reports it and the next
//! [`poll_service`](CameraLinkDecoder::poll_service) returns the error.

use super::acquisition::{AcquisitionStatus, AcquisitionThread};
use super::{BufferQueue, CameraBackend, ServiceState};
use crate::config::DecoderConfig;
use crate::error::DecoderError;
use crate::ipc::{
    ChannelType, Endpoint, IpcChannel, IpcContext, IpcMessage, MsgType, Reactor,
    DEFAULT_CTRL_ENDPOINT,
};
use shared_buffer::{BufferAddress, BufferId, SharedBufferManager};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Decoder for CameraLink-style frame grabbers, generic over the hardware backend.
pub struct CameraLinkDecoder<B: CameraBackend> {
    backend: Arc<B>,
    context: IpcContext,
    ctrl_endpoint: String,
    ctrl_channel: Option<IpcChannel>,
    buffers: Arc<BufferQueue>,
    running: Arc<AtomicBool>,
    acquisition: Option<AcquisitionThread>,
    state: ServiceState,
    last_error: Option<String>,
    frames_captured: u64,
}

impl<B: CameraBackend> CameraLinkDecoder<B> {
    /// Create a stopped decoder using the default control endpoint.
    pub fn new(backend: B, buffer_manager: Arc<SharedBufferManager>, context: &IpcContext) -> Self {
        Self {
            backend: Arc::new(backend),
            context: context.clone(),
            ctrl_endpoint: DEFAULT_CTRL_ENDPOINT.to_string(),
            ctrl_channel: None,
            buffers: Arc::new(BufferQueue::new(buffer_manager)),
            running: Arc::new(AtomicBool::new(false)),
            acquisition: None,
            state: ServiceState::Stopped,
            last_error: None,
            frames_captured: 0,
        }
    }

    /// Apply configuration. Only allowed while stopped.
    pub fn init(&mut self, config: &DecoderConfig) -> Result<(), DecoderError> {
        if self.state != ServiceState::Stopped {
            return Err(DecoderError::InvalidState(self.state.as_str()));
        }
        Endpoint::parse(&config.ctrl_endpoint).map_err(|e| {
            DecoderError::Configuration(format!("ctrl_endpoint: {e}"))
        })?;
        self.ctrl_endpoint.clone_from(&config.ctrl_endpoint);
        debug!(ctrl_endpoint = %self.ctrl_endpoint, "Decoder configured");
        Ok(())
    }

    /// Bind and register the control channel, then spawn the acquisition thread.
    ///
    /// `notify_endpoint` must already be bound and registered by the caller.
    /// Returns once the thread is spawned; the connect outcome is observed
    /// through [`poll_service`](Self::poll_service).
    pub fn start_service<C, R>(
        &mut self,
        notify_endpoint: &str,
        reactor: &mut R,
    ) -> Result<(), DecoderError>
    where
        C: AsMut<CameraLinkDecoder<B>> + 'static,
        R: Reactor<C> + ?Sized,
    {
        if self.state != ServiceState::Stopped {
            return Err(DecoderError::InvalidState(self.state.as_str()));
        }

        let mut ctrl = IpcChannel::new(ChannelType::Router, &self.context);
        ctrl.bind(&self.ctrl_endpoint).map_err(|source| {
            error!(endpoint = %self.ctrl_endpoint, error = %source, "Binding control channel failed");
            DecoderError::ControlBind {
                endpoint: self.ctrl_endpoint.clone(),
                source,
            }
        })?;
        reactor.register_channel(
            &ctrl,
            Box::new(|state: &mut C| state.as_mut().handle_ctrl_channel()),
        )?;

        self.running.store(true, Ordering::Release);
        let spawned = AcquisitionThread::spawn(
            Arc::clone(&self.backend),
            &self.context,
            notify_endpoint,
            Arc::clone(&self.running),
            Arc::clone(&self.buffers),
        );
        let acquisition = match spawned {
            Ok(acquisition) => acquisition,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                reactor.deregister_channel(&self.ctrl_endpoint);
                return Err(e);
            }
        };

        info!(
            backend = self.backend.name(),
            ctrl_endpoint = %self.ctrl_endpoint,
            notify_endpoint,
            "Decoder service started"
        );
        self.ctrl_channel = Some(ctrl);
        self.acquisition = Some(acquisition);
        self.last_error = None;
        self.frames_captured = 0;
        self.state = ServiceState::Starting;
        Ok(())
    }

    /// Stop the acquisition thread and release the control channel.
    ///
    /// Blocks until the thread has joined, i.e. up to one capture-loop
    /// iteration. Stopping a stopped decoder does nothing.
    pub fn stop_service(&mut self) {
        if self.state == ServiceState::Stopped && self.acquisition.is_none() {
            debug!("Decoder service already stopped");
            return;
        }
        if let Some(e) = self.shutdown() {
            warn!(backend = self.backend.name(), error = %e, "Acquisition failure found while stopping");
        }
    }

    /// Join the acquisition thread and close the control channel, returning the
    /// first failure the thread reported but nobody had read yet.
    fn shutdown(&mut self) -> Option<DecoderError> {
        self.state = ServiceState::Stopping;
        self.running.store(false, Ordering::Release);

        let mut failure = None;
        if let Some(acquisition) = self.acquisition.take() {
            match acquisition.join() {
                Ok(pending) => {
                    for status in pending {
                        if let Some(e) = self.apply_status(status) {
                            failure.get_or_insert(e);
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Acquisition thread did not exit cleanly");
                    self.last_error = Some(e.to_string());
                    failure.get_or_insert(e);
                }
            }
        }

        // Dropping the channel closes it; the reactor prunes it on its next pass.
        if self.ctrl_channel.take().is_some() {
            debug!(endpoint = %self.ctrl_endpoint, "Control channel closed");
        }
        self.state = ServiceState::Stopped;
        info!(backend = self.backend.name(), frames = self.frames_captured, "Decoder service stopped");
        failure
    }

    /// Process status reports from the acquisition thread.
    ///
    /// Call periodically from the dispatch thread. A connect or capture failure
    /// stops the service and is returned here; the message stays available
    /// from [`last_error`](Self::last_error).
    pub fn poll_service(&mut self) -> Result<ServiceState, DecoderError> {
        while let Some(status) = self.acquisition.as_ref().and_then(AcquisitionThread::try_status) {
            if let Some(e) = self.apply_status(status) {
                let _ = self.shutdown();
                return Err(e);
            }
        }

        let finished = self
            .acquisition
            .as_ref()
            .is_some_and(AcquisitionThread::is_finished);
        if finished {
            // Capture loop returned on its own.
            if let Some(e) = self.shutdown() {
                return Err(e);
            }
        }
        Ok(self.state)
    }

    /// Apply one status report, returning the error if it was a failure.
    fn apply_status(&mut self, status: AcquisitionStatus) -> Option<DecoderError> {
        match status {
            AcquisitionStatus::Connected => {
                if self.state == ServiceState::Starting {
                    self.state = ServiceState::Running;
                    info!(backend = self.backend.name(), "Decoder service running");
                }
                None
            }
            AcquisitionStatus::Exited { frames } => {
                self.frames_captured = frames;
                None
            }
            AcquisitionStatus::Failed(e) => {
                error!(backend = self.backend.name(), error = %e, "Acquisition failed");
                self.last_error = Some(e.to_string());
                Some(e)
            }
        }
    }

    /// Answer one pending control request. Invoked by the reactor.
    pub fn handle_ctrl_channel(&mut self) {
        let Some(ctrl) = self.ctrl_channel.as_ref() else {
            return;
        };
        let Some(envelope) = ctrl.try_recv() else {
            return;
        };

        let request = match IpcMessage::decode(&envelope.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = envelope.peer, error = %e, "Dropping malformed control message");
                return;
            }
        };
        debug!(peer = envelope.peer, message = %request, "Control request");

        let reply = if request.msg_type() != MsgType::Cmd {
            request.nack(format!("expected a command, got {request}"))
        } else if self.state != ServiceState::Running {
            request.nack(format!("decoder service is {}", self.state))
        } else {
            self.backend.handle_control(&request)
        };

        let sent = reply
            .encode()
            .and_then(|bytes| ctrl.send_to(envelope.peer, bytes));
        if let Err(e) = sent {
            warn!(peer = envelope.peer, error = %e, "Failed to send control reply");
        }
    }

    /// Return a buffer to the empty queue for the acquisition thread to fill.
    pub fn push_empty_buffer(&self, id: BufferId) -> Result<(), DecoderError> {
        if !self.buffers.manager().contains(id) {
            return Err(DecoderError::UnknownBuffer(id));
        }
        self.buffers.push(id);
        Ok(())
    }

    /// Take a free buffer, if any.
    #[must_use]
    pub fn try_take_empty_buffer(&self) -> Option<(BufferId, BufferAddress<'_>)> {
        self.buffers.try_pop()
    }

    /// Free buffers waiting to be filled
    #[must_use]
    pub fn empty_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Current lifecycle state
    #[must_use]
    pub fn service_state(&self) -> ServiceState {
        self.state
    }

    /// Message of the most recent acquisition failure, cleared on start.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Endpoint the control channel binds to
    #[must_use]
    pub fn ctrl_endpoint(&self) -> &str {
        &self.ctrl_endpoint
    }

    /// Frames the last completed capture loop announced.
    #[must_use]
    pub fn frames_captured(&self) -> u64 {
        self.frames_captured
    }

    /// Hardware backend
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Pool the buffer ids refer to
    #[must_use]
    pub fn buffer_manager(&self) -> &Arc<SharedBufferManager> {
        self.buffers.manager()
    }
}

impl<B: CameraBackend> AsMut<CameraLinkDecoder<B>> for CameraLinkDecoder<B> {
    fn as_mut(&mut self) -> &mut CameraLinkDecoder<B> {
        self
    }
}

impl<B: CameraBackend> Drop for CameraLinkDecoder<B> {
    fn drop(&mut self) {
        self.stop_service();
    }
}

impl<B: CameraBackend> std::fmt::Debug for CameraLinkDecoder<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraLinkDecoder")
            .field("backend", &self.backend.name())
            .field("ctrl_endpoint", &self.ctrl_endpoint)
            .field("state", &self.state)
            .field("empty_buffers", &self.buffers.len())
            .finish()
    }
}
