//! Frame receiver RX (dispatch) thread.
//!
//! The RX thread owns the reactor, the pipeline channel to the rest of the
//! receiver, the bound end of the notify channel and, through the decoder, the
//! control channel. Start-up runs entirely on the RX thread in this order:
//!
//! 1. connect the pipeline channel and register it;
//! 2. bind the notify channel and register it;
//! 3. `decoder.start_service(notify_endpoint, reactor)`;
//! 4. register the housekeeping tick.
//!
//! [`FrameReceiverRxThread::start`] blocks until these steps have succeeded or
//! one of them has failed, and returns the failure.
//!
//! # Pipeline protocol
//!
//! Outbound: every `notify/frame_ready` received from the acquisition thread is
//! forwarded unchanged. Inbound commands:
//!
//! | Command                                | Effect                          | Reply |
//! | :------------------------------------- | :------------------------------ | :---- |
//! | `buffer_release {buffer_id}`           | return buffer to the empty queue | nack on error only |
//! | `buffer_precharge {start, count}`      | queue a range of buffers        | ack `{count}` |
//! | `status`                               | none                            | ack echoing params + counters |
//! | `reset_statistics`                     | zero the counters               | ack |

use crate::config::{ReceiverConfig, RxConfig};
use crate::decoder::{CameraBackend, CameraLinkDecoder, ServiceState};
use crate::error::{AppResult, ReceiverError};
use crate::ipc::{
    ChannelType, IpcChannel, IpcContext, IpcMessage, IpcReactor, MsgType, MsgVal, Reactor,
    ReactorStopHandle,
};
use crossbeam_channel::bounded;
use shared_buffer::BufferId;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// State owned by the RX thread and handed to every reactor callback.
pub struct FrameReceiverRxThread<B: CameraBackend> {
    decoder: CameraLinkDecoder<B>,
    rx_channel: IpcChannel,
    notify_channel: IpcChannel,
    decoder_state: ServiceState,
    frames_relayed: u64,
    notify_errors: u64,
}

impl<B: CameraBackend> AsMut<CameraLinkDecoder<B>> for FrameReceiverRxThread<B> {
    fn as_mut(&mut self) -> &mut CameraLinkDecoder<B> {
        &mut self.decoder
    }
}

impl<B: CameraBackend> FrameReceiverRxThread<B> {
    /// Spawn the RX thread and wait for its start-up to finish.
    ///
    /// The pipeline endpoint (`rx.rx_channel_endpoint`) must already be bound
    /// by the downstream consumer. The decoder should have been `init`ed.
    pub fn start(
        config: &ReceiverConfig,
        context: &IpcContext,
        decoder: CameraLinkDecoder<B>,
    ) -> AppResult<RxThreadHandle> {
        let rx_config = config.rx.clone();
        let context = context.clone();
        let (init_tx, init_rx) = bounded::<AppResult<ReactorStopHandle>>(1);

        let thread = thread::Builder::new()
            .name("rx-thread".to_string())
            .spawn(move || {
                let mut reactor = IpcReactor::new(rx_config.tick_period());
                match Self::init(&rx_config, &context, decoder, &mut reactor) {
                    Ok(mut state) => {
                        let _ = init_tx.send(Ok(reactor.stop_handle()));
                        reactor.run(&mut state);
                        state.cleanup();
                    }
                    Err(e) => {
                        error!(error = %e, "RX thread initialisation failed");
                        let _ = init_tx.send(Err(e));
                    }
                }
            })?;

        let handle = |stop| RxThreadHandle {
            stop,
            thread: Some(thread),
        };
        match init_rx.recv() {
            Ok(Ok(stop)) => {
                info!("RX thread started");
                Ok(handle(Some(stop)))
            }
            Ok(Err(e)) => {
                let _ = handle(None).stop();
                Err(e)
            }
            Err(_) => {
                handle(None).stop()?;
                Err(ReceiverError::RxThreadInit(
                    "RX thread exited without reporting".to_string(),
                ))
            }
        }
    }

    fn init(
        config: &RxConfig,
        context: &IpcContext,
        mut decoder: CameraLinkDecoder<B>,
        reactor: &mut IpcReactor<Self>,
    ) -> AppResult<Self> {
        let mut rx_channel = IpcChannel::new(ChannelType::Pair, context);
        rx_channel.connect(&config.rx_channel_endpoint)?;
        reactor.register_channel(
            &rx_channel,
            Box::new(|state: &mut Self| state.handle_rx_channel()),
        )?;
        debug!(endpoint = %config.rx_channel_endpoint, "Pipeline channel connected");

        let mut notify_channel = IpcChannel::new(ChannelType::Pair, context);
        notify_channel.bind(&config.notify_endpoint)?;
        reactor.register_channel(
            &notify_channel,
            Box::new(|state: &mut Self| state.handle_notify_channel()),
        )?;
        debug!(endpoint = %config.notify_endpoint, "Notify channel bound");

        decoder.start_service(&config.notify_endpoint, reactor)?;

        reactor.register_timer(
            config.tick_period(),
            0,
            Box::new(|state: &mut Self| state.tick()),
        );

        Ok(Self {
            decoder_state: decoder.service_state(),
            decoder,
            rx_channel,
            notify_channel,
            frames_relayed: 0,
            notify_errors: 0,
        })
    }

    /// Forward one frame ready notification to the pipeline.
    fn handle_notify_channel(&mut self) {
        let Some(envelope) = self.notify_channel.try_recv() else {
            return;
        };

        match IpcMessage::decode(&envelope.payload) {
            Ok(message) if message.is(MsgType::Notify, MsgVal::FrameReady) => {
                if let Err(e) = self.rx_channel.send(envelope.payload) {
                    error!(error = %e, "Failed to forward frame ready notification");
                    return;
                }
                self.frames_relayed += 1;
                trace!(frames_relayed = self.frames_relayed, "Frame ready relayed");
            }
            Ok(message) => {
                self.notify_errors += 1;
                error!(%message, "Unexpected message on notify channel, dropping");
            }
            Err(e) => {
                self.notify_errors += 1;
                error!(error = %e, "Undecodable message on notify channel, dropping");
            }
        }
    }

    /// Handle one command from the pipeline.
    fn handle_rx_channel(&mut self) {
        let Some(envelope) = self.rx_channel.try_recv() else {
            return;
        };
        let request = match IpcMessage::decode(&envelope.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Dropping malformed pipeline message");
                return;
            }
        };

        let reply = if request.msg_type() != MsgType::Cmd {
            Some(request.nack(format!("expected a command, got {request}")))
        } else {
            match request.msg_val() {
                MsgVal::BufferRelease => self.release_buffer(&request),
                MsgVal::BufferPrecharge => Some(self.precharge_buffers(&request)),
                MsgVal::Status => Some(self.status_reply(&request)),
                MsgVal::ResetStatistics => {
                    self.frames_relayed = 0;
                    self.notify_errors = 0;
                    info!("Statistics reset");
                    Some(request.reply(MsgType::Ack))
                }
                _ => Some(request.nack(format!("unsupported command {request}"))),
            }
        };

        if let Some(reply) = reply {
            let sent = reply.encode().and_then(|bytes| self.rx_channel.send(bytes));
            if let Err(e) = sent {
                warn!(error = %e, "Failed to send pipeline reply");
            }
        }
    }

    fn release_buffer(&mut self, request: &IpcMessage) -> Option<IpcMessage> {
        let released = request
            .get_param::<BufferId>("buffer_id")
            .map_err(|e| e.to_string())
            .and_then(|id| {
                self.decoder
                    .push_empty_buffer(id)
                    .map(|()| id)
                    .map_err(|e| e.to_string())
            });
        match released {
            Ok(id) => {
                trace!(buffer_id = id, "Buffer released");
                None
            }
            Err(reason) => {
                warn!(%reason, "Buffer release rejected");
                Some(request.nack(reason))
            }
        }
    }

    fn precharge_buffers(&mut self, request: &IpcMessage) -> IpcMessage {
        let num_buffers = self.decoder.buffer_manager().num_buffers();
        let start: BufferId = request.get_param_or("start", 0);
        let count: usize = request.get_param_or("count", num_buffers.saturating_sub(start));

        let end = match start.checked_add(count) {
            Some(end) if end <= num_buffers => end,
            _ => {
                return request.nack(format!(
                    "buffers {start}..{start}+{count} exceed the {num_buffers} shared buffers"
                ))
            }
        };
        for id in start..end {
            if let Err(e) = self.decoder.push_empty_buffer(id) {
                return request.nack(e.to_string());
            }
        }
        info!(start, count, empty_buffers = self.decoder.empty_buffer_count(), "Buffers precharged");
        request.reply(MsgType::Ack).with_param("count", count)
    }

    fn status_reply(&self, request: &IpcMessage) -> IpcMessage {
        let mut reply = request
            .params()
            .iter()
            .fold(request.reply(MsgType::Ack), |reply, (name, value)| {
                reply.with_param(name, value.clone())
            })
            .with_param("decoder", self.decoder.backend().name())
            .with_param("state", self.decoder_state.as_str())
            .with_param("frames_relayed", self.frames_relayed)
            .with_param("notify_errors", self.notify_errors)
            .with_param("empty_buffers", self.decoder.empty_buffer_count());
        if let Some(last_error) = self.decoder.last_error() {
            reply = reply.with_param("last_error", last_error);
        }
        reply
    }

    /// Periodic housekeeping: observe acquisition thread status reports.
    fn tick(&mut self) {
        let previous = self.decoder_state;
        match self.decoder.poll_service() {
            Ok(state) => {
                if state != previous {
                    info!(from = %previous, to = %state, "Decoder state changed");
                }
                self.decoder_state = state;
            }
            Err(e) => {
                error!(error = %e, "Decoder service failed");
                self.decoder_state = self.decoder.service_state();
            }
        }
    }

    fn cleanup(&mut self) {
        self.decoder.stop_service();
        info!(
            frames_relayed = self.frames_relayed,
            notify_errors = self.notify_errors,
            "RX thread exiting"
        );
    }
}

/// Owner's handle on a running RX thread.
pub struct RxThreadHandle {
    stop: Option<ReactorStopHandle>,
    thread: Option<JoinHandle<()>>,
}

impl RxThreadHandle {
    /// Stop the reactor, stop the decoder service and join the RX thread.
    ///
    /// Calling this again after it has returned is a no-op.
    pub fn stop(&mut self) -> AppResult<()> {
        if let Some(stop) = self.stop.take() {
            stop.stop();
        }
        if let Some(thread) = self.thread.take() {
            thread.join().map_err(|_| ReceiverError::RxThreadPanicked)?;
            debug!("RX thread joined");
        }
        Ok(())
    }

    /// Whether the RX thread is still alive
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl std::fmt::Debug for RxThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxThreadHandle")
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for RxThreadHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(error = %e, "RX thread did not stop cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::CaptureContext;
    use crate::error::{DecoderError, IpcError};
    use crate::ipc::ReadyNotification;
    use shared_buffer::SharedBufferManager;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(2);

    /// Waits to be stopped without producing frames.
    struct IdleCamera;

    impl CameraBackend for IdleCamera {
        fn name(&self) -> &str {
            "idle"
        }

        fn run_capture_loop(&self, ctx: &mut CaptureContext) -> Result<(), DecoderError> {
            while ctx.is_running() {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        }
    }

    /// Returns immediately, releasing its end of the notify channel.
    struct OneShotCamera;

    impl CameraBackend for OneShotCamera {
        fn name(&self) -> &str {
            "one_shot"
        }

        fn run_capture_loop(&self, _ctx: &mut CaptureContext) -> Result<(), DecoderError> {
            Ok(())
        }
    }

    fn config(name: &str) -> ReceiverConfig {
        let mut config = ReceiverConfig::default();
        config.rx.rx_channel_endpoint = format!("inproc://{name}_rx");
        config.rx.notify_endpoint = format!("inproc://{name}_notify");
        config.rx.tick_period_ms = 10;
        config.decoder.ctrl_endpoint = format!("inproc://{name}_ctrl");
        config
    }

    struct Harness {
        ctx: IpcContext,
        pipeline: IpcChannel,
        handle: RxThreadHandle,
    }

    fn harness<B: CameraBackend>(name: &str, backend: B) -> Harness {
        let config = config(name);
        let ctx = IpcContext::new();
        let mut pipeline = IpcChannel::new(ChannelType::Pair, &ctx);
        pipeline.bind(&config.rx.rx_channel_endpoint).unwrap();

        let manager = Arc::new(SharedBufferManager::new(name, 8, 16).unwrap());
        let mut decoder = CameraLinkDecoder::new(backend, manager, &ctx);
        decoder.init(&config.decoder).unwrap();
        let handle = FrameReceiverRxThread::start(&config, &ctx, decoder).unwrap();
        Harness {
            ctx,
            pipeline,
            handle,
        }
    }

    fn request(pipeline: &IpcChannel, message: &IpcMessage) -> IpcMessage {
        pipeline.send(message.encode().unwrap()).unwrap();
        IpcMessage::decode(&pipeline.recv_timeout(WAIT).unwrap().payload).unwrap()
    }

    fn status(pipeline: &IpcChannel) -> IpcMessage {
        request(pipeline, &IpcMessage::new(MsgType::Cmd, MsgVal::Status))
    }

    /// Poll status until the decoder reports `want`.
    fn wait_for_state(pipeline: &IpcChannel, want: &str) {
        let deadline = Instant::now() + WAIT;
        loop {
            let state = status(pipeline).get_param::<String>("state").unwrap();
            if state == want {
                return;
            }
            assert!(Instant::now() < deadline, "decoder stuck in {state}");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn status_replies_echo_params_in_order() {
        let h = harness("status", IdleCamera);
        for count in 0..50 {
            let msg = IpcMessage::new(MsgType::Cmd, MsgVal::Status).with_param("count", count);
            h.pipeline.send(msg.encode().unwrap()).unwrap();
        }
        for count in 0..50 {
            let reply =
                IpcMessage::decode(&h.pipeline.recv_timeout(WAIT).unwrap().payload).unwrap();
            assert!(reply.is(MsgType::Ack, MsgVal::Status));
            assert_eq!(reply.get_param::<i64>("count").unwrap(), count);
            assert_eq!(reply.get_param::<String>("decoder").unwrap(), "idle");
        }
    }

    #[test]
    fn precharge_and_release_fill_the_empty_queue() {
        let h = harness("precharge", IdleCamera);
        let reply = request(
            &h.pipeline,
            &IpcMessage::new(MsgType::Cmd, MsgVal::BufferPrecharge)
                .with_param("start", 2)
                .with_param("count", 3),
        );
        assert!(reply.is(MsgType::Ack, MsgVal::BufferPrecharge));
        assert_eq!(reply.get_param::<usize>("count").unwrap(), 3);

        let release =
            IpcMessage::new(MsgType::Cmd, MsgVal::BufferRelease).with_param("buffer_id", 7);
        h.pipeline.send(release.encode().unwrap()).unwrap();
        assert_eq!(status(&h.pipeline).get_param::<usize>("empty_buffers").unwrap(), 4);

        let bad = request(
            &h.pipeline,
            &IpcMessage::new(MsgType::Cmd, MsgVal::BufferRelease).with_param("buffer_id", 99),
        );
        assert_eq!(bad.msg_type(), MsgType::Nack);

        let too_many = request(
            &h.pipeline,
            &IpcMessage::new(MsgType::Cmd, MsgVal::BufferPrecharge)
                .with_param("start", 6)
                .with_param("count", 5),
        );
        assert_eq!(too_many.msg_type(), MsgType::Nack);
    }

    #[test]
    fn unsupported_commands_are_nacked() {
        let h = harness("unsupported", IdleCamera);
        let reply = request(&h.pipeline, &IpcMessage::new(MsgType::Cmd, MsgVal::Configure));
        assert!(reply.is(MsgType::Nack, MsgVal::Configure));
        let reply = request(&h.pipeline, &IpcMessage::new(MsgType::Notify, MsgVal::Status));
        assert_eq!(reply.msg_type(), MsgType::Nack);
    }

    #[test]
    fn decoder_reaches_running_via_tick() {
        let h = harness("tick", IdleCamera);
        wait_for_state(&h.pipeline, "running");
    }

    #[test]
    fn reset_statistics_zeroes_counters() {
        let h = harness("reset", IdleCamera);
        let reply = request(&h.pipeline, &IpcMessage::new(MsgType::Cmd, MsgVal::ResetStatistics));
        assert!(reply.is(MsgType::Ack, MsgVal::ResetStatistics));
        assert_eq!(status(&h.pipeline).get_param::<u64>("frames_relayed").unwrap(), 0);
    }

    #[test]
    fn relay_forwards_frames_verbatim_and_drops_everything_else() {
        let h = harness("relay", OneShotCamera);
        // The capture loop has returned and released the notify peer slot.
        wait_for_state(&h.pipeline, "stopped");

        let mut injector = IpcChannel::new(ChannelType::Pair, &h.ctx);
        injector.connect("inproc://relay_notify").unwrap();

        let first = ReadyNotification::new(0, 0).to_message().encode().unwrap();
        let second = ReadyNotification::new(1, 1).to_message().encode().unwrap();
        let stray = IpcMessage::new(MsgType::Notify, MsgVal::Status).encode().unwrap();
        injector.send(first.clone()).unwrap();
        injector.send(stray).unwrap();
        injector.send(&b"\x00not json"[..]).unwrap();
        injector.send(second.clone()).unwrap();

        assert_eq!(h.pipeline.recv_timeout(WAIT).unwrap().payload, first);
        assert_eq!(h.pipeline.recv_timeout(WAIT).unwrap().payload, second);

        let reply = status(&h.pipeline);
        assert_eq!(reply.get_param::<u64>("frames_relayed").unwrap(), 2);
        assert_eq!(reply.get_param::<u64>("notify_errors").unwrap(), 2);
    }

    #[test]
    fn stop_is_idempotent_and_releases_endpoints() {
        let mut h = harness("stop", IdleCamera);
        h.handle.stop().unwrap();
        h.handle.stop().unwrap();
        assert!(!h.handle.is_running());
        assert!(!h.ctx.is_bound("stop_notify"));
        assert!(!h.ctx.is_bound("stop_ctrl"));
        assert_eq!(h.pipeline.peer_count(), 0);
    }

    #[test]
    fn start_fails_when_pipeline_is_not_bound() {
        let config = config("unbound");
        let ctx = IpcContext::new();
        let manager = Arc::new(SharedBufferManager::new("unbound", 2, 16).unwrap());
        let decoder = CameraLinkDecoder::new(IdleCamera, manager, &ctx);
        let result = FrameReceiverRxThread::start(&config, &ctx, decoder);
        assert!(matches!(
            result,
            Err(ReceiverError::Ipc(IpcError::ConnectionRefused { .. }))
        ));
    }

    #[test]
    fn start_fails_when_control_endpoint_is_taken() {
        let config = config("taken");
        let ctx = IpcContext::new();
        let mut pipeline = IpcChannel::new(ChannelType::Pair, &ctx);
        pipeline.bind(&config.rx.rx_channel_endpoint).unwrap();
        let mut squatter = IpcChannel::new(ChannelType::Router, &ctx);
        squatter.bind(&config.decoder.ctrl_endpoint).unwrap();

        let manager = Arc::new(SharedBufferManager::new("taken", 2, 16).unwrap());
        let mut decoder = CameraLinkDecoder::new(IdleCamera, manager, &ctx);
        decoder.init(&config.decoder).unwrap();
        let err = FrameReceiverRxThread::start(&config, &ctx, decoder).unwrap_err();
        assert!(err
            .to_string()
            .contains("Binding control channel endpoint inproc://taken_ctrl failed"));
        assert!(!ctx.is_bound("taken_notify"));
        assert_eq!(pipeline.peer_count(), 0);
    }
}
