//! Downstream consumer of ready frames.
//!
//! [`FrameSink`] sits on the far end of the RX thread's pipeline channel. It
//! precharges the decoder's empty-buffer queue, takes each `frame_ready`
//! notification, checks the buffer header against the announced frame number
//! and hands the buffer straight back with `buffer_release`.

use crate::decoder::simulated::frame_number_of;
use crate::decoder::ServiceState;
use crate::error::{AppResult, IpcError};
use crate::ipc::{
    ChannelType, IpcChannel, IpcContext, IpcMessage, MsgType, MsgVal, ReadyNotification,
};
use shared_buffer::SharedBufferManager;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Something received on the pipeline channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    /// A frame was consumed and its buffer released.
    Frame(ReadyNotification),
    /// Reply to a command sent by the sink.
    Reply(IpcMessage),
    /// A status reply showed the decoder stopped; no more frames will arrive.
    DecoderStopped {
        /// Acquisition failure that stopped it, if any.
        last_error: Option<String>,
    },
}

/// Binds the pipeline endpoint and consumes frames from the RX thread.
pub struct FrameSink {
    channel: IpcChannel,
    manager: Arc<SharedBufferManager>,
    frames_received: u64,
    header_mismatches: u64,
}

impl FrameSink {
    /// Bind `endpoint` so the RX thread can connect to it.
    pub fn bind(
        endpoint: &str,
        context: &IpcContext,
        manager: Arc<SharedBufferManager>,
    ) -> Result<Self, IpcError> {
        let mut channel = IpcChannel::new(ChannelType::Pair, context);
        channel.bind(endpoint)?;
        debug!(endpoint, "Frame sink bound");
        Ok(Self {
            channel,
            manager,
            frames_received: 0,
            header_mismatches: 0,
        })
    }

    /// Ask the RX thread to queue buffers `start..start + count` for filling.
    pub fn precharge(&self, start: usize, count: usize) -> Result<(), IpcError> {
        self.send(
            &IpcMessage::new(MsgType::Cmd, MsgVal::BufferPrecharge)
                .with_param("start", start)
                .with_param("count", count),
        )
    }

    /// Ask the RX thread for its status; the reply arrives as [`SinkEvent::Reply`].
    pub fn request_status(&self) -> Result<(), IpcError> {
        self.send(&IpcMessage::new(MsgType::Cmd, MsgVal::Status))
    }

    fn send(&self, message: &IpcMessage) -> Result<(), IpcError> {
        self.channel.send(message.encode()?)
    }

    /// Wait up to `timeout` for the next event. `Ok(None)` on timeout.
    pub fn next_event(&mut self, timeout: Duration) -> AppResult<Option<SinkEvent>> {
        let envelope = match self.channel.recv_timeout(timeout) {
            Ok(envelope) => envelope,
            Err(IpcError::Timeout) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let message = IpcMessage::decode(&envelope.payload)?;
        if !message.is(MsgType::Notify, MsgVal::FrameReady) {
            if decoder_stopped(&message) {
                let last_error = message.get_param::<String>("last_error").ok();
                debug!(last_error = ?last_error, "Decoder reported stopped");
                return Ok(Some(SinkEvent::DecoderStopped { last_error }));
            }
            trace!(%message, "Pipeline reply");
            return Ok(Some(SinkEvent::Reply(message)));
        }

        let ready = ReadyNotification::from_message(&message)?;
        self.consume(ready);
        self.send(
            &IpcMessage::new(MsgType::Cmd, MsgVal::BufferRelease)
                .with_param("buffer_id", ready.buffer_id),
        )?;
        Ok(Some(SinkEvent::Frame(ready)))
    }

    fn consume(&mut self, ready: ReadyNotification) {
        self.frames_received += 1;
        let Some(addr) = self.manager.buffer_address(ready.buffer_id) else {
            warn!(buffer_id = ready.buffer_id, "Frame ready for unknown buffer");
            return;
        };
        // SAFETY: the buffer was handed over by the notification and is not
        // released back to the acquisition thread until after this read.
        let header = frame_number_of(unsafe { addr.as_slice() });
        if header.is_some_and(|frame| frame != ready.frame_number) {
            self.header_mismatches += 1;
            warn!(
                buffer_id = ready.buffer_id,
                frame = ready.frame_number,
                header = ?header,
                "Frame header does not match notification"
            );
        }
        trace!(buffer_id = ready.buffer_id, frame = ready.frame_number, "Frame consumed");
    }

    /// Frames consumed so far
    #[must_use]
    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    /// Frames whose buffer header disagreed with the announced frame number.
    #[must_use]
    pub fn header_mismatches(&self) -> u64 {
        self.header_mismatches
    }

    /// Whether the RX thread has connected to the pipeline endpoint
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.channel.peer_count() > 0
    }
}

fn decoder_stopped(message: &IpcMessage) -> bool {
    message.is(MsgType::Ack, MsgVal::Status)
        && message
            .get_param::<String>("state")
            .is_ok_and(|state| state == ServiceState::Stopped.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::simulated::fill_pattern;

    struct Fixture {
        sink: FrameSink,
        rx: IpcChannel,
        manager: Arc<SharedBufferManager>,
    }

    fn fixture(name: &str) -> Fixture {
        let ctx = IpcContext::new();
        let manager = Arc::new(SharedBufferManager::new(name, 4, 64).unwrap());
        let endpoint = format!("inproc://{name}");
        let sink = FrameSink::bind(&endpoint, &ctx, Arc::clone(&manager)).unwrap();
        let mut rx = IpcChannel::new(ChannelType::Pair, &ctx);
        rx.connect(&endpoint).unwrap();
        Fixture { sink, rx, manager }
    }

    fn recv(rx: &IpcChannel) -> IpcMessage {
        IpcMessage::decode(&rx.recv_timeout(Duration::from_secs(2)).unwrap().payload).unwrap()
    }

    #[test]
    fn frame_is_checked_and_released() {
        let mut f = fixture("sink_frame");
        let mut addr = f.manager.buffer_address(2).unwrap();
        fill_pattern(unsafe { addr.as_mut_slice() }, 9);

        let ready = ReadyNotification::new(2, 9);
        f.rx.send(ready.to_message().encode().unwrap()).unwrap();
        let event = f.sink.next_event(Duration::from_secs(2)).unwrap();
        assert_eq!(event, Some(SinkEvent::Frame(ready)));

        let release = recv(&f.rx);
        assert!(release.is(MsgType::Cmd, MsgVal::BufferRelease));
        assert_eq!(release.get_param::<usize>("buffer_id").unwrap(), 2);
        assert_eq!(f.sink.frames_received(), 1);
        assert_eq!(f.sink.header_mismatches(), 0);
    }

    #[test]
    fn header_mismatch_is_counted() {
        let mut f = fixture("sink_mismatch");
        let mut addr = f.manager.buffer_address(0).unwrap();
        fill_pattern(unsafe { addr.as_mut_slice() }, 1);

        f.rx.send(ReadyNotification::new(0, 2).to_message().encode().unwrap())
            .unwrap();
        f.sink.next_event(Duration::from_secs(2)).unwrap();
        assert_eq!(f.sink.header_mismatches(), 1);
    }

    #[test]
    fn replies_and_timeouts_are_reported() {
        let mut f = fixture("sink_reply");
        assert_eq!(f.sink.next_event(Duration::from_millis(10)).unwrap(), None);

        f.sink.precharge(0, 4).unwrap();
        let precharge = recv(&f.rx);
        assert!(precharge.is(MsgType::Cmd, MsgVal::BufferPrecharge));
        assert_eq!(precharge.get_param::<usize>("count").unwrap(), 4);

        let ack = IpcMessage::new(MsgType::Ack, MsgVal::Status);
        f.rx.send(ack.encode().unwrap()).unwrap();
        match f.sink.next_event(Duration::from_secs(2)).unwrap() {
            Some(SinkEvent::Reply(reply)) => assert!(reply.is(MsgType::Ack, MsgVal::Status)),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(f.sink.is_connected());
    }

    #[test]
    fn stopped_status_ends_the_stream() {
        let mut f = fixture("sink_stopped");
        let running = IpcMessage::new(MsgType::Ack, MsgVal::Status).with_param("state", "running");
        f.rx.send(running.encode().unwrap()).unwrap();
        assert!(matches!(
            f.sink.next_event(Duration::from_secs(2)).unwrap(),
            Some(SinkEvent::Reply(_))
        ));

        let failed = IpcMessage::new(MsgType::Ack, MsgVal::Status)
            .with_param("state", "stopped")
            .with_param("last_error", "camera unplugged");
        f.rx.send(failed.encode().unwrap()).unwrap();
        assert_eq!(
            f.sink.next_event(Duration::from_secs(2)).unwrap(),
            Some(SinkEvent::DecoderStopped {
                last_error: Some("camera unplugged".to_string())
            })
        );
    }
}
