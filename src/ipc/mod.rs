//! Inter-thread and inter-process messaging.
//!
//! - [`endpoint`]: `tcp://` and `inproc://` address parsing plus the default endpoints.
//! - [`message`]: the JSON message envelope and the frame ready notification.
//! - [`channel`]: pair/router/dealer channels over inproc queues or tcp sockets.
//! - [`reactor`]: the dispatch thread's event loop.

pub mod channel;
pub mod endpoint;
pub mod message;
pub mod reactor;

pub use channel::{ChannelType, Envelope, IpcChannel, IpcContext, PeerId, BOUND_PEER};
pub use endpoint::{
    Endpoint, DEFAULT_CTRL_ENDPOINT, DEFAULT_NOTIFY_ENDPOINT, DEFAULT_RX_CHANNEL_ENDPOINT,
};
pub use message::{IpcMessage, MsgType, MsgVal, ReadyNotification};
pub use reactor::{
    ChannelCallback, IpcReactor, Reactor, ReactorStopHandle, TimerCallback, TimerId, DEFAULT_TICK,
};
