//! Channel endpoint addresses.
//!
//! Two transports are understood:
//!
//! - `tcp://<host>:<port>`: a real socket. `*` as host means "all interfaces"
//!   and is only meaningful when binding.
//! - `inproc://<name>`: an in-process rendezvous point scoped to an
//!   [`IpcContext`](super::IpcContext).

use crate::error::IpcError;
use std::fmt;
use std::str::FromStr;

/// Default bind address of a CameraLink decoder's control channel.
pub const DEFAULT_CTRL_ENDPOINT: &str = "tcp://*:5060";

/// Default endpoint used for acquisition-to-dispatch frame ready notifications.
pub const DEFAULT_NOTIFY_ENDPOINT: &str = "inproc://frame_notify";

/// Default endpoint connecting the RX thread to the rest of the receiver.
pub const DEFAULT_RX_CHANNEL_ENDPOINT: &str = "inproc://rx_channel";

/// Parsed channel address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `tcp://host:port`, where `*` as host binds every interface
    Tcp {
        /// Host name or address
        host: String,
        /// Port number
        port: u16,
    },
    /// `inproc://name` within one `IpcContext`
    Inproc(String),
}

impl Endpoint {
    /// Parse an endpoint string, returning `IpcError::InvalidEndpoint` on failure.
    pub fn parse(endpoint: &str) -> Result<Self, IpcError> {
        let invalid = |reason: &str| IpcError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, address) = endpoint
            .split_once("://")
            .ok_or_else(|| invalid("missing '<transport>://' prefix"))?;

        match scheme {
            "inproc" => {
                if address.is_empty() {
                    return Err(invalid("inproc name must not be empty"));
                }
                Ok(Endpoint::Inproc(address.to_string()))
            }
            "tcp" => {
                let (host, port) = address
                    .rsplit_once(':')
                    .ok_or_else(|| invalid("tcp address must be <host>:<port>"))?;
                if host.is_empty() {
                    return Err(invalid("tcp host must not be empty"));
                }
                let port = port
                    .parse::<u16>()
                    .map_err(|_| invalid("tcp port must be an integer in 0..=65535"))?;
                Ok(Endpoint::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            other => Err(invalid(&format!("unsupported transport '{other}'"))),
        }
    }

    /// Socket address to bind for a tcp endpoint, mapping `*` to all interfaces.
    pub(crate) fn bind_addr(&self) -> Option<String> {
        match self {
            Endpoint::Tcp { host, port } if host == "*" => Some(format!("0.0.0.0:{port}")),
            Endpoint::Tcp { host, port } => Some(format!("{host}:{port}")),
            Endpoint::Inproc(_) => None,
        }
    }

    /// Socket address to connect to for a tcp endpoint. Wildcard hosts are rejected.
    pub(crate) fn connect_addr(&self) -> Result<String, IpcError> {
        match self {
            Endpoint::Tcp { host, .. } if host == "*" => Err(IpcError::InvalidEndpoint {
                endpoint: self.to_string(),
                reason: "cannot connect to a wildcard host".to_string(),
            }),
            Endpoint::Tcp { host, port } => Ok(format!("{host}:{port}")),
            Endpoint::Inproc(_) => Err(IpcError::InvalidEndpoint {
                endpoint: self.to_string(),
                reason: "inproc endpoints have no socket address".to_string(),
            }),
        }
    }

    /// Whether this is an `inproc://` endpoint
    #[must_use]
    pub fn is_inproc(&self) -> bool {
        matches!(self, Endpoint::Inproc(_))
    }
}

impl FromStr for Endpoint {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Endpoint::Inproc(name) => write!(f, "inproc://{name}"),
        }
    }
}
