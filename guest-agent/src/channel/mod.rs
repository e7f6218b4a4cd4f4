//! Transport to the host-side control service.
//!
//! A [`Channel`] is a blocking, message-oriented primitive: wait for one
//! host message header, fetch its parameters, send guest messages back.
//! Everything above it is transport-agnostic.

use std::io;

use guestctl_protocol::{FrameError, Param};

mod memory;
mod socket;

pub use memory::MemoryChannel;
pub use socket::SocketChannel;

/// Session handle returned by [`Channel::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u32);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a successful wait yields: the message id and how many parameters
/// are ready to be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostMessageHeader {
    pub msg_type: u32,
    pub param_count: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The host-side service is absent. Soft: the subsystem disables itself.
    #[error("host control service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The header was seen but the message needs a larger receive buffer.
    /// Call `wait_for_host_message` again.
    #[error("pending message needs {needed} bytes, retry with a larger buffer")]
    TooMuchData { needed: usize },

    #[error("pending waits were cancelled")]
    Cancelled,

    #[error("client {0} is not connected")]
    NotConnected(ClientId),

    #[error("no host message has been received")]
    NoMessage,

    #[error("connection to host closed")]
    Disconnected,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ChannelError {
    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, ChannelError::ServiceUnavailable(_))
    }
}

/// Blocking transport contract used by the dispatcher and the reporters.
///
/// Implementations are shared between the dispatcher thread and every
/// supervisor worker, so all methods take `&self`.
pub trait Channel: Send + Sync {
    /// Establish a session. Fails with [`ChannelError::ServiceUnavailable`]
    /// when nobody is listening on the host.
    fn connect(&self) -> Result<ClientId, ChannelError>;

    fn disconnect(&self, client: ClientId);

    /// Block until one host message is available, or until cancelled.
    fn wait_for_host_message(&self, client: ClientId) -> Result<HostMessageHeader, ChannelError>;

    /// Parameters of the message returned by the last successful wait.
    fn fetch_params(&self, client: ClientId) -> Result<Vec<Param>, ChannelError>;

    /// Wake every blocked wait on this channel. Must not block.
    fn cancel_pending_waits(&self, client: ClientId) -> Result<(), ChannelError>;

    /// Send one guest message to the host over the current session.
    fn call(&self, msg_type: u32, params: Vec<Param>) -> Result<(), ChannelError>;
}
