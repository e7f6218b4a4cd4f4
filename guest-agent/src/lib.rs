//! Guest side of the execution control channel.
//!
//! The host asks, over a message channel, for processes to be started inside
//! the guest, fed stdin, and drained of output. [`Dispatcher`] serves those
//! requests; each started process gets a [`Supervisor`] on its own thread,
//! tracked by the [`Registry`].

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod platform;
pub mod registry;
pub mod report;
pub mod supervisor;
mod sync;

pub use channel::{Channel, ChannelError, ClientId, MemoryChannel, SocketChannel};
pub use config::Config;
pub use dispatcher::{Dispatcher, DispatcherState, ShutdownHandle};
pub use platform::{GuestProcess, OsProcessLauncher, ProcessLauncher};
pub use registry::{ListKind, Registry};
pub use report::HostReporter;
pub use supervisor::{Supervisor, SupervisorSettings, SupervisorState};
