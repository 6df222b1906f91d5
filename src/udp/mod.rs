//! UDP rendezvous.
//!
//! use `Server` to run the pairing service.
//!
//! use `Client` to register, get paired, hole punch and exchange data with peers.

use std::time::Duration;

#[cfg(feature = "client")]
mod client;
#[cfg(feature = "client")]
mod event;
#[cfg(feature = "client")]
mod keepalive;
#[cfg(feature = "client")]
mod peer;
#[cfg(feature = "client")]
pub use client::{Client, ClientConfig, ClientState};
#[cfg(feature = "client")]
pub use event::ClientEvent;
#[cfg(feature = "client")]
pub use peer::PeerInfo;

#[cfg(feature = "server")]
mod server;
#[cfg(feature = "server")]
pub use server::{Server, ServerConfig, DEFAULT_PORT};

mod shutdown;

/// Largest datagram either side reads.
pub(crate) const MAX_DATAGRAM: usize = 64 * 1024;
/// Socket reads wake up at least this often to observe shutdown.
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(1);
/// How long stop/disconnect wait for loops before aborting them.
pub(crate) const STOP_GRACE: Duration = Duration::from_secs(5);
