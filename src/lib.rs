//!A UDP rendezvous service that pairs peers behind NAT, and a client that hole punches a direct channel to them.
//!
//!Two nodes behind NAT (such as a home gateway) can't reach each other directly: each gateway only lets
//!traffic in after the node behind it sent traffic out to that same address.
//!
//!## How it works
//!A public rendezvous server observes each client's address as it registers.
//!The first client waits in a FIFO queue, the next one to register is paired with it,
//!and both are told the other's observed address. The server then forgets them.
//!
//!Each client sends a few probe datagrams to its peer from the same socket it used to reach the server.
//!That opens the NAT mapping on both sides, after which data and keepalive traffic flow peer to peer.
//!
//!A client keeps pinging the server while it waits, and pings its peers once connected.
//!A peer that stops answering is evicted, and a client that loses all its peers registers again.
//!
//!Nothing on the wire is authenticated. The signature carried by messages is whatever the sender claims.
//!
//!## Feature flags
//!For convenient, the crate include both client and server code by default.
//!
//!```toml
//!rndz-pair = { version = "0.1", default-features=false, features=["client"]}
//!```
//!
//!- `client`: peer client
//!- `server`: rendezvous server

pub mod error;
pub mod message;
pub mod udp;

pub use error::{Error, Result};
pub use message::Message;
