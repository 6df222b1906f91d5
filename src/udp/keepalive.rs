//! Periodic liveness traffic.
//!
//! While the client waits for the server it pings the server so its
//! registration survives the inactivity sweep. Once it talks to peers it pings
//! each of them instead and evicts the ones that stopped answering. Losing the
//! last peer puts the client back in the server's queue.

use super::client::{ClientState, Shared};
use super::shutdown::Shutdown;
use crate::error::Error;
use crate::message::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::{interval_at, MissedTickBehavior};

pub(crate) async fn keepalive_loop(shared: Arc<Shared>, exit: Arc<Shutdown>) {
    let period = shared.config.ping_interval.max(Duration::from_millis(10));
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = exit.wait() => break,
            _ = ticker.tick() => {},
        }

        match shared.state() {
            ClientState::Disconnected => break,
            ClientState::Connecting | ClientState::Waiting => {
                let ping = Message::new_client_ping(shared.signature());
                if let Err(e) = shared.send_to_server(&ping).await {
                    shared.notify_error(e);
                }
            }
            ClientState::ConnectedToPeer => check_peers(&shared).await,
            ClientState::Paired => {}
        }
    }

    log::debug!("keepalive loop exit");
}

/// evict silent peers, ping the rest. Rejoins the server queue, forgetting
/// every remaining assignment, when no connected peer is left.
async fn check_peers(shared: &Shared) {
    let now = Instant::now();
    let peer_timeout = shared.config.peer_timeout;

    let (evicted, live) = {
        let mut inner = shared.write();

        let evicted: Vec<String> = inner
            .peers
            .values()
            .filter(|p| match (p.is_connected(), p.last_pong) {
                (true, Some(t)) => now.saturating_duration_since(t) > peer_timeout,
                _ => false,
            })
            .map(|p| p.id.clone())
            .collect();
        for id in evicted.iter() {
            inner.peers.remove(id);
        }

        let live: Vec<(Arc<UdpSocket>, SocketAddr)> = inner
            .peers
            .values()
            .filter_map(|p| p.socket.clone().map(|s| (s, p.addr)))
            .collect();

        if live.is_empty() {
            // assignments never punched are stale once we rejoin the queue
            inner.peers.clear();
            shared.set_state(&mut inner, ClientState::Waiting);
        }

        (evicted, live)
    };

    for id in evicted {
        log::info!("peer {} timed out", id);
        shared.notify_error(Error::PeerTimeout(id));
    }

    if live.is_empty() {
        // the server forgot us when it paired us
        if let Err(e) = shared.register().await {
            shared.notify_error(e);
        }
        return;
    }

    let ping = match Message::new_peer_ping(shared.signature()).serialize() {
        Ok(buf) => buf,
        Err(e) => return shared.notify_error(e),
    };
    for (socket, addr) in live {
        if let Err(e) = socket.send_to(&ping, addr).await {
            shared.notify_error(Error::Io(e));
        }
    }
}
