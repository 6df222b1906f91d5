use super::client::{Client, ClientState, Shared};
use crate::error::{Error, Result};
use crate::message::PUNCH_PAYLOAD;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::sleep;

const PUNCH_COUNT: usize = 3;
const PUNCH_GAP: Duration = Duration::from_millis(100);

/// A peer the rendezvous server assigned to this client.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// The peer's address as observed by the server.
    pub id: String,
    pub addr: SocketAddr,
    pub(crate) socket: Option<Arc<UdpSocket>>,
    pub(crate) last_pong: Option<Instant>,
}

impl PeerInfo {
    pub(crate) fn new(id: String, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            socket: None,
            last_pong: None,
        }
    }

    /// hole punching started, traffic to this peer uses the shared socket
    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub fn last_pong(&self) -> Option<Instant> {
        self.last_pong
    }
}

impl Client {
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.shared.read().peers.values().cloned().collect()
    }

    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        self.shared
            .read()
            .peers
            .values()
            .filter(|p| p.is_connected())
            .cloned()
            .collect()
    }

    pub fn peer(&self, id: &str) -> Option<PeerInfo> {
        self.shared.read().peers.get(id).cloned()
    }

    /// start talking to an assigned peer over the server-facing socket.
    ///
    /// The punch burst runs in the background and needs no answer, it only
    /// opens the NAT mapping. Keepalive pongs confirm the link later.
    pub fn connect_to_peer(&self, peer_id: &str) -> Result<()> {
        let s = &self.shared;

        let (socket, addr) = {
            let mut inner = s.write();
            let socket = inner.socket.clone();

            let peer = inner.peers.get_mut(peer_id).ok_or(Error::NoPeerAssigned)?;
            let socket = socket.ok_or(Error::NotConnectedToServer)?;
            peer.socket = Some(socket.clone());
            peer.last_pong = Some(Instant::now());
            let addr = peer.addr;

            s.set_state(&mut inner, ClientState::ConnectedToPeer);
            (socket, addr)
        };

        log::info!("hole punching to {} at {}", peer_id, addr);
        tokio::spawn(hole_punch(s.clone(), socket, addr));

        Ok(())
    }

    pub async fn send_to_peer(&self, peer_id: &str, data: &[u8]) -> Result<()> {
        let (socket, addr) = {
            let inner = self.shared.read();
            let peer = inner.peers.get(peer_id).ok_or(Error::NoPeerInfo)?;
            let socket = peer.socket.clone().ok_or(Error::NotConnectedToPeer)?;
            if inner.state == ClientState::Disconnected {
                return Err(Error::ClientDisconnected);
            }
            (socket, peer.addr)
        };

        socket.send_to(data, addr).await?;
        Ok(())
    }

    /// send `data` to every connected peer, stopping at the first failure.
    pub async fn send_to_all_peers(&self, data: &[u8]) -> Result<()> {
        let targets: Vec<(Arc<UdpSocket>, SocketAddr)> = {
            let inner = self.shared.read();
            if inner.peers.is_empty() {
                return Err(Error::NoPeerInfo);
            }
            let targets: Vec<_> = inner
                .peers
                .values()
                .filter_map(|p| p.socket.clone().map(|s| (s, p.addr)))
                .collect();
            if targets.is_empty() {
                return Err(Error::NotConnectedToPeer);
            }
            if inner.state == ClientState::Disconnected {
                return Err(Error::ClientDisconnected);
            }
            targets
        };

        for (socket, addr) in targets {
            socket.send_to(data, addr).await?;
        }
        Ok(())
    }

    pub fn is_peer_communication_available(&self) -> bool {
        let inner = self.shared.read();
        inner.state != ClientState::Disconnected && inner.peers.values().any(|p| p.is_connected())
    }
}

async fn hole_punch(shared: Arc<Shared>, socket: Arc<UdpSocket>, addr: SocketAddr) {
    for i in 0..PUNCH_COUNT {
        if i > 0 {
            sleep(PUNCH_GAP).await;
        }
        if let Err(e) = socket.send_to(PUNCH_PAYLOAD, addr).await {
            shared.notify_error(Error::Io(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::udp::ClientConfig;
    use tokio::time::timeout;

    async fn recv(s: &UdpSocket, buf: &mut [u8]) -> (usize, SocketAddr) {
        timeout(Duration::from_secs(2), s.recv_from(buf))
            .await
            .unwrap()
            .unwrap()
    }

    /// client paired with a silent peer through a fake server
    async fn paired_client() -> (Client, UdpSocket, UdpSocket) {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let c = Client::new(ClientConfig::new(server.local_addr().unwrap().to_string())).unwrap();
        c.connect().await.unwrap();

        let mut buf = [0u8; 1500];
        let (_, client_addr) = recv(&server, &mut buf).await;
        let peer_addr = peer.local_addr().unwrap();
        let m = Message::new_peer_assignment(peer_addr, peer_addr.to_string());
        server
            .send_to(&m.serialize().unwrap(), client_addr)
            .await
            .unwrap();

        for _ in 0..100 {
            if c.state() == ClientState::Paired {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(c.state(), ClientState::Paired);

        (c, server, peer)
    }

    #[tokio::test]
    async fn test_connect_to_unknown_peer() {
        let c = Client::new(ClientConfig::new("127.0.0.1:3478")).unwrap();
        assert!(matches!(
            c.connect_to_peer("10.0.0.1:1"),
            Err(Error::NoPeerAssigned)
        ));
        assert!(!c.is_peer_communication_available());
    }

    #[tokio::test]
    async fn test_send_without_peers() {
        let c = Client::new(ClientConfig::new("127.0.0.1:3478")).unwrap();
        assert!(matches!(
            c.send_to_all_peers(b"x").await,
            Err(Error::NoPeerInfo)
        ));
        assert!(matches!(
            c.send_to_peer("10.0.0.1:1", b"x").await,
            Err(Error::NoPeerInfo)
        ));
    }

    #[tokio::test]
    async fn test_send_before_hole_punch() {
        let (c, _server, peer) = paired_client().await;
        let id = peer.local_addr().unwrap().to_string();

        assert!(matches!(
            c.send_to_peer(&id, b"x").await,
            Err(Error::NotConnectedToPeer)
        ));
        assert!(matches!(
            c.send_to_all_peers(b"x").await,
            Err(Error::NotConnectedToPeer)
        ));
        assert!(!c.is_peer_communication_available());
        c.disconnect().await;
    }

    #[tokio::test]
    async fn test_hole_punch_burst() {
        let (c, _server, peer) = paired_client().await;
        let id = peer.local_addr().unwrap().to_string();

        c.connect_to_peer(&id).unwrap();
        assert_eq!(c.state(), ClientState::ConnectedToPeer);
        assert!(c.is_peer_communication_available());
        assert!(c.peer(&id).unwrap().is_connected());

        let mut buf = [0u8; 1500];
        let mut arrivals = Vec::new();
        for _ in 0..PUNCH_COUNT {
            let (n, from) = recv(&peer, &mut buf).await;
            assert_eq!(&buf[..n], PUNCH_PAYLOAD);
            assert_eq!(from.port(), c.local_addr().unwrap().port());
            arrivals.push(Instant::now());
        }

        for w in arrivals.windows(2) {
            let gap = w[1] - w[0];
            assert!(gap >= Duration::from_millis(50), "gap {:?}", gap);
            assert!(gap <= Duration::from_millis(150), "gap {:?}", gap);
        }

        // exactly three probes
        assert!(timeout(Duration::from_millis(300), peer.recv_from(&mut buf))
            .await
            .is_err());

        c.disconnect().await;
        assert!(matches!(
            c.connect_to_peer(&id),
            Err(Error::NoPeerAssigned)
        ));
    }

    #[tokio::test]
    async fn test_send_to_connected_peer() {
        let (c, _server, peer) = paired_client().await;
        let id = peer.local_addr().unwrap().to_string();
        c.connect_to_peer(&id).unwrap();

        c.send_to_all_peers(b"chunk").await.unwrap();
        c.send_to_peer(&id, b"chunk2").await.unwrap();

        let mut got = Vec::new();
        let mut buf = [0u8; 1500];
        while got.len() < 2 {
            let (n, _) = recv(&peer, &mut buf).await;
            if &buf[..n] != PUNCH_PAYLOAD {
                got.push(buf[..n].to_vec());
            }
        }
        assert_eq!(got, vec![b"chunk".to_vec(), b"chunk2".to_vec()]);

        c.disconnect().await;
    }
}
