use super::event::{ClientEvent, EventBus};
use super::keepalive::keepalive_loop;
use super::peer::PeerInfo;
use super::shutdown::{join_tasks, Shutdown};
use super::{MAX_DATAGRAM, READ_TIMEOUT, STOP_GRACE};
use crate::error::{Error, Result};
use crate::message::{Message, MessageType, Signature, PUNCH_PAYLOAD};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, UdpSocket};
use tokio::select;
use tokio::task::{spawn, JoinHandle};
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Waiting,
    Paired,
    ConnectedToPeer,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientState::Disconnected => "Disconnected",
            ClientState::Connecting => "Connecting",
            ClientState::Waiting => "Waiting",
            ClientState::Paired => "Paired",
            ClientState::ConnectedToPeer => "ConnectedToPeer",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    /// local bind address, wildcard of the server's address family if unset.
    pub local_addr: Option<SocketAddr>,
    /// signature carried by pings, random if unset.
    pub id: Option<String>,
    pub ping_interval: Duration,
    /// bound for [`Client::wait_for_peer`]
    pub connect_timeout: Duration,
    /// a connected peer without a pong for this long is evicted
    pub peer_timeout: Duration,
}

impl ClientConfig {
    pub fn new<A: Into<String>>(server_addr: A) -> Self {
        Self {
            server_addr: server_addr.into(),
            local_addr: None,
            id: None,
            ping_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            peer_timeout: Duration::from_secs(30),
        }
    }
}

pub(crate) struct Inner {
    pub state: ClientState,
    /// resolved on connect
    pub server_addr: Option<SocketAddr>,
    pub socket: Option<Arc<UdpSocket>>,
    pub peers: HashMap<String, PeerInfo>,
}

struct Session {
    exit: Arc<Shutdown>,
    tasks: Vec<JoinHandle<()>>,
}

/// State shared by the client handle and its background loops.
pub(crate) struct Shared {
    pub config: ClientConfig,
    pub id: String,
    pub events: EventBus,
    inner: RwLock<Inner>,
    session: Mutex<Option<Session>>,
}

impl Shared {
    pub fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ClientState {
        self.read().state
    }

    /// caller holds the write lock
    /// Only `connect` leaves `Disconnected`, late loop work can't revive a
    /// disconnected client.
    pub fn set_state(&self, inner: &mut Inner, state: ClientState) {
        if inner.state == ClientState::Disconnected && state != ClientState::Connecting {
            return;
        }
        if inner.state != state {
            log::debug!("state {} -> {}", inner.state, state);
            inner.state = state;
            self.events.emit(ClientEvent::StateChanged(state));
        }
    }

    pub fn notify_error(&self, e: Error) {
        log::debug!("{}", e);
        self.events.emit(ClientEvent::ErrorOccurred(e));
    }

    pub fn signature(&self) -> Signature {
        Signature::new(self.id.as_str())
    }

    pub async fn send_to_server(&self, msg: &Message) -> Result<()> {
        let (socket, server_addr) = {
            let inner = self.read();
            match (inner.socket.clone(), inner.server_addr) {
                (Some(socket), Some(addr)) => (socket, addr),
                _ => return Err(Error::NotConnectedToServer),
            }
        };
        socket.send_to(&msg.serialize()?, server_addr).await?;
        Ok(())
    }

    pub async fn register(&self) -> Result<()> {
        self.send_to_server(&Message::new_client_register()).await
    }

    async fn recv_loop(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        server_addr: SocketAddr,
        exit: Arc<Shutdown>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let r = select! {
                _ = exit.wait() => break,
                r = timeout(READ_TIMEOUT, socket.recv_from(&mut buf)) => r,
            };

            let (size, from) = match r {
                Err(_) => continue,
                Ok(Ok(r)) => r,
                Ok(Err(e)) => {
                    self.notify_error(Error::Io(e));
                    continue;
                }
            };

            if from == server_addr {
                self.process_server_message(&buf[..size]);
            } else {
                self.process_peer_message(&buf[..size], from, &socket)
                    .await;
            }
        }

        log::debug!("client recv loop exit");
    }

    fn process_server_message(&self, data: &[u8]) {
        let msg = match Message::deserialize(data) {
            Ok(msg) => msg,
            Err(e) => return self.notify_error(e),
        };

        match msg.kind {
            MessageType::WaitingForPeer => {
                let mut inner = self.write();
                self.set_state(&mut inner, ClientState::Waiting);
            }
            MessageType::PeerAssignment => {
                if let Err(e) = self.handle_peer_assignment(&msg) {
                    self.notify_error(e);
                }
            }
            MessageType::ServerError => match msg.server_error_data() {
                Ok(d) => self.notify_error(Error::Server {
                    code: d.error_code,
                    message: d.error_message,
                }),
                Err(e) => self.notify_error(e),
            },
            kind => self.notify_error(Error::UnexpectedMessage(kind)),
        }
    }

    fn handle_peer_assignment(&self, msg: &Message) -> Result<()> {
        let data = msg.peer_assignment_data()?;
        let addr: SocketAddr = data
            .peer_address
            .parse()
            .map_err(|_| Error::InvalidAddress(data.peer_address.clone()))?;

        log::info!("assigned peer {} at {}", data.peer_id, addr);

        let peer = PeerInfo::new(data.peer_id.clone(), addr);
        {
            let mut inner = self.write();
            if inner.state == ClientState::Disconnected {
                return Ok(());
            }
            inner.peers.insert(data.peer_id, peer.clone());
            self.set_state(&mut inner, ClientState::Paired);
        }
        self.events.emit(ClientEvent::PeerAssigned(peer));

        Ok(())
    }

    async fn process_peer_message(&self, data: &[u8], from: SocketAddr, socket: &UdpSocket) {
        if data == PUNCH_PAYLOAD {
            log::trace!("punch from {}", from);
            return;
        }

        let msg = match Message::deserialize(data) {
            Ok(msg) => msg,
            Err(_) => {
                self.events.emit(ClientEvent::MessageReceived {
                    from,
                    data: data.to_vec(),
                });
                return;
            }
        };

        match msg.kind {
            MessageType::PeerPing => {
                let pong = Message::new_peer_pong(self.signature());
                let r = match pong.serialize() {
                    Ok(buf) => socket.send_to(&buf, from).await.map_err(Error::from),
                    Err(e) => Err(e),
                };
                if let Err(e) = r {
                    self.notify_error(e);
                }
            }
            MessageType::PeerPong => {
                let mut inner = self.write();
                match inner.peers.values_mut().find(|p| p.addr == from) {
                    Some(p) => p.last_pong = Some(Instant::now()),
                    None => log::trace!("pong from unknown peer {}", from),
                }
            }
            kind => log::trace!("dropping {} from peer {}", kind, from),
        }
    }
}

/// Udp peer client
///
/// Registers with a rendezvous server over a single unconnected socket, and
/// reuses that socket for every peer it is paired with, so the NAT mapping
/// the server observed is the one the peer punches through.
///
/// The handle is cheap to clone, clones share the same connection.
///
/// # example
/// ```no_run
/// use rndz_pair::udp::{Client, ClientConfig};
///
/// # async fn run() -> rndz_pair::Result<()> {
/// let c = Client::new(ClientConfig::new("rndz_server:3478"))?;
/// c.connect().await?;
/// let peer = c.wait_for_peer().await?;
/// c.connect_to_peer(&peer.id)?;
/// c.send_to_peer(&peer.id, b"hello").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    pub(crate) shared: Arc<Shared>,
}

impl Client {
    /// Only checks the server address has a port, resolution happens in
    /// [`Client::connect`].
    pub fn new(config: ClientConfig) -> Result<Self> {
        let has_port = config
            .server_addr
            .rsplit_once(':')
            .map_or(false, |(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !has_port {
            return Err(Error::InvalidAddress(config.server_addr));
        }

        let id = config
            .id
            .clone()
            .unwrap_or_else(|| format!("{:016x}", rand::random::<u64>()));

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                id,
                events: Default::default(),
                inner: RwLock::new(Inner {
                    state: ClientState::Disconnected,
                    server_addr: None,
                    socket: None,
                    peers: HashMap::new(),
                }),
                session: Mutex::new(None),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// the resolved server address, once connected
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.shared.read().server_addr
    }

    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .read()
            .socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    /// open the socket, start the receive and keepalive loops, register with
    /// the server.
    pub async fn connect(&self) -> Result<()> {
        let s = &self.shared;
        if s.state() != ClientState::Disconnected {
            return Err(Error::AlreadyConnected);
        }

        let server_addr = lookup_host(s.config.server_addr.as_str())
            .await?
            .next()
            .ok_or_else(|| Error::InvalidAddress(s.config.server_addr.clone()))?;
        let socket = Arc::new(Self::create_socket(s.config.local_addr, server_addr)?);
        let local_addr = socket.local_addr()?;

        // state and session change together, a concurrent disconnect sees both or neither
        let stale = {
            let mut inner = s.write();
            if inner.state != ClientState::Disconnected {
                return Err(Error::AlreadyConnected);
            }
            inner.server_addr = Some(server_addr);
            inner.socket = Some(socket.clone());
            s.set_state(&mut inner, ClientState::Connecting);

            let exit = Arc::new(Shutdown::default());
            let tasks = vec![
                spawn(s.clone().recv_loop(socket, server_addr, exit.clone())),
                spawn(keepalive_loop(s.clone(), exit.clone())),
            ];
            s.session
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .replace(Session { exit, tasks })
        };
        if let Some(stale) = stale {
            stale.exit.trigger();
        }

        log::info!("connecting to {} from {}", server_addr, local_addr);

        s.register().await
    }

    /// stop the loops, close the socket and forget every peer.
    pub async fn disconnect(&self) {
        let s = &self.shared;
        let session = {
            let mut inner = s.write();
            inner.server_addr = None;
            inner.socket = None;
            inner.peers.clear();
            s.set_state(&mut inner, ClientState::Disconnected);
            s.session
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
        };

        if let Some(session) = session {
            session.exit.trigger();
            join_tasks(session.tasks, STOP_GRACE).await;
        }
    }

    /// wait up to the connect timeout for the server to assign a peer.
    pub async fn wait_for_peer(&self) -> Result<PeerInfo> {
        let mut events = self.events();

        if let Some(p) = self.peers().into_iter().find(|p| !p.is_connected()) {
            return Ok(p);
        }

        let wait = async {
            while let Some(event) = events.recv().await {
                if let ClientEvent::PeerAssigned(p) = event.as_ref() {
                    return Ok(p.clone());
                }
            }
            Err(Error::ClientDisconnected)
        };

        timeout(self.shared.config.connect_timeout, wait)
            .await
            .map_err(|_| Error::ConnectTimeout)?
    }

    /// every event from now on, in the order the client produced them
    pub fn events(&self) -> tokio::sync::mpsc::UnboundedReceiver<Arc<ClientEvent>> {
        self.shared.events.channel()
    }

    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&ClientEvent) + Send + 'static,
    {
        self.shared.events.subscribe(f)
    }

    pub fn on_state_change<F>(&self, f: F)
    where
        F: Fn(ClientState) + Send + 'static,
    {
        self.subscribe(move |e| {
            if let ClientEvent::StateChanged(s) = e {
                f(*s)
            }
        })
    }

    pub fn on_peer_assigned<F>(&self, f: F)
    where
        F: Fn(&PeerInfo) + Send + 'static,
    {
        self.subscribe(move |e| {
            if let ClientEvent::PeerAssigned(p) = e {
                f(p)
            }
        })
    }

    pub fn on_error<F>(&self, f: F)
    where
        F: Fn(&Error) + Send + 'static,
    {
        self.subscribe(move |e| {
            if let ClientEvent::ErrorOccurred(err) = e {
                f(err)
            }
        })
    }

    pub fn on_message_received<F>(&self, f: F)
    where
        F: Fn(SocketAddr, &[u8]) + Send + 'static,
    {
        self.subscribe(move |e| {
            if let ClientEvent::MessageReceived { from, data } = e {
                f(*from, data)
            }
        })
    }

    fn create_socket(local_addr: Option<SocketAddr>, server_addr: SocketAddr) -> Result<UdpSocket> {
        let local_addr = local_addr.unwrap_or_else(|| match server_addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        });

        let socket = Socket::new(Domain::for_address(local_addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&local_addr.into())?;

        Ok(UdpSocket::from_std(socket.into())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn client_with_server() -> (Client, UdpSocket) {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let c = Client::new(ClientConfig::new(server.local_addr().unwrap().to_string())).unwrap();
        (c, server)
    }

    async fn recv_message(s: &UdpSocket) -> (Message, SocketAddr) {
        let mut buf = [0u8; 1500];
        let (n, addr) = timeout(Duration::from_secs(2), s.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        (Message::deserialize(&buf[..n]).unwrap(), addr)
    }

    async fn send_message(s: &UdpSocket, m: Message, to: SocketAddr) {
        s.send_to(&m.serialize().unwrap(), to).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_registers() {
        let (c, server) = client_with_server().await;
        assert_eq!(c.state(), ClientState::Disconnected);

        c.connect().await.unwrap();
        assert_eq!(c.state(), ClientState::Connecting);

        let (msg, from) = recv_message(&server).await;
        assert_eq!(msg.kind, MessageType::ClientRegister);
        assert_eq!(from.port(), c.local_addr().unwrap().port());

        assert!(matches!(c.connect().await, Err(Error::AlreadyConnected)));

        c.disconnect().await;
        assert_eq!(c.state(), ClientState::Disconnected);
        assert!(c.local_addr().is_none());
        c.disconnect().await;
    }

    #[tokio::test]
    async fn test_server_messages_drive_state() {
        let (c, server) = client_with_server().await;
        let mut events = c.events();
        c.connect().await.unwrap();
        let (_, client_addr) = recv_message(&server).await;

        send_message(&server, Message::new_waiting_for_peer(), client_addr).await;
        send_message(
            &server,
            Message::new_server_error("Unknown message type", "UNKNOWN_MESSAGE"),
            client_addr,
        )
        .await;
        server.send_to(b"garbage", client_addr).await.unwrap();
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        send_message(
            &server,
            Message::new_peer_assignment(peer, "127.0.0.1:40000"),
            client_addr,
        )
        .await;

        let mut seen = Vec::new();
        while seen.len() < 6 {
            let e = timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(e);
        }

        assert!(matches!(*seen[0], ClientEvent::StateChanged(ClientState::Connecting)));
        assert!(matches!(*seen[1], ClientEvent::StateChanged(ClientState::Waiting)));
        match &*seen[2] {
            ClientEvent::ErrorOccurred(Error::Server { code, .. }) => {
                assert_eq!(code, "UNKNOWN_MESSAGE")
            }
            e => panic!("unexpected {:?}", e),
        }
        assert!(matches!(*seen[3], ClientEvent::ErrorOccurred(Error::Decode(_))));
        assert!(matches!(*seen[4], ClientEvent::StateChanged(ClientState::Paired)));
        match &*seen[5] {
            ClientEvent::PeerAssigned(p) => {
                assert_eq!(p.id, "127.0.0.1:40000");
                assert_eq!(p.addr, peer);
                assert!(!p.is_connected());
            }
            e => panic!("unexpected {:?}", e),
        }

        assert_eq!(c.state(), ClientState::Paired);
        assert_eq!(c.peers().len(), 1);
        assert_eq!(c.wait_for_peer().await.unwrap().id, "127.0.0.1:40000");

        c.disconnect().await;
        assert!(c.peers().is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_peer_times_out() {
        let (_, server) = client_with_server().await;
        let mut config = ClientConfig::new(server.local_addr().unwrap().to_string());
        config.connect_timeout = Duration::from_millis(100);
        let c = Client::new(config).unwrap();
        c.connect().await.unwrap();

        assert!(matches!(c.wait_for_peer().await, Err(Error::ConnectTimeout)));
        c.disconnect().await;
    }

    #[tokio::test]
    async fn test_peer_data_routing() {
        let (c, server) = client_with_server().await;
        let mut events = c.events();
        c.connect().await.unwrap();
        let (_, client_addr) = recv_message(&server).await;

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // probe and unsolicited protocol messages are not data
        peer.send_to(PUNCH_PAYLOAD, client_addr).await.unwrap();
        send_message(&peer, Message::new_waiting_for_peer(), client_addr).await;
        send_message(&peer, Message::new_peer_ping(Signature::new("p")), client_addr).await;
        peer.send_to(b"payload", client_addr).await.unwrap();

        let (pong, _) = recv_message(&peer).await;
        assert_eq!(pong.kind, MessageType::PeerPong);
        assert_eq!(pong.sign.pub_key, c.id());

        loop {
            let e = timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            match &*e {
                ClientEvent::StateChanged(_) => continue,
                ClientEvent::MessageReceived { from, data } => {
                    assert_eq!(*from, peer.local_addr().unwrap());
                    assert_eq!(data, b"payload");
                    break;
                }
                e => panic!("unexpected {:?}", e),
            }
        }

        c.disconnect().await;
    }

    #[tokio::test]
    async fn test_server_address_resolved_on_connect() {
        for bad in ["rndz_server", ":3478", "rndz_server:port"] {
            assert!(matches!(
                Client::new(ClientConfig::new(bad)),
                Err(Error::InvalidAddress(_))
            ));
        }

        let (c, server) = client_with_server().await;
        assert!(c.server_addr().is_none());

        c.connect().await.unwrap();
        assert_eq!(c.server_addr(), Some(server.local_addr().unwrap()));
        c.disconnect().await;
        assert!(c.server_addr().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_racing_connect_stops_every_loop() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut config = ClientConfig::new(server.local_addr().unwrap().to_string());
        config.ping_interval = Duration::from_millis(20);
        let c = Client::new(config).unwrap();
        let other = c.clone();

        // either side may win, whatever is left running the next disconnect stops
        let _ = tokio::join!(c.connect(), other.disconnect());
        c.disconnect().await;

        assert_eq!(c.state(), ClientState::Disconnected);
        assert!(c.shared.session.lock().unwrap().is_none());

        // registration and pings sent before the disconnect may still be queued
        let mut buf = [0u8; 1500];
        let mut quiet = false;
        for _ in 0..20 {
            if timeout(Duration::from_millis(150), server.recv_from(&mut buf))
                .await
                .is_err()
            {
                quiet = true;
                break;
            }
        }
        assert!(quiet, "client kept pinging after disconnect");

        c.connect().await.unwrap();
        assert_eq!(c.state(), ClientState::Connecting);
        c.disconnect().await;
    }
}
