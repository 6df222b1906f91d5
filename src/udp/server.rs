use super::shutdown::{join_tasks, Shutdown};
use super::{MAX_DATAGRAM, READ_TIMEOUT, STOP_GRACE};
use crate::error::{Error, Result};
use crate::message::{Message, MessageType, INVALID_DATA, PARSE_ERROR, UNKNOWN_MESSAGE};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::task::{spawn, JoinHandle};
use tokio::time::{interval_at, timeout};

/// Well-known rendezvous port.
pub const DEFAULT_PORT: u16 = 3478;

macro_rules! slog {
    ($ctx:expr, $lvl:ident, $($arg:tt)+) => {
        if $ctx.config.enable_logging {
            log::$lvl!($($arg)+);
        }
    };
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Registrations without a ping for this long are dropped.
    pub client_timeout: Duration,
    /// Interval clients are expected to ping at. Must stay below half the
    /// client timeout.
    pub ping_interval: Duration,
    /// Advisory only, a longer queue is logged but still served.
    pub max_queue_size: usize,
    pub enable_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
            client_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(10),
            max_queue_size: 100,
            enable_logging: true,
        }
    }
}

impl ServerConfig {
    fn sweep_period(&self) -> Duration {
        (self.client_timeout / 2).max(Duration::from_millis(10))
    }
}

#[derive(Debug, Clone)]
struct ClientInfo {
    id: String,
    addr: SocketAddr,
    last_ping: Instant,
    registered: Instant,
}

#[derive(Debug)]
enum Registration {
    Reconnected,
    Queued { waiting: usize },
    Paired(ClientInfo, ClientInfo),
}

/// Registered, not yet paired clients and their arrival order.
#[derive(Default)]
struct Registry {
    clients: HashMap<String, ClientInfo>,
    waiting: VecDeque<String>,
}

impl Registry {
    fn register(&mut self, addr: SocketAddr, now: Instant) -> Registration {
        let id = addr.to_string();

        if let Some(c) = self.clients.get_mut(&id) {
            c.addr = addr;
            c.last_ping = now;
            return Registration::Reconnected;
        }

        let client = ClientInfo {
            id: id.clone(),
            addr,
            last_ping: now,
            registered: now,
        };

        while let Some(head) = self.waiting.pop_front() {
            if let Some(other) = self.clients.remove(&head) {
                return Registration::Paired(other, client);
            }
        }

        self.clients.insert(id.clone(), client);
        self.waiting.push_back(id);
        Registration::Queued {
            waiting: self.waiting.len(),
        }
    }

    fn ping(&mut self, addr: SocketAddr, now: Instant) -> bool {
        match self.clients.get_mut(&addr.to_string()) {
            Some(c) => {
                c.addr = addr;
                c.last_ping = now;
                true
            }
            None => false,
        }
    }

    fn sweep(&mut self, now: Instant, client_timeout: Duration) -> Vec<ClientInfo> {
        let expired: Vec<String> = self
            .clients
            .values()
            .filter(|c| now.saturating_duration_since(c.last_ping) > client_timeout)
            .map(|c| c.id.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(c) = self.clients.remove(&id) {
                removed.push(c);
            }
            self.waiting.retain(|w| *w != id);
        }
        removed
    }
}

struct Context {
    config: ServerConfig,
    socket: Arc<UdpSocket>,
    registry: Arc<RwLock<Registry>>,
}

impl Context {
    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    async fn recv_loop(self: Arc<Self>, exit: Arc<Shutdown>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let r = select! {
                _ = exit.wait() => break,
                r = timeout(READ_TIMEOUT, self.socket.recv_from(&mut buf)) => r,
            };

            match r {
                Err(_) => continue,
                Ok(Ok((size, addr))) => self.handle_packet(&buf[..size], addr).await,
                Ok(Err(e)) => log::warn!("error reading udp message: {}", e),
            }
        }

        log::debug!("server recv loop exit");
    }

    async fn sweep_loop(self: Arc<Self>, exit: Arc<Shutdown>) {
        let period = self.config.sweep_period();
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);

        loop {
            select! {
                _ = exit.wait() => break,
                _ = ticker.tick() => {},
            }

            let removed = self
                .write()
                .sweep(Instant::now(), self.config.client_timeout);
            for c in removed {
                slog!(
                    self,
                    info,
                    "removed inactive client {} (registered {:?} ago)",
                    c.id,
                    c.registered.elapsed()
                );
            }
        }

        log::debug!("server sweep loop exit");
    }

    async fn handle_packet(&self, data: &[u8], addr: SocketAddr) {
        let msg = match Message::deserialize(data) {
            Ok(msg) => msg,
            Err(e) => {
                slog!(self, debug, "failed to decode message from {}: {}", addr, e);
                self.send_error(addr, "Invalid message format", PARSE_ERROR)
                    .await;
                return;
            }
        };

        match msg.kind {
            MessageType::ClientRegister => self.handle_register(&msg, addr).await,
            MessageType::ClientPing => self.handle_ping(addr),
            kind => {
                slog!(self, debug, "unknown message type {} from {}", kind, addr);
                self.send_error(addr, "Unknown message type", UNKNOWN_MESSAGE)
                    .await;
            }
        }
    }

    async fn handle_register(&self, msg: &Message, addr: SocketAddr) {
        if let Err(e) = msg.client_register_data() {
            slog!(self, debug, "invalid register data from {}: {}", addr, e);
            self.send_error(addr, "Invalid register data", INVALID_DATA)
                .await;
            return;
        }

        let outcome = self.write().register(addr, Instant::now());

        match outcome {
            Registration::Reconnected => {
                slog!(self, info, "client {} reconnected", addr);
            }
            Registration::Queued { waiting } => {
                slog!(self, info, "client {} added to waiting queue", addr);
                if waiting > self.config.max_queue_size {
                    log::warn!(
                        "waiting queue size {} exceeds {}",
                        waiting,
                        self.config.max_queue_size
                    );
                }
                self.send(addr, &Message::new_waiting_for_peer()).await;
            }
            Registration::Paired(a, b) => {
                self.send(a.addr, &Message::new_peer_assignment(b.addr, b.id.as_str()))
                    .await;
                self.send(b.addr, &Message::new_peer_assignment(a.addr, a.id.as_str()))
                    .await;
                slog!(self, info, "paired clients {} and {}", a.id, b.id);
            }
        }
    }

    fn handle_ping(&self, addr: SocketAddr) {
        if self.write().ping(addr, Instant::now()) {
            slog!(self, trace, "ping {}", addr);
        } else {
            slog!(self, trace, "ping from unknown client {}", addr);
        }
    }

    async fn send_error(&self, addr: SocketAddr, message: &str, code: &str) {
        self.send(addr, &Message::new_server_error(message, code))
            .await;
    }

    async fn send(&self, addr: SocketAddr, msg: &Message) {
        let buf = match msg.serialize() {
            Ok(buf) => buf,
            Err(e) => {
                log::warn!("failed to serialize {}: {}", msg.kind, e);
                return;
            }
        };

        if let Err(e) = self.socket.send_to(&buf, addr).await {
            log::warn!("failed to send {} to {}: {}", msg.kind, addr, e);
        }
    }
}

/// Udp rendezvous server
///
/// Registers clients by their observed address, queues them in arrival order
/// and introduces the queue head to the next newcomer. Paired clients are
/// forgotten immediately, the server never relays their traffic.
///
/// # example
/// ```no_run
/// use rndz_pair::udp::{Server, ServerConfig};
///
/// # async fn run() -> rndz_pair::Result<()> {
/// let mut s = Server::new(ServerConfig::default());
/// s.start().await?;
/// tokio::signal::ctrl_c().await?;
/// s.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: ServerConfig,
    registry: Arc<RwLock<Registry>>,
    socket: Option<Arc<UdpSocket>>,
    exit: Arc<Shutdown>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: Default::default(),
            socket: None,
            exit: Default::default(),
            tasks: Vec::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// bind the listen address, spawn the inbound and sweep loops.
    pub async fn start(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Err(io::Error::new(io::ErrorKind::Other, "server already started").into());
        }

        if self.config.ping_interval >= self.config.client_timeout / 2 {
            log::warn!(
                "ping interval {:?} is not below half the client timeout {:?}, live clients may be swept",
                self.config.ping_interval,
                self.config.client_timeout
            );
        }

        let socket = UdpSocket::bind(self.config.listen_addr.as_str())
            .await
            .map_err(|source| Error::Bind {
                addr: self.config.listen_addr.clone(),
                source,
            })?;
        let socket = Arc::new(socket);

        slog!(
            self,
            info,
            "rendezvous server listening on {}",
            socket.local_addr()?
        );

        let exit = Arc::new(Shutdown::default());
        let ctx = Arc::new(Context {
            config: self.config.clone(),
            socket: socket.clone(),
            registry: self.registry.clone(),
        });

        self.tasks = vec![
            spawn(ctx.clone().recv_loop(exit.clone())),
            spawn(ctx.sweep_loop(exit.clone())),
        ];
        self.exit = exit;
        self.socket = Some(socket);

        Ok(())
    }

    /// stop both loops and close the socket. Safe to call more than once.
    pub async fn stop(&mut self) {
        self.exit.trigger();
        join_tasks(std::mem::take(&mut self.tasks), STOP_GRACE).await;

        if self.socket.take().is_some() {
            slog!(self, info, "rendezvous server stopped");
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// number of registered, not yet paired clients
    pub fn connected_clients(&self) -> usize {
        self.read().clients.len()
    }

    pub fn waiting_clients(&self) -> usize {
        self.read().waiting.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }
}
