use rndz_pair::udp::{Client, ClientConfig, ClientState, Server, ServerConfig, DEFAULT_PORT};
use rndz_pair::Result;
use std::net::SocketAddr;
use std::time::Duration;
use structopt::StructOpt;
use tokio::signal::ctrl_c;

#[derive(StructOpt, Debug)]
#[structopt(name = "rndz-pair")]
enum Opt {
    /// run the rendezvous server
    Server(ServerOpt),
    /// join the network and talk to the first peer assigned
    Client(ClientOpt),
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
    #[structopt(long = "listen-addr", default_value = "0.0.0.0:3478")]
    listen_addr: SocketAddr,

    /// seconds without a ping before a waiting client is dropped
    #[structopt(long = "client-timeout", default_value = "30")]
    client_timeout: u64,

    /// seconds between client pings
    #[structopt(long = "ping-interval", default_value = "10")]
    ping_interval: u64,

    #[structopt(long = "max-queue-size", default_value = "100")]
    max_queue_size: usize,

    #[structopt(long = "quiet")]
    quiet: bool,
}

#[derive(StructOpt, Debug)]
struct ClientOpt {
    #[structopt(long = "server-addr")]
    server_addr: String,

    #[structopt(long = "id")]
    id: Option<String>,

    #[structopt(long = "local-addr")]
    local_addr: Option<SocketAddr>,

    /// sent to the peer once connected
    #[structopt(long = "message")]
    message: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt: Opt = StructOpt::from_args();

    match opt {
        Opt::Server(opt) => run_server(opt).await,
        Opt::Client(opt) => run_client(opt).await,
    }
}

async fn run_server(opt: ServerOpt) -> Result<()> {
    let mut s = Server::new(ServerConfig {
        listen_addr: opt.listen_addr.to_string(),
        client_timeout: Duration::from_secs(opt.client_timeout),
        ping_interval: Duration::from_secs(opt.ping_interval),
        max_queue_size: opt.max_queue_size,
        enable_logging: !opt.quiet,
    });
    s.start().await?;

    ctrl_c().await?;
    log::info!("shutting down");
    s.stop().await;
    Ok(())
}

async fn run_client(opt: ClientOpt) -> Result<()> {
    let server_addr = if opt.server_addr.contains(':') {
        opt.server_addr
    } else {
        format!("{}:{}", opt.server_addr, DEFAULT_PORT)
    };

    let mut config = ClientConfig::new(server_addr);
    config.id = opt.id;
    config.local_addr = opt.local_addr;

    let c = Client::new(config)?;
    c.on_state_change(|s| println!("state: {}", s));
    c.on_error(|e| log::warn!("{}", e));
    c.on_message_received(|from, data| {
        println!("{}: {}", from, String::from_utf8_lossy(data));
    });

    c.connect().await?;

    loop {
        let peer = tokio::select! {
            _ = ctrl_c() => break,
            p = c.wait_for_peer() => p,
        };

        let peer = match peer {
            Ok(peer) => peer,
            Err(e) => {
                log::info!("{}, still waiting", e);
                continue;
            }
        };

        println!("peer {} at {}", peer.id, peer.addr);
        c.connect_to_peer(&peer.id)?;

        if let Some(ref m) = opt.message {
            // let the punch burst open both mappings first
            tokio::time::sleep(Duration::from_millis(300)).await;
            c.send_to_peer(&peer.id, m.as_bytes()).await?;
        }

        // back to waiting only when every peer timed out
        while c.state() == ClientState::ConnectedToPeer {
            tokio::select! {
                _ = ctrl_c() => {
                    c.disconnect().await;
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }

    c.disconnect().await;
    Ok(())
}
