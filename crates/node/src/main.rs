mod chat;
mod config;

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use chat::ChatRoom;
use config::NodeConfig;
use interay::{HostType, NetworkManager, NetworkSettings, ReliableUdpTransport};

#[derive(Parser)]
#[command(name = "interay-node")]
#[command(about = "Runs an interay chat room as server, client or host")]
struct Args {
    #[arg(short, long, default_value = "server")]
    mode: HostType,

    #[arg(long, default_value = interay::DEFAULT_HOSTNAME)]
    hostname: String,

    #[arg(short, long, default_value_t = interay::settings::DEFAULT_TICK_RATE)]
    tick_rate: u32,

    #[arg(long, default_value_t = interay::settings::DEFAULT_MAX_CONNECTIONS)]
    max_connections: u32,

    #[arg(long, default_value_t = interay::settings::DEFAULT_MESSAGE_MAX_SIZE)]
    message_max_size: u32,

    #[arg(long, default_value_t = interay::settings::DEFAULT_MAX_NETWORK_ENTITIES)]
    max_entities: u32,

    #[arg(long, default_value_t = 10, help = "Seconds of silence before a peer is dropped")]
    peer_timeout: u64,

    #[arg(long, help = "Host relays only and does not join its own room")]
    only_server: bool,

    #[arg(short, long, default_value = "anonymous")]
    name: String,

    #[arg(long, default_value_t = 0, help = "Ticks between client pings, 0 disables")]
    ping_every: u32,

    #[arg(long, help = "Stop after this many seconds")]
    run_for: Option<u64>,
}

impl Args {
    fn into_config(self) -> NodeConfig {
        let settings = NetworkSettings::default()
            .with_tick_rate(self.tick_rate)
            .with_max_connections(self.max_connections)
            .with_message_max_size(self.message_max_size)
            .with_max_network_entities(self.max_entities)
            .with_only_server(self.only_server);

        NodeConfig {
            mode: self.mode,
            hostname: self.hostname,
            settings,
            peer_timeout: Duration::from_secs(self.peer_timeout),
            name: self.name,
            ping_every: self.ping_every,
            run_for: self.run_for.map(Duration::from_secs),
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config = Args::parse().into_config();

    let transport = ReliableUdpTransport::with_timings(config.timings());
    let mut manager = NetworkManager::with_transport(transport)?;
    manager.set_settings(config.settings.clone())?;
    chat::register(&mut manager)?;
    manager.set_host_entity(Box::new(ChatRoom::new(
        config.name.clone(),
        config.ping_every,
    )));

    manager
        .start_hostname(config.mode, &config.hostname)
        .with_context(|| format!("failed to start {} on {}", config.mode, config.hostname))?;
    if let Some(addr) = manager.local_addr() {
        log::info!("Bound to {}", addr);
    }

    run(&mut manager, &config);

    if let Some(stats) = manager.stats() {
        log::info!(
            "Sent {} packets ({} bytes), received {} ({} bytes), {:.1}% retransmitted",
            stats.packets_sent,
            stats.bytes_sent,
            stats.packets_received,
            stats.bytes_received,
            stats.retransmission_percent()
        );
    }
    if let Some(room) = manager.entity::<ChatRoom>(interay::NetworkId::HOST) {
        log::info!("{} lines seen, {} pongs", room.history().count(), room.pongs());
    }
    manager.stop();
    log::info!("Node shutting down");
    Ok(())
}

fn run(manager: &mut NetworkManager, config: &NodeConfig) {
    let started = Instant::now();
    let connect_timeout = config.timings().connect_timeout;
    let mut last_tick_time = Instant::now();
    let mut was_connected = false;

    loop {
        let now = Instant::now();
        let delta = now - last_tick_time;
        last_tick_time = now;
        manager.tick(delta);

        if config.mode == HostType::Client {
            let connected = manager.is_connected();
            if was_connected && !connected {
                log::info!("Connection to {} closed", config.hostname);
                break;
            }
            if !connected && started.elapsed() > connect_timeout {
                log::warn!("Could not connect to {}", config.hostname);
                break;
            }
            was_connected |= connected;
        }
        if config.run_for.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
}
