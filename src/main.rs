//! Host binary: bootstraps logging and configuration, brings up the object
//! cache, pairing agent, RFCOMM server, and MQTT proxy, then runs the
//! periodic inventory ticker until `Ctrl+C`.

use bluetooth_mqtt_bridge::cache::Cache;
use bluetooth_mqtt_bridge::config::Config;
use bluetooth_mqtt_bridge::mqtt::Proxy;
use bluetooth_mqtt_bridge::rfcomm::server::ServerConfig;
use bluetooth_mqtt_bridge::rfcomm::Server;
use bluetooth_mqtt_bridge::{agent, logging};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(name = "bluetooth-mqtt-bridge", about = "Bridges a Bluetooth Classic adapter to an MQTT bus")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    logging::init(config.get_str("log.dir", "logs"))?;
    if cli.verbose > 0 {
        log::info!("verbose flag set ({}), still governed by the configured sink levels", cli.verbose);
    }

    let session = bluer::Session::new().await?;
    let cache = Cache::new(session.clone()).await?;
    cache.set_max_repair_count(config.get_i64("bluetooth.max_repair_count", 3) as u32);
    cache.set_max_reconnect_count(config.get_i64("bluetooth.max_reconnect_count", 3) as u32);
    cache.set_pair_timeout_ms(config.get_i64("bluetooth.timeout_pair_ms", 1000) as u64);
    cache.set_connect_timeout_ms(config.get_i64("bluetooth.timeout_connect_ms", 1000) as u64);

    let _agent_handle = agent::register(&session, cache.clone()).await?;

    let server = Server::new(ServerConfig {
        service_name: config.get_str("bluetooth.server.name", "bluetooth-mqtt-bridge"),
        channel: config.get_i64("bluetooth.server.channel", 0) as u8,
        buffer_size: config.get_i64("bluetooth.server.socket_buffer_size", 1024) as usize,
        accept_timeout_ms: config.get_i64("bluetooth.server.socket_accpet_timeout_ms", 1000) as u64,
        recv_timeout_ms: config.get_i64("bluetooth.server.socket_recv_timeout_ms", 1000) as u64,
    });

    let (proxy, event_loop) = Proxy::new(&config, cache.clone(), server.clone());
    proxy.wire_server();
    server.start().await?;
    proxy.subscribe().await?;

    let proxy_for_loop = proxy.clone();
    tokio::spawn(async move { proxy_for_loop.run_event_loop(event_loop).await });

    let running = Arc::new(AtomicBool::new(true));
    let running_for_signal = running.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown signal received");
            running_for_signal.store(false, Ordering::SeqCst);
        }
    });

    let publish_interval_ms = config.get_i64("bluetooth.publish_interval_ms", 1000) as u64;
    let mut accumulated = 0u64;
    let mut ticker = tokio::time::interval(Duration::from_millis(50));
    while running.load(Ordering::SeqCst) {
        ticker.tick().await;
        accumulated += 50;
        if accumulated >= publish_interval_ms {
            accumulated = 0;
            proxy.publish_inventory().await;
        }
    }

    log::info!("stopping");
    server.stop().await;
    proxy.shutdown().await;
    Ok(())
}
