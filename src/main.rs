use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use clap::{Arg, ArgAction, Command};
use log::info;
use tokio::sync::watch;

use modbus_tcp_server::config::{Config, UnitMode};
use modbus_tcp_server::services::{ModbusTcpServer, RequestDispatcher};
use modbus_tcp_server::storage::{DataStore, MemoryStore, UnitRouter};
use modbus_tcp_server::VERSION;

fn build_cli() -> Command {
    Command::new("modbus_tcp_server")
        .version(VERSION)
        .about("Concurrent Modbus TCP server with typed register datastore")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Path to TOML configuration file"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .help("Bind address (default 0.0.0.0)"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("TCP port (default 502)"),
        )
        .arg(
            Arg::new("region-size")
                .long("region-size")
                .help("Entries per register region (default 10000)"),
        )
        .arg(
            Arg::new("idle-timeout")
                .long("idle-timeout")
                .help("Drop connections idle for this many seconds"),
        )
        .arg(
            Arg::new("units")
                .long("units")
                .help("Comma-separated unit ids; enables multi-unit routing"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable debug logging"),
        )
        .subcommand(
            Command::new("init-config")
                .about("Write a default configuration file and exit")
                .arg(Arg::new("path").default_value("config.toml")),
        )
}

/// One zeroed datastore per served unit, wired per the routing mode.
fn build_router(config: &Config) -> UnitRouter {
    match config.unit_mode {
        UnitMode::Single => UnitRouter::single(Arc::new(MemoryStore::new(config.region_size))),
        UnitMode::Multi => {
            let mut stores: HashMap<u8, Arc<dyn DataStore>> = HashMap::new();
            for &unit_id in &config.unit_ids {
                stores.insert(unit_id, Arc::new(MemoryStore::new(config.region_size)));
            }
            UnitRouter::multi(stores)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();

    let default_level = if matches.get_flag("verbose") {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    if let Some(sub) = matches.subcommand_matches("init-config") {
        let path = sub
            .get_one::<String>("path")
            .map(String::as_str)
            .unwrap_or("config.toml");
        Config::default().save_to_file(path)?;
        info!("📝 Wrote default configuration to {}", path);
        return Ok(());
    }

    let config = Config::from_matches(&matches)?;
    info!(
        "🖥️  {} v{} ({})",
        config.get_server_name(),
        VERSION,
        config.get_server_uuid()
    );

    let router = build_router(&config);
    let dispatcher = Arc::new(RequestDispatcher::new(router, config.limits.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ModbusTcpServer::new(config, dispatcher, shutdown_rx);

    let mut server_task = tokio::spawn(async move { server.serve().await });

    // A bind or serve failure must exit right away, not sit silently
    // behind the signal wait.
    tokio::select! {
        result = &mut server_task => {
            result??;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("🛑 Ctrl+C received, shutting down...");
            let _ = shutdown_tx.send(true);
            server_task.await??;
        }
    }

    Ok(())
}
