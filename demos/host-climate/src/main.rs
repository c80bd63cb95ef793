use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

use serde_json::json;

use tokio::net::TcpListener;

use tracing::{Level, info};

use ember::config::{DriverId, Settings, TaskConfig};

use ember_os::sim::HostBoard;
use ember_os::{Node, NodeConfig, serve};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server address.
    #[arg(short, long, default_value_t = Ipv4Addr::LOCALHOST)]
    address: Ipv4Addr,

    /// Server port.
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Settings file, in JSON format.
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Memory budget, in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    memory: usize,

    /// Time between two scheduler passes, in milliseconds.
    #[arg(long, default_value_t = 10)]
    tick: u64,
}

fn default_settings() -> Result<Settings, ember::error::Error> {
    let mut settings = Settings::default();
    settings.set_task(
        TaskConfig::new(0, DriverId(105), "Climate").params(json!({ "device": "aht20" })),
    )?;
    settings.set_task(
        TaskConfig::new(1, DriverId(38), "Strip").params(json!({ "led_count": 8 })),
    )?;
    Ok(settings)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => Settings::from_json(&std::fs::read_to_string(path)?)?,
        None => default_settings()?,
    };

    let config = NodeConfig::new()
        .memory_budget(cli.memory)
        .tick_interval(cli.tick);
    let node = Node::new(HostBoard::new(), settings, config)?;

    let listener = TcpListener::bind(SocketAddr::from((cli.address, cli.port))).await?;
    info!("Try `curl http://{}/json`", listener.local_addr()?);

    serve(node, listener, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    Ok(())
}
