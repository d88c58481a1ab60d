//! BiDiB host example binary.
//!
//! # Usage
//!
//! ```bash
//! bidib-cli --port /dev/ttyUSB0
//! ```

use bidib_host::{Host, HostConfig};
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// BiDiB host example: opens a serial connection and prints node changes
#[derive(Parser, Debug)]
#[command(name = "bidib-cli")]
#[command(about = "Example BiDiB host against a serial port")]
#[command(version)]
struct Args {
    /// Serial device to connect to
    #[arg(short, long)]
    port: String,

    /// Baud rates to probe, in order, highest first
    #[arg(long, value_delimiter = ',', default_value = "1000000,115200,19200")]
    baud: Vec<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(port = %args.port, "opening BiDiB serial transport");

    let config = HostConfig { port_name: args.port.clone(), baud_probe_order: args.baud, ..Default::default() };
    let host = Host::bind(config).await?;

    tracing::info!("host ready, listening for node changes (ctrl-c to exit)");

    let _handle = host
        .register_node_changed(|root| {
            tracing::info!(?root, "node tree changed");
        })
        .await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    host.close().await?;

    Ok(())
}
