use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use knx_bridge::constants::DEFAULT_EXPORTER_PORT;
use knx_bridge::logging::log_error;
use knx_bridge::{exposition, init_logger, log_info, AddressMapping, ExporterConfig, MetricsBridge, Poller};
use prometheus::Registry;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Parser)]
#[command(name = "knx-bridge", version)]
#[command(about = "Exports KNX group address values as Prometheus metrics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the bus and serve /metrics
    Run {
        #[arg(short = 'f', long, default_value = "config.yaml")]
        config: PathBuf,
        #[arg(short, long, default_value_t = DEFAULT_EXPORTER_PORT)]
        port: u16,
        #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
        listen: IpAddr,
    },
    /// Check a configuration file and list the metrics it defines
    Validate {
        #[arg(short = 'f', long, default_value = "config.yaml")]
        config: PathBuf,
    },
}

fn load(path: &Path) -> Result<ExporterConfig> {
    ExporterConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

async fn run(config: ExporterConfig, addr: SocketAddr) -> Result<()> {
    let bridge = MetricsBridge::from_config(config)?;
    let registry = Arc::new(Registry::new());
    bridge.register_into(&registry)?;

    let runner = bridge.clone();
    let session = tokio::spawn(async move { runner.run().await });
    let poller = Poller::new(bridge.clone());
    poller.start();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(exposition::bind_and_serve(addr, registry, async move {
        let _ = stop_rx.await;
    }));

    let served = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
            log_info("Shutting down");
            None
        }
        result = &mut server => Some(result),
    };

    let _ = stop_tx.send(());
    poller.stop().await;
    bridge.close().await;
    session.await??;
    match served {
        Some(result) => result?.context("metrics endpoint failed")?,
        None => server.await??,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            port,
            listen,
        } => {
            let config = load(&config)?;
            if let Err(e) = run(config, SocketAddr::new(listen, port)).await {
                log_error(&format!("{e:#}"));
                return Err(e);
            }
        }
        Commands::Validate { config } => {
            let path = config;
            let config = load(&path)?;
            let mapping = AddressMapping::from_config(&config)
                .with_context(|| format!("checking {}", path.display()))?;
            for descriptor in mapping.descriptors() {
                println!(
                    "{:<10} {:<8} {:<40} {:?}",
                    descriptor.address.to_string(),
                    descriptor.dpt.to_string(),
                    descriptor.name,
                    descriptor.kind
                );
            }
            log_info(&format!(
                "{} is valid: {} exported addresses",
                path.display(),
                mapping.len()
            ));
        }
    }

    Ok(())
}
