use clap::Parser;
use herd_console::fleet::{FleetAggregator, DEFAULT_TTL};
use herd_console::prompt::{log_acks, run_prompt};
use herd_console::{http, render_table};
use herd_device::bus::{MqttBus, MqttSettings, SharedBus, TransportScope};
use herd_device::logging::init_logging;
use herd_device::signals::wait_for_shutdown_signal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{error, info};

/// Fleet console for Herd devices
#[derive(Debug, Parser)]
#[command(name = "herd-console", version)]
struct Args {
    /// MQTT broker host
    #[arg(long, env = "HERD_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "HERD_BROKER_PORT", default_value_t = 1883)]
    port: u16,

    /// Seconds without heartbeat before a device is shown offline
    #[arg(long, default_value_t = DEFAULT_TTL)]
    ttl: u64,

    /// Serve the fleet table over HTTP on this address
    #[arg(long)]
    http: Option<SocketAddr>,

    /// Print the table every time it changes
    #[arg(long)]
    watch: bool,

    /// Append-only log file in addition to stderr
    #[arg(long)]
    log: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(args.log.as_deref())?;
    info!("herd-console {} -> {}:{}", env!("CARGO_PKG_VERSION"), args.broker, args.port);

    let settings = MqttSettings {
        host: args.broker.clone(),
        port: args.port,
        ..MqttSettings::default()
    };
    let client_id = format!("herd-console-{}", std::process::id());
    let bus: SharedBus = Arc::new(MqttBus::connect(&client_id, &settings, TransportScope::Fleet)?);
    let fleet = FleetAggregator::new(args.ttl);

    let aggregator = {
        let fleet = fleet.clone();
        let bus = bus.clone();
        tokio::spawn(async move {
            let forever = std::future::pending::<()>();
            if let Err(e) = fleet.run(bus, forever).await {
                error!("[fleet] aggregator failed: {:#}", e);
            }
        })
    };

    let acks = tokio::spawn(log_acks(bus.clone()));

    if let Some(addr) = args.http {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("[http] fleet view on http://{}", addr);
        let router = http::build_router(fleet.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!("[http] server failed: {}", e);
            }
        });
    }

    if args.watch {
        let mut updates = fleet.subscribe();
        tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let table = render_table(&updates.borrow_and_update());
                println!("{table}");
            }
        });
    }

    let stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = run_prompt(stdin, bus.clone(), fleet.clone()) => result?,
        signal = wait_for_shutdown_signal() => {
            if let Err(e) = signal {
                error!("signal handler failed: {}", e);
            }
            info!("shutdown signal received");
        }
    }

    if let Err(e) = bus.close().await {
        error!("[bus] close failed: {}", e);
    }
    aggregator.abort();
    acks.abort();
    info!("herd-console exited");
    Ok(())
}
