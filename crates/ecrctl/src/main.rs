//! ecrctl - operator CLI for ECR payment terminals
//!
//! Runs single transactions, split payments and partial refunds against a
//! terminal on a serial port or TCP address, and lists or watches attached
//! USB terminals. Results go to stdout as JSON, logs go to stderr.

mod legs;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ecrlink_core::device::{
    DeviceEvent, DeviceMonitor, DeviceRegistry, DeviceScanner, SerialPortScanner,
};
use ecrlink_core::orchestrator::{Ledger, PartialRefundRequest, SplitPlan};
use ecrlink_core::{
    ByteTransport, Command, EcrClient, EcrConfig, FileStore, KeyValueStore, SerialTransport,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// ECR terminal control
#[derive(Parser, Debug)]
#[command(name = "ecrctl")]
#[command(author = "ECR Link Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Drive ECR payment terminals over serial or TCP", long_about = None)]
struct Args {
    /// Serial port of the terminal (e.g. /dev/ttyUSB0, COM3)
    #[arg(long, conflicts_with = "tcp")]
    serial: Option<String>,

    /// Baud rate for --serial (default from config)
    #[arg(long, requires = "serial")]
    baud: Option<u32>,

    /// TCP address of the terminal (HOST:PORT)
    #[arg(long)]
    tcp: Option<String>,

    /// Config file (default: <config dir>/ecrlink/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Ledger and device store (default: <data dir>/ecrlink/store.json)
    #[arg(long)]
    store: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Cmd,
}

/// Amounts are in minor currency units
#[derive(Subcommand, Debug)]
enum Cmd {
    /// Check that the terminal answers
    Echo,
    Sale {
        amount: u64,
        #[arg(long, default_value = "01")]
        host: String,
        /// Free text printed on the slip (max 24 chars)
        #[arg(long)]
        data: Option<String>,
    },
    Void {
        amount: u64,
        trace: String,
        #[arg(long, default_value = "01")]
        host: String,
    },
    Refund {
        amount: u64,
        #[arg(long, default_value = "01")]
        host: String,
    },
    /// Refund part of an earlier transaction
    PartialRefund {
        /// Ledger id of the original transaction
        original_id: String,
        original_amount: u64,
        refund_amount: u64,
        #[arg(long, default_value = "01")]
        host: String,
    },
    PreAuth {
        amount: u64,
        #[arg(long, default_value = "01")]
        host: String,
    },
    WalletSale {
        amount: u64,
        /// QR code id (01-06)
        qr: String,
        #[arg(long, default_value = "EW")]
        host: String,
    },
    WalletRefund {
        amount: u64,
        qr: String,
        trace: String,
        #[arg(long, default_value = "EW")]
        host: String,
    },
    /// Close the batch of one host
    Settle {
        #[arg(long, default_value = "01")]
        host: String,
    },
    ReadCard,
    ScanQr {
        qr: String,
    },
    /// Query a transaction by trace number
    Status {
        trace: String,
        #[arg(long, default_value = "01")]
        host: String,
    },
    /// Pay one total in several legs
    Split {
        total: u64,
        /// card:<host>:<amount> or wallet:<host>:<qr-id>:<amount>
        #[arg(required = true, num_args = 2..=5)]
        legs: Vec<String>,
    },
    /// Print recorded transactions with their ledger ids
    History,
    /// List known and attached USB terminals
    Devices,
    /// Watch USB terminals until Ctrl+C
    Monitor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    let config = load_config(args.config.as_deref())?;
    let store_path = match &args.store {
        Some(path) => path.clone(),
        None => default_path(dirs::data_local_dir(), "store.json")?,
    };
    let store = FileStore::open(&store_path)
        .await
        .with_context(|| format!("Failed to open store {}", store_path.display()))?;
    let store: Arc<dyn KeyValueStore> = Arc::new(store);

    match args.command {
        Cmd::History => history(store).await,
        Cmd::Devices => list_devices(&config, store.as_ref()).await,
        Cmd::Monitor => monitor(&config, store).await,
        ref command => {
            let transport = transport(&args, &config)?;
            run_transaction(transport, &config, store, command).await
        }
    }
}

fn setup_logging(level: &str) -> Result<()> {
    let log_level = level.parse::<Level>().unwrap_or(Level::INFO);

    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

fn default_path(base: Option<PathBuf>, file: &str) -> Result<PathBuf> {
    let base = base.context("Cannot determine the user directory; pass the path explicitly")?;
    Ok(base.join("ecrlink").join(file))
}

fn load_config(path: Option<&Path>) -> Result<EcrConfig> {
    let config = match path {
        Some(path) => EcrConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => match dirs::config_dir() {
            Some(dir) => EcrConfig::load_or_default(dir.join("ecrlink").join("config.json"))?,
            None => EcrConfig::default(),
        },
    };
    Ok(config)
}

fn transport(args: &Args, config: &EcrConfig) -> Result<Box<dyn ByteTransport>> {
    match (&args.serial, &args.tcp) {
        (Some(port), None) => Ok(Box::new(config.serial.transport(port.clone(), args.baud))),
        (None, Some(address)) => Ok(Box::new(config.tcp.transport(address.clone()))),
        _ => bail!("No terminal given: use --serial PORT or --tcp HOST:PORT"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_transaction(
    transport: Box<dyn ByteTransport>,
    config: &EcrConfig,
    store: Arc<dyn KeyValueStore>,
    command: &Cmd,
) -> Result<()> {
    let mut client = EcrClient::new(transport, config).with_store(store);
    client.connect().await.context("Failed to connect to the terminal")?;

    // Ctrl+C cancels the exchange; the session sends ABORT
    let cancel = client.cancel_handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, cancelling");
            cancel.cancel();
        }
    });

    let result = dispatch(&mut client, command).await;
    if let Err(e) = client.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }
    result
}

async fn dispatch(client: &mut EcrClient<Box<dyn ByteTransport>>, command: &Cmd) -> Result<()> {
    match command {
        Cmd::Echo => print_json(&client.echo_test().await?),
        Cmd::Sale { amount, host, data } => {
            let mut sale = Command::sale(host.as_str(), *amount);
            if let Some(data) = data {
                sale = sale.with_additional_data(data.as_str());
            }
            print_json(&client.execute(&sale).await?)
        }
        Cmd::Void { amount, trace, host } => print_json(&client.void(host, *amount, trace).await?),
        Cmd::Refund { amount, host } => print_json(&client.refund(host, *amount).await?),
        Cmd::PartialRefund {
            original_id,
            original_amount,
            refund_amount,
            host,
        } => {
            let request = PartialRefundRequest::new(
                original_id.as_str(),
                *original_amount,
                *refund_amount,
                host.as_str(),
            );
            print_json(&client.partial_refund(&request).await?)
        }
        Cmd::PreAuth { amount, host } => {
            print_json(&client.execute(&Command::pre_auth(host.as_str(), *amount)).await?)
        }
        Cmd::WalletSale { amount, qr, host } => {
            print_json(&client.wallet_sale(host, *amount, qr).await?)
        }
        Cmd::WalletRefund {
            amount,
            qr,
            trace,
            host,
        } => {
            let refund = Command::wallet_refund(host.as_str(), *amount, qr.as_str(), trace.as_str());
            print_json(&client.execute(&refund).await?)
        }
        Cmd::Settle { host } => print_json(&client.settlement(host).await?),
        Cmd::ReadCard => print_json(&client.read_card().await?),
        Cmd::ScanQr { qr } => print_json(&client.scan_qr(qr).await?),
        Cmd::Status { trace, host } => print_json(&client.transaction_status(host, trace).await?),
        Cmd::Split { total, legs } => {
            let legs = legs
                .iter()
                .map(|leg| legs::parse_leg(leg))
                .collect::<Result<Vec<_>>>()?;
            let split = client.split_payment(&SplitPlan::new(*total, legs)).await?;
            info!("Split payment {} is {:?}", split.id, split.status);
            print_json(&split)
        }
        Cmd::History | Cmd::Devices | Cmd::Monitor => bail!("{:?} does not run against a terminal", command),
    }
}

async fn history(store: Arc<dyn KeyValueStore>) -> Result<()> {
    let ledger = Ledger::new(store);
    print_json(&ledger.transactions().await?)
}

async fn list_devices(config: &EcrConfig, store: &dyn KeyValueStore) -> Result<()> {
    let mut registry = DeviceRegistry::new(&config.registry);
    registry.load(store).await?;
    let scanner = SerialPortScanner::new();
    let scan = scanner
        .scan()
        .context("Failed to enumerate serial ports")?;
    registry.observe(&scan);
    registry.set_active(None)?;
    registry.save(store).await?;
    print_json(&registry.devices().collect::<Vec<_>>())
}

async fn monitor(config: &EcrConfig, store: Arc<dyn KeyValueStore>) -> Result<()> {
    let mut registry = DeviceRegistry::new(&config.registry);
    registry.load(store.as_ref()).await?;
    let registry = Arc::new(Mutex::new(registry));

    let in_flight = Arc::new(AtomicBool::new(false));
    let monitor = DeviceMonitor::new(registry.clone(), SerialPortScanner::new(), &config.registry)
        .pause_while(in_flight.clone());
    let (tx, mut rx) = mpsc::channel(32);
    let shutdown = CancellationToken::new();
    let task = monitor.spawn(tx, shutdown.clone());

    info!("Watching USB terminals, press Ctrl+C to stop");
    let mut session: Option<(String, EcrClient<SerialTransport>)> = None;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            event = rx.recv() => {
                let Some(event) = event else { break };
                print_json(&event)?;
                match event {
                    DeviceEvent::AutoConnect(device) => {
                        let transport = config.serial.transport(device.port_name.clone(), Some(device.baud_rate));
                        let mut client = EcrClient::new(transport, config).share_in_flight(in_flight.clone());
                        let echo = match client.connect().await {
                            Ok(()) => client.echo_test().await,
                            Err(e) => Err(e),
                        };
                        match echo {
                            Ok(response) => {
                                print_json(&response)?;
                                info!("Session open on {}", device.display_name());
                                session = Some((device.id.clone(), client));
                            }
                            Err(e) => {
                                warn!("Echo test on {} failed: {}", device.display_name(), e);
                                close_session(&device.id, client).await;
                                registry.lock().await.set_active(None)?;
                            }
                        }
                    }
                    DeviceEvent::ActiveDeviceLost(id) => {
                        close_lost_session(&mut session, &id).await;
                        registry.lock().await.set_active(None)?;
                    }
                    _ => {}
                }
            }
        }
    }

    if let Some((id, client)) = session.take() {
        close_session(&id, client).await;
    }
    shutdown.cancel();
    task.await.context("Device monitor task failed")?;
    registry.lock().await.save(store.as_ref()).await?;
    Ok(())
}

/// Tear down the open session if it belongs to the lost device
async fn close_lost_session<T: ByteTransport>(
    session: &mut Option<(String, EcrClient<T>)>,
    device_id: &str,
) -> bool {
    if !session.as_ref().is_some_and(|(open, _)| open == device_id) {
        return false;
    }
    match session.take() {
        Some((_, client)) => {
            close_session(device_id, client).await;
            true
        }
        None => false,
    }
}

async fn close_session<T: ByteTransport>(device_id: &str, mut client: EcrClient<T>) {
    match client.disconnect().await {
        Ok(()) => info!("Closed session on {}", device_id),
        Err(e) => warn!("Closing session on {} failed: {}", device_id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecrlink_core::MockTransport;

    #[test]
    fn test_split_args_parse() {
        let args = Args::try_parse_from([
            "ecrctl",
            "--tcp",
            "10.0.0.5:9000",
            "split",
            "1000",
            "card:01:600",
            "wallet:EW:01:400",
        ])
        .unwrap();
        match args.command {
            Cmd::Split { total, legs } => {
                assert_eq!(total, 1000);
                assert_eq!(legs.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_serial_and_tcp_conflict() {
        assert!(Args::try_parse_from([
            "ecrctl", "--serial", "COM3", "--tcp", "h:1", "echo"
        ])
        .is_err());
    }

    #[tokio::test]
    async fn test_lost_device_closes_only_its_session() {
        let transport = MockTransport::connected();
        let handle = transport.handle();
        let client = EcrClient::new(transport, &EcrConfig::default());
        let mut session = Some(("usb-a".to_string(), client));

        assert!(!close_lost_session(&mut session, "usb-b").await);
        assert!(session.as_ref().is_some_and(|(_, c)| c.is_connected()));

        assert!(close_lost_session(&mut session, "usb-a").await);
        assert!(session.is_none());
        assert!(handle.writes().is_empty());
    }

    #[test]
    fn test_missing_terminal_is_reported() {
        let args = Args::try_parse_from(["ecrctl", "echo"]).unwrap();
        let err = transport(&args, &EcrConfig::default()).err().unwrap();
        assert!(err.to_string().contains("--serial"));
    }
}
