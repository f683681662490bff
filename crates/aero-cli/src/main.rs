mod sim;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

use aero_ingest::{doctor as ingest_doctor, AsyncExecutor, ConfigStore, NetworkConfig, TelemetryReader, TelemetryStore};

#[derive(Debug, Parser)]
#[command(name = "aerotelem", version, about = "AeroTelem - UDP telemetry ingestion for the ground station")]
struct Cli {
    /// Read only by the subcommands that need it.
    #[arg(long, default_value = "config/config.json")]
    config: String,

    /// Also write logs (without colors) to this file.
    #[arg(long)]
    log_file: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Receive telemetry and periodically print the latest sample.
    Run {
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    Doctor,
    /// Emit synthetic datagrams (defaults to the configured endpoint).
    Send {
        #[arg(long)]
        target: Option<SocketAddr>,
        #[arg(long)]
        count: Option<u64>,
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
        #[arg(long)]
        corrupt_every: Option<u64>,
    },
    Config { #[command(subcommand)] cmd: ConfigCmd },
}

#[derive(Debug, Subcommand)]
enum ConfigCmd {
    Get { key: String },
    /// VALUE is parsed as JSON, falling back to a plain string.
    Set { key: String, value: String },
}

fn init_logging(log_file: Option<&str>) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_file {
        Some(path) => {
            if let Some(dir) = Path::new(path).parent() {
                std::fs::create_dir_all(dir).with_context(|| format!("create log dir {}", dir.display()))?;
            }
            let f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(f)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .with(file_layer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;
    execute(cli).await
}

async fn execute(cli: Cli) -> Result<()> {
    let load = || ConfigStore::load(&cli.config).context("load config");

    match cli.cmd {
        Command::Run { interval_ms } => run(&load()?, interval_ms).await?,
        Command::Doctor => doctor(&load()?)?,
        Command::Send { target, count, interval_ms, corrupt_every } => {
            let target = match target {
                Some(t) => t,
                None => default_target(&load()?)?,
            };
            sim::send(sim::SendOptions {
                target,
                count,
                interval: Duration::from_millis(interval_ms.max(1)),
                corrupt_every,
            })
            .await?
        }
        Command::Config { cmd } => config_cmd(&mut load()?, cmd)?,
    }
    Ok(())
}

async fn run(cfg: &ConfigStore, interval_ms: u64) -> Result<()> {
    info!("run: starting");

    let mut executor = AsyncExecutor::new();
    executor.start().context("start executor")?;

    let mut store = TelemetryStore::new();
    if let Err(e) = store.start_from_config(&executor.handle()?, cfg) {
        executor.stop();
        return Err(e).context("start telemetry store");
    }
    let reader = store.reader();

    let mut tick = tokio::time::interval(Duration::from_millis(interval_ms.max(50)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                if let Err(e) = res {
                    warn!("run: ctrl-c handler failed: {}", e);
                }
                info!("run: shutting down");
                break;
            }
            _ = tick.tick() => report(&reader),
        }
    }

    // Both stops block until their threads/tasks are gone.
    tokio::task::spawn_blocking(move || {
        store.stop();
        executor.stop();
    })
    .await
    .context("shutdown")?;

    info!("run: stopped");
    Ok(())
}

fn report(reader: &TelemetryReader) {
    let stats = reader.stats();
    if stats.accepted == 0 {
        info!("telemetry: no valid datagram yet (rejected={})", stats.rejected());
        return;
    }
    let s = reader.sample();
    let (a, g, b) = (s.acceleration, s.angular_rate, s.barometric);
    info!(
        "telemetry: id={} acc=({:.3}, {:.3}, {:.3}) gyro=({:.3}, {:.3}, {:.3}) baro p={:.1}Pa t={:.2}C alt={:.2}m",
        s.message_id, a.x, a.y, a.z, g.x, g.y, g.z, b.pressure, b.temperature, b.altitude,
    );
    info!(
        "telemetry: ok={} len_err={} framing_err={} crc_err={} gaps={}",
        stats.accepted, stats.length_mismatch, stats.framing_error, stats.checksum_mismatch, stats.sequence_gaps,
    );
}

fn doctor(cfg: &ConfigStore) -> Result<()> {
    info!("doctor: starting");

    let net = ingest_doctor::check_network(cfg)?;
    if net.local_address.is_unspecified() {
        warn!("doctor: binding to 0.0.0.0 accepts telemetry on every interface");
    }
    ingest_doctor::check_bind(&net)?;

    info!("doctor: OK ({}:{})", net.local_address, net.local_port);
    Ok(())
}

fn default_target(cfg: &ConfigStore) -> Result<SocketAddr> {
    let net = NetworkConfig::from_store(cfg).context("no --target and no usable network config")?;
    let ip = if net.local_address.is_unspecified() { Ipv4Addr::LOCALHOST } else { net.local_address };
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, net.local_port)))
}

fn config_cmd(cfg: &mut ConfigStore, cmd: ConfigCmd) -> Result<()> {
    match cmd {
        ConfigCmd::Get { key } => {
            let v = cfg.get_raw(&key)?;
            println!("{}", serde_json::to_string_pretty(v)?);
        }
        ConfigCmd::Set { key, value } => {
            let v = serde_json::from_str::<serde_json::Value>(&value)
                .unwrap_or(serde_json::Value::String(value));
            cfg.set(&key, v)?;
            cfg.save().context("save config")?;
            info!("config: {} updated", key);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MISSING_CONFIG: &str = "/nonexistent/aerotelem/config.json";

    #[tokio::test]
    async fn test_send_with_target_needs_no_config() {
        let rx = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        rx.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let target = rx.local_addr().unwrap().to_string();

        let cli = Cli::try_parse_from([
            "aerotelem", "--config", MISSING_CONFIG, "send", "--target", &target, "--count", "1",
        ])
        .unwrap();
        execute(cli).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = rx.recv_from(&mut buf).unwrap();
        assert!(aero_proto::decode(&buf[..n]).is_ok());
    }

    #[tokio::test]
    async fn test_commands_using_config_report_missing_file() {
        let cli = Cli::try_parse_from(["aerotelem", "--config", MISSING_CONFIG, "doctor"]).unwrap();
        let err = execute(cli).await.unwrap_err();
        assert!(format!("{:#}", err).contains("load config"), "{:#}", err);
    }
}
