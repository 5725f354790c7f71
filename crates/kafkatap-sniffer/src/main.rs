use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use kafkatap_monitoring::{MetricsServer, RelationRegistry};
use kafkatap_sniffer::assembly::StreamFactory;
use kafkatap_sniffer::capture::{self, CaptureConfig};
use kafkatap_sniffer::reassembly::{Assembler, FLUSH_INTERVAL, IDLE_FLOW_TIMEOUT};

#[derive(Parser, Debug)]
#[command(
    name = "kafkatap",
    about = "Passive Kafka traffic probe: discovers producer/consumer to topic relations",
    version
)]
struct Cli {
    /// Interface to get packets from
    #[arg(short = 'i', long = "interface", default_value = "eth0")]
    interface: String,

    /// Kafka broker port
    #[arg(short = 'p', long = "port", default_value_t = 9092)]
    port: u16,

    /// Snapshot length for packet capture, in bytes
    #[arg(short = 's', long = "snaplen", default_value_t = 16 * 1024)]
    snaplen: i32,

    /// Kernel-level BPF filter
    #[arg(short = 'f', long = "filter", default_value = "tcp")]
    filter: String,

    /// Log every captured packet and decoded request
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Address the metrics endpoint listens on
    #[arg(long = "addr", default_value = ":9870")]
    listen_addr: String,

    /// Idle TTL of a discovered relation, e.g. 5m or 90s
    #[arg(long = "metrics-expire-time", value_parser = parse_duration, default_value = "5m")]
    expire_time: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "kafkatap=debug,info"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let registry = Arc::new(RelationRegistry::new(cli.expire_time));

    let metrics_addr = parse_listen_addr(&cli.listen_addr)?;
    let server = MetricsServer::new(Arc::clone(&registry), metrics_addr);
    tokio::spawn(async move {
        if let Err(err) = server.run().await {
            error!(error = %err, "metrics server failed");
        }
    });

    info!(interface = %cli.interface, filter = %cli.filter, "starting capture");
    let handle = capture::open(&CaptureConfig {
        interface: cli.interface.clone(),
        snaplen: cli.snaplen,
        filter: cli.filter.clone(),
    })
    .context("opening capture")?;

    let (segment_tx, mut segment_rx) = mpsc::channel(1024);
    std::thread::spawn(move || capture::run(handle, segment_tx));

    let mut assembler = Assembler::new(StreamFactory::new(registry));
    let mut flush = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            segment = segment_rx.recv() => {
                let Some(segment) = segment else {
                    anyhow::bail!("packet capture stopped");
                };
                if segment.flow.dst_port != cli.port {
                    debug!(flow = %segment.flow, "segment not for the broker port");
                    continue;
                }
                assembler.feed(segment).await;
            }
            _ = flush.tick() => {
                assembler.flush_idle(IDLE_FLOW_TIMEOUT).await;
                debug!(flows = assembler.flow_count(), "idle flush pass done");
            }
        }
    }
}

/// Accepts `:9870` shorthand as well as full socket addresses.
fn parse_listen_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_owned()
    };
    full.parse()
        .with_context(|| format!("invalid listen address {addr:?}"))
}

/// Parses durations like `300ms`, `90s`, `5m`, `2h`; a bare number is
/// seconds.
fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let count: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {value:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(count)),
        "" | "s" => Ok(Duration::from_secs(count)),
        "m" => Ok(Duration::from_secs(count * 60)),
        "h" => Ok(Duration::from_secs(count * 3600)),
        _ => Err(format!("invalid duration unit {unit:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("5 minutes").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn listen_addrs_parse() {
        assert_eq!(
            parse_listen_addr(":9870").unwrap(),
            "0.0.0.0:9870".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_listen_addr("127.0.0.1:9999").unwrap(),
            "127.0.0.1:9999".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_listen_addr("nonsense").is_err());
    }
}
