use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use log::info;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;

use clickhouse_proxy::{
    BatcherConfig, BatcherPool, BinaryPool, ClientPool, Credentials, Proxy, ReusePool,
};

#[derive(Parser)]
#[command(name = "clickhouse-proxy", version, about = "ClickHouse native protocol tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reverse proxy: insert batching, request logging.
    Proxy(ProxyArgs),
}

#[derive(Args)]
struct ProxyArgs {
    /// Address to accept clients on.
    #[arg(long, short = 'l', default_value = "0.0.0.0:9000")]
    listen: String,

    /// Upstream ClickHouse address, `host:port` or `tcp://host:port`.
    #[arg(long, short = 'd', default_value = "tcp://127.0.0.1:9001")]
    dst: String,

    /// Default upstream database when a client does not name one.
    #[arg(long, default_value = "default")]
    database: String,

    #[arg(long, default_value = "default")]
    user: String,

    #[arg(long, default_value = "")]
    password: String,

    /// Max time to wait before committing a batch. 0s disables batching.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1m")]
    batch_max_interval: Duration,

    /// Max rows held in one batch.
    #[arg(long, default_value_t = 1_000_000)]
    batch_max_rows: u64,

    /// Max batch size, e.g. 100MiB, 512KB, 1GiB.
    #[arg(long, default_value = "100MiB")]
    batch_max_size: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Proxy(args) => run_proxy(args).await,
    }
}

async fn run_proxy(args: ProxyArgs) -> anyhow::Result<()> {
    let addr = parse_dst(&args.dst)?;

    let mut binary = BinaryPool::new(addr);
    binary.credentials = Credentials {
        database: args.database,
        user: args.user,
        password: args.password,
    };

    let inner: Arc<dyn ClientPool> = Arc::new(ReusePool::new(Arc::new(binary)));

    let pool: Arc<dyn ClientPool> = if args.batch_max_interval.is_zero() {
        inner
    } else {
        let cfg = BatcherConfig {
            max_interval: args.batch_max_interval,
            max_rows: args.batch_max_rows,
            max_bytes: parse_size(&args.batch_max_size).context("parse --batch-max-size")?,
            ..Default::default()
        };
        Arc::new(BatcherPool::new(inner, cfg))
    };

    let proxy = Proxy::new(pool.clone());

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("listen on {}", args.listen))?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutting down");
                cancel.cancel();
            }
        });
    }

    let served = proxy.serve(listener, cancel).await;

    // flush pending batches before reporting the serve outcome
    pool.close().await.context("close pool")?;
    served.context("serve")?;

    Ok(())
}

fn parse_dst(dst: &str) -> anyhow::Result<String> {
    if !dst.contains("://") {
        return Ok(dst.to_string());
    }

    let url = Url::parse(dst).with_context(|| format!("parse {dst:?}"))?;
    let host = url.host_str().context("dst has no host")?;
    let port = url.port().unwrap_or(9000);
    Ok(format!("{host}:{port}"))
}

static SIZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)((?:[KMG]i?)?B)$").expect("size regex"));

fn parse_size(s: &str) -> anyhow::Result<u64> {
    let caps = SIZE_RE
        .captures(s)
        .with_context(|| format!("bad size: {s:?}"))?;

    let n: u64 = caps[1].parse().context("size number")?;

    let shift = match caps[2].as_bytes()[0] {
        b'B' => 0,
        b'K' => 10,
        b'M' => 20,
        b'G' => 30,
        _ => unreachable!("anchored by the regex"),
    };

    Ok(n << shift)
}
