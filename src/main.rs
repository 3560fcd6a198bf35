use std::fs::OpenOptions;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dnswatch::view::ViewLoop;
use dnswatch::view::table::{TableRenderer, TerminalGuard, terminal_events};
use dnswatch::{Blocklist, Error, Proxy, ProxyConfig, Telemetry};

#[derive(Parser)]
#[command(name = "dnswatch")]
#[command(about = "DNS sinkhole proxy with a live per-domain query table", long_about = None)]
struct Args {
    /// Local port to listen on
    #[arg(short, long, default_value = "8853")]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    /// Upstream DNS server (ip:port)
    #[arg(short, long, default_value = "8.8.8.8:53")]
    upstream: String,

    /// JSON object mapping blocked domains to the address to answer with
    #[arg(short = 'l', long, default_value = "blacklist.json")]
    blocklist: PathBuf,

    /// TTL of sinkhole answers in seconds
    #[arg(long, default_value_t = 3600)]
    ttl: u32,

    /// Upstream timeout in milliseconds
    #[arg(long, default_value_t = 2000, value_parser = clap::value_parser!(u64).range(1..))]
    timeout_ms: u64,

    /// Table refresh interval in milliseconds
    #[arg(long, default_value_t = 300, value_parser = clap::value_parser!(u64).range(1..))]
    refresh_ms: u64,

    /// Log file, used while the table owns the terminal
    #[arg(long, default_value = "dnslog.log")]
    log_file: PathBuf,

    /// Serve without the table and log to stderr
    #[arg(long)]
    headless: bool,
}

fn init_logging(args: &Args) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if args.headless {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&args.log_file)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init();
    }

    Ok(())
}

async fn run(args: Args) -> Result<(), Error> {
    let bind_ip: IpAddr = args
        .bind
        .parse()
        .map_err(|_| Error::InvalidAddress(args.bind.clone()))?;
    let upstream: SocketAddr = args
        .upstream
        .parse()
        .map_err(|_| Error::InvalidAddress(args.upstream.clone()))?;

    let blocklist = Blocklist::load(&args.blocklist)?;
    info!(
        path = %args.blocklist.display(),
        domains = blocklist.len(),
        "blocklist loaded"
    );

    let mut config = ProxyConfig::new(SocketAddr::new(bind_ip, args.port), upstream);
    config.upstream_timeout = Duration::from_millis(args.timeout_ms);
    config.sinkhole_ttl = args.ttl;

    let telemetry = Arc::new(Telemetry::new());
    let proxy = Proxy::bind(config, blocklist, telemetry.clone()).await?.start();

    if args.headless {
        tokio::signal::ctrl_c().await?;
        info!("interrupted, shutting down");
        proxy.shutdown();
        return Ok(());
    }

    let mut guard = TerminalGuard::enter()?;
    let renderer = TableRenderer::new(Terminal::new(CrosstermBackend::new(io::stdout()))?);
    let (view, handle) =
        ViewLoop::new(telemetry, renderer, Duration::from_millis(args.refresh_ms));

    // Raw mode turns Ctrl-C into a key press; this covers signals sent by others.
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });

    let result = view.run(terminal_events()).await;
    signal.abort();
    guard.restore()?;
    result?;

    info!("view closed, shutting down");
    proxy.shutdown();
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("dnswatch: cannot open log file {}: {e}", args.log_file.display());
        return ExitCode::FAILURE;
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("dnswatch: cannot start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            eprintln!("dnswatch: {e}");
            ExitCode::FAILURE
        }
    }
}
