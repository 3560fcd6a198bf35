//! DNS sinkhole orchestration.
//!
//! Binds transports and runs the proxy server.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::error::{Error, Result};
use crate::filter::Blocklist;
use crate::hits::Telemetry;
use crate::resolver::{DEFAULT_SINKHOLE_TTL, Resolver};
use crate::stats::Stats;
use crate::transport::{tcp::TcpTransport, udp::UdpTransport};
use crate::upstream::Upstream;

pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for the DNS proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local address to bind (e.g., 127.0.0.1:8853), UDP and TCP.
    pub bind_addr: SocketAddr,
    /// Upstream DNS server for everything not on the blocklist.
    pub upstream: SocketAddr,
    /// Bound on one upstream round trip.
    pub upstream_timeout: Duration,
    /// TTL of synthesized sinkhole records.
    pub sinkhole_ttl: u32,
    /// How often aggregate stats are logged.
    pub stats_interval: Duration,
}

impl ProxyConfig {
    pub fn new(bind_addr: SocketAddr, upstream: SocketAddr) -> Self {
        Self {
            bind_addr,
            upstream,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            sinkhole_ttl: DEFAULT_SINKHOLE_TTL,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}

/// A bound, not yet running proxy.
pub struct Proxy {
    udp: UdpTransport,
    tcp: TcpTransport,
    resolver: Arc<Resolver>,
    local_addr: SocketAddr,
    stats_interval: Duration,
}

impl Proxy {
    /// Bind UDP and TCP on the configured address.
    ///
    /// The telemetry is created by the caller so the view can share it.
    pub async fn bind(
        config: ProxyConfig,
        blocklist: Blocklist,
        telemetry: Arc<Telemetry>,
    ) -> Result<Self> {
        let udp = UdpTransport::bind(config.bind_addr)
            .await
            .map_err(bind_error(config.bind_addr))?;
        // Same port for TCP, even when the configured one was 0.
        let local_addr = udp.local_addr().map_err(bind_error(config.bind_addr))?;
        let tcp = TcpTransport::bind(local_addr)
            .await
            .map_err(bind_error(local_addr))?;

        let upstream = Upstream::new(config.upstream, config.upstream_timeout);
        let resolver = Resolver::new(blocklist, upstream, telemetry, Arc::new(Stats::new()))
            .with_sinkhole_ttl(config.sinkhole_ttl);

        Ok(Self {
            udp,
            tcp,
            resolver: Arc::new(resolver),
            local_addr,
            stats_interval: config.stats_interval,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start serving. Transports run until the handle is shut down or the
    /// runtime exits.
    pub fn start(self) -> ProxyHandle {
        info!(
            listen = %self.local_addr,
            upstream = %self.resolver.upstream().addr(),
            blocked_domains = self.resolver.blocked_count(),
            "DNS sinkhole listening"
        );

        let tasks = vec![
            self.udp.start(self.resolver.clone()),
            self.tcp.start(self.resolver.clone()),
            tokio::spawn(log_stats(self.resolver.clone(), self.stats_interval)),
        ];

        ProxyHandle {
            local_addr: self.local_addr,
            tasks,
        }
    }
}

/// Running proxy tasks.
pub struct ProxyHandle {
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting queries. In-flight query tasks finish on their own.
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

fn bind_error(addr: SocketAddr) -> impl FnOnce(io::Error) -> Error {
    move |source| Error::Bind { addr, source }
}

/// Log aggregate stats every `every`.
async fn log_stats(resolver: Arc<Resolver>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await; // Skip first immediate tick

    loop {
        interval.tick().await;
        let stats = resolver.stats().snapshot_and_reset();
        let telemetry = resolver.telemetry();
        info!(
            uptime_secs = stats.uptime_secs,
            domains = telemetry.hits.len(),
            flagged = telemetry.blocked.len(),
            requests = stats.requests,
            forwarded = stats.forwarded,
            blocked = stats.blocked,
            upstream_failures = stats.upstream_failures,
            malformed = stats.malformed,
            avg_response_ms = stats.avg_response_ms,
            "stats"
        );
    }
}
