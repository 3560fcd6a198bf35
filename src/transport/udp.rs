//! UDP transport for DNS queries.
//!
//! One receive loop owns the listening socket; every datagram is handled in
//! its own task so a slow upstream never holds up other clients. Replies go
//! back through the shared socket to the datagram's source address.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::resolver::Resolver;

use super::{MAX_DNS_PACKET_SIZE, Protocol, QueryLogger};

/// UDP transport for the DNS sinkhole.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);

        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Start the UDP transport.
    ///
    /// Spawns the receive loop; it runs until the runtime shuts down.
    pub fn start(self, resolver: Arc<Resolver>) -> JoinHandle<()> {
        tokio::spawn(run(self.socket, resolver))
    }
}

/// Receive loop - spawns a handler task for each incoming datagram.
async fn run(socket: Arc<UdpSocket>, resolver: Arc<Resolver>) {
    let logger = QueryLogger::new(Protocol::Udp);
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "UDP recv error");
                continue;
            }
        };

        let packet = buf[..len].to_vec();
        let socket = socket.clone();
        let resolver = resolver.clone();

        tokio::spawn(async move {
            handle_query(&socket, &resolver, &packet, src, logger).await;
        });
    }
}

/// Resolve one datagram and send the reply.
async fn handle_query(
    socket: &UdpSocket,
    resolver: &Resolver,
    packet: &[u8],
    src: SocketAddr,
    logger: QueryLogger,
) {
    let start_time = Instant::now();

    let Some(resolution) = resolver.resolve(packet).await else {
        return;
    };

    if let Err(e) = socket.send_to(resolution.response(), src).await {
        warn!(client = %src, error = %e, "UDP response error");
        return;
    }

    logger.log(&resolution, src, start_time.elapsed());
}
