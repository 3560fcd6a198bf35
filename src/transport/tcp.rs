//! TCP transport for DNS queries.
//!
//! Each client connection is handled independently. TCP DNS messages are
//! prefixed with a 2-byte length; a client may send several queries on one
//! connection and gets the replies back in order. Forwarding to the upstream
//! still happens over UDP.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::resolver::Resolver;

use super::{Protocol, QueryLogger};

/// Connections with no complete query for this long are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP transport for the DNS sinkhole.
///
/// Binds to a local address and accepts connections from clients.
/// Each connection is handled in a separate task.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind a TCP listener for the transport.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the TCP transport.
    ///
    /// Spawns an accept loop that handles each connection in a separate task.
    pub fn start(self, resolver: Arc<Resolver>) -> JoinHandle<()> {
        tokio::spawn(run_accept_loop(self.listener, resolver))
    }
}

/// Accept loop - spawns a handler task for each incoming connection.
async fn run_accept_loop(listener: TcpListener, resolver: Arc<Resolver>) {
    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                tokio::spawn(handle_connection(client, peer, resolver.clone()));
            }
            Err(e) => {
                warn!(error = %e, "TCP accept error");
            }
        }
    }
}

/// Serve queries on one connection until the client goes away.
async fn handle_connection(mut client: TcpStream, peer: SocketAddr, resolver: Arc<Resolver>) {
    let logger = QueryLogger::new(Protocol::Tcp);

    loop {
        let query = match tokio::time::timeout(IDLE_TIMEOUT, read_dns_message(&mut client)).await {
            Ok(Some(q)) => q,
            Ok(None) => return,
            Err(_) => {
                debug!(client = %peer, "closing idle TCP connection");
                return;
            }
        };

        let start_time = Instant::now();
        let Some(resolution) = resolver.resolve(&query).await else {
            return;
        };

        if let Err(e) = write_dns_message(&mut client, resolution.response()).await {
            warn!(client = %peer, error = %e, "TCP response error");
            return;
        }

        logger.log(&resolution, peer, start_time.elapsed());
    }
}

/// Read one length-prefixed DNS message, returning it without the prefix.
///
/// Returns `None` when the stream closes or errors.
async fn read_dns_message(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let msg_len = stream.read_u16().await.ok()? as usize;
    let mut buf = vec![0u8; msg_len];
    stream.read_exact(&mut buf).await.ok()?;

    Some(buf)
}

async fn write_dns_message(stream: &mut TcpStream, message: &[u8]) -> io::Result<()> {
    let len = u16::try_from(message.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "DNS message too long"))?;

    let mut framed = Vec::with_capacity(2 + message.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);

    stream.write_all(&framed).await
}
