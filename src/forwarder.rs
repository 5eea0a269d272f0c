//! Transparent TCP forwarder with PROXY-protocol normalization.
//!
//! Every accepted client is inspected for an existing PROXY v1/v2 header.
//! A detected header is passed through to the backend byte-for-byte; a
//! direct client gets a synthetic v2 header built from its socket
//! addresses. After the header the two directions are spliced until both
//! observe EOF, with half-closes propagated so either side can finish
//! sending after the other stops.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::proxy_protocol::{self, PeekReader};

/// How long to wait for the backend dial before giving up on the client.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TcpForwarder {
    listener: TcpListener,
    backend_addr: String,
}

impl TcpForwarder {
    /// Bind the player-facing listener. Failure here is fatal to startup.
    pub async fn bind(listen_addr: &str, backend_addr: String) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("binding tcp listener on {listen_addr}"))?;
        info!(listen_addr = %listener.local_addr()?, backend = %backend_addr, "tcp forwarder listening");
        Ok(Self {
            listener,
            backend_addr,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Accept errors are logged and the loop continues; they
    /// are never fatal.
    pub async fn run(self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((socket, peer)) => {
                    let backend_addr = self.backend_addr.clone();
                    tokio::spawn(async move {
                        handle_client(socket, peer, backend_addr).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }
}

async fn handle_client(client: TcpStream, peer: SocketAddr, backend_addr: String) {
    // The listener-side local address feeds the synthetic header's
    // destination; grab it before the stream is split.
    let local_addr = client.local_addr();
    let (client_read, mut client_write) = client.into_split();
    let mut client_reader = PeekReader::new(client_read);

    let header = match proxy_protocol::detect(&mut client_reader).await {
        Ok(h) => h,
        Err(e) => {
            warn!(client = %peer, error = %e, "dropping connection with bad PROXY header");
            return;
        }
    };

    let (real_source, source_kind) = match &header {
        Some(h) => (h.source().unwrap_or(peer), "proxied"),
        None => (peer, "direct"),
    };
    info!(client = %peer, real = %real_source, source = source_kind, "new connection");

    let backend =
        match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&backend_addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(client = %peer, backend = %backend_addr, error = %e, "backend dial failed");
                return;
            }
            Err(_) => {
                warn!(client = %peer, backend = %backend_addr, "backend dial timed out");
                return;
            }
        };

    let (mut backend_read, mut backend_write) = backend.into_split();

    // Exactly one PROXY header goes out before any client payload:
    // the detected one verbatim, or a freshly built v2.
    let header_bytes = match &header {
        Some(h) => h.raw.clone(),
        None => match local_addr {
            Ok(local) => proxy_protocol::build_v2(peer, local),
            Err(_) => proxy_protocol::build_v2_local(),
        },
    };
    if let Err(e) = backend_write.write_all(&header_bytes).await {
        warn!(client = %peer, error = %e, "writing PROXY header to backend failed");
        return;
    }

    // Client -> backend reads through the peek buffer so bytes pulled in
    // during detection are not lost.
    let client_to_backend = tokio::spawn(async move {
        let result = tokio::io::copy(&mut client_reader, &mut backend_write).await;
        let _ = backend_write.shutdown().await;
        result
    });
    let backend_to_client = tokio::spawn(async move {
        let result = tokio::io::copy(&mut backend_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    });

    let (to_backend, to_client) = tokio::join!(client_to_backend, backend_to_client);
    log_splice_result("client->backend", peer, to_backend);
    log_splice_result("backend->client", peer, to_client);
    debug!(client = %peer, "connection closed");
}

fn log_splice_result(
    direction: &str,
    peer: SocketAddr,
    result: std::result::Result<io::Result<u64>, tokio::task::JoinError>,
) {
    match result {
        Ok(Ok(bytes)) => debug!(client = %peer, direction, bytes, "splice finished"),
        Ok(Err(e)) if is_benign_disconnect(&e) => {
            debug!(client = %peer, direction, error = %e, "peer went away")
        }
        Ok(Err(e)) => warn!(client = %peer, direction, error = %e, "splice error"),
        Err(e) => warn!(client = %peer, direction, error = %e, "splice task failed"),
    }
}

/// Resets and broken pipes at the end of a session are ordinary client
/// behavior, not faults worth a warning.
fn is_benign_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
