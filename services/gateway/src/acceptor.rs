//! TCP acceptor with first-byte TLS detection.
//!
//! The listener binds with `SO_REUSEPORT` so multiple worker processes on
//! one host can share the port.  Each accepted connection is classified by
//! peeking its first byte: a TLS ClientHello starts with a handshake
//! record (0x16), a plain HTTP upgrade with an ASCII method.  The matching
//! branch performs the WebSocket upgrade under the handshake deadline and
//! hands the stream to the worker.

use std::fs::File;
use std::io;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async_with_config};
use tracing::{debug, info};

use crate::worker::WorkerEvent;

/// An upgraded client connection, plain or TLS.
pub enum ClientStream {
    Plain(WebSocketStream<TcpStream>),
    Tls(WebSocketStream<tokio_rustls::server::TlsStream<TcpStream>>),
}

#[derive(Clone)]
pub struct AcceptorConfig {
    pub server_name: String,
    pub handshake_timeout: Duration,
    pub max_frame_bytes: usize,
    /// TLS branch; `None` makes the listener plain-only.
    pub tls: Option<TlsAcceptor>,
}

/// Bind the shared listen socket.
pub fn bind(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Build a TLS acceptor from PEM files.
pub fn load_tls(
    cert_file: &Path,
    key_file: &Path,
) -> Result<TlsAcceptor, Box<dyn std::error::Error + Send + Sync>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_file)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_file)?))?
        .ok_or("no private key found in key file")?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Accept loop; runs until `shutdown` flips.
pub async fn run(
    cfg: AcceptorConfig,
    listener: TcpListener,
    events: mpsc::UnboundedSender<WorkerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "accepting connections");
    }
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("acceptor stopped");
                    return;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let cfg = cfg.clone();
                    let events = events.clone();
                    tokio::spawn(handle_connection(stream, peer, cfg, events));
                }
                Err(e) => debug!(error = %e, "accept failed"),
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    cfg: AcceptorConfig,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    match timeout(cfg.handshake_timeout, upgrade(stream, &cfg)).await {
        Ok(Ok(client)) => {
            let _ = events.send(WorkerEvent::NewConnection(client));
        }
        Ok(Err(e)) => debug!(%peer, error = %e, "handshake failed"),
        Err(_) => debug!(%peer, "handshake timeout"),
    }
}

async fn upgrade(
    stream: TcpStream,
    cfg: &AcceptorConfig,
) -> Result<ClientStream, Box<dyn std::error::Error + Send + Sync>> {
    let ws_config = WebSocketConfig::default().max_message_size(Some(cfg.max_frame_bytes));
    let server_name = cfg.server_name.clone();
    let callback = move |_req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        if let Ok(value) = HeaderValue::from_str(&server_name) {
            resp.headers_mut().insert("Server", value);
        }
        Ok(resp)
    };

    let mut first = [0u8; 1];
    let n = stream.peek(&mut first).await?;
    if n == 1 && first[0] == 0x16 {
        let Some(tls) = cfg.tls.clone() else {
            return Err("TLS handshake on a plain-only listener".into());
        };
        let tls_stream = tls.accept(stream).await?;
        let ws = accept_hdr_async_with_config(tls_stream, callback, Some(ws_config)).await?;
        Ok(ClientStream::Tls(ws))
    } else {
        let ws = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
        Ok(ClientStream::Plain(ws))
    }
}
