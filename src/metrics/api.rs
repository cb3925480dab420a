//! Scrape endpoint
//!
//! Serves the latest stored snapshot to Prometheus:
//! - GET /metrics - Stored exposition text
//! - GET /health - Liveness probe
//!
//! Optionally guarded by HTTP Basic auth.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::store::SnapshotStore;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";
const AUTH_REALM: &str = "Metrics Authentication";

/// Basic auth credentials required by the scrape endpoint
#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    /// Check an `Authorization` header value
    pub fn verify(&self, header: Option<&str>) -> bool {
        let Some(encoded) = header.and_then(|h| h.trim().strip_prefix("Basic ")) else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        match decoded.split_once(':') {
            Some((user, pass)) => user == self.username && pass == self.password,
            None => false,
        }
    }
}

/// HTTP response produced by [`route`]
#[derive(Debug)]
pub struct Response {
    pub status: &'static str,
    pub content_type: &'static str,
    pub body: Bytes,
    pub challenge: bool,
}

impl Response {
    fn text(status: &'static str, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: EXPOSITION_CONTENT_TYPE,
            body: body.into(),
            challenge: false,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n",
            self.status,
            self.content_type,
            self.body.len()
        );
        if self.challenge {
            head.push_str(&format!("WWW-Authenticate: Basic realm=\"{AUTH_REALM}\"\r\n"));
        }
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

/// Route one request given its raw head
pub async fn route(request: &str, store: &dyn SnapshotStore, auth: Option<&BasicAuth>) -> Response {
    let mut lines = request.lines();
    let first_line = lines.next().unwrap_or("");
    let mut parts = first_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("/");
    let path = path.split('?').next().unwrap_or(path);

    if method != "GET" {
        return Response::text("405 Method Not Allowed", "# Method not allowed\n");
    }

    match path {
        "/metrics" | "/metrics/" => {
            if let Some(auth) = auth {
                let header = lines.find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.trim().eq_ignore_ascii_case("authorization").then_some(value)
                });
                if !auth.verify(header) {
                    let mut response = Response::text("401 Unauthorized", "# Unauthorized\n");
                    response.challenge = true;
                    return response;
                }
            }

            match store.get().await {
                Ok(Some(blob)) => Response::text("200 OK", blob),
                Ok(None) => Response::text("200 OK", "# No metrics available\n"),
                Err(e) => {
                    warn!(error = %e, "Failed to read snapshot for scrape");
                    Response::text("500 Internal Server Error", format!("# Error: {e}\n"))
                }
            }
        }
        "/health" => Response::text("200 OK", "ok\n"),
        _ => Response::text("404 Not Found", "# Not found\n"),
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    store: &dyn SnapshotStore,
    auth: Option<&BasicAuth>,
) -> std::io::Result<()> {
    let mut buffer = vec![0u8; 4096];
    let mut filled = 0;

    // Read until the end of the request head or the buffer is full.
    loop {
        let n = stream.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        if buffer[..filled].windows(4).any(|w| w == b"\r\n\r\n") || filled == buffer.len() {
            break;
        }
    }
    if filled == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..filled]);
    let response = route(&request, store, auth).await;

    stream.write_all(&response.encode()).await?;
    stream.flush().await?;
    Ok(())
}

/// Serve scrapes on an already bound listener until the stop signal fires
pub async fn serve_scrapes(
    listener: TcpListener,
    store: Arc<dyn SnapshotStore>,
    auth: Option<BasicAuth>,
    mut shutdown: watch::Receiver<bool>,
) {
    let auth = auth.map(Arc::new);

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => break,
        };

        match accepted {
            Ok((stream, peer)) => {
                let store = store.clone();
                let auth = auth.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, store.as_ref(), auth.as_deref()).await {
                        debug!(%peer, error = %e, "Scrape request error");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept scrape connection");
            }
        }
    }

    info!("Scrape server stopped");
}

/// Bind the scrape endpoint and serve it in the background
pub async fn start_scrape_server(
    addr: SocketAddr,
    store: Arc<dyn SnapshotStore>,
    auth: Option<BasicAuth>,
    shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind scrape endpoint on {addr}"))?;
    let local = listener.local_addr()?;

    if auth.is_none() {
        info!(addr = %local, "Scrape endpoint started (no authentication)");
    } else {
        info!(addr = %local, "Scrape endpoint started (basic auth)");
    }

    Ok(tokio::spawn(async move {
        serve_scrapes(listener, store, auth, shutdown).await;
    }))
}

/// Log and swallow a scrape server that ended abnormally
pub async fn join_scrape_server(handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        error!(error = %e, "Scrape server task failed");
    }
}
