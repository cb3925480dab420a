//! Scrape endpoint tests against a running exporter

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use taskmon_exporter::event::{ChannelSource, RawEvent};
use taskmon_exporter::metrics::{serve_scrapes, BasicAuth, CounterKind};
use taskmon_exporter::store::{MemoryStore, SnapshotStore};

use crate::common::{exporter_with, parse_exposition, settings};

async fn get(addr: std::net::SocketAddr, path: &str, auth: Option<&str>) -> (String, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n");
    if let Some(auth) = auth {
        request.push_str(&format!("Authorization: Basic {}\r\n", STANDARD.encode(auth)));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    let (head, body) = response.split_once("\r\n\r\n").unwrap();
    (head.to_string(), body.to_string())
}

async fn scrape_server(
    store: Arc<dyn SnapshotStore>,
    auth: Option<BasicAuth>,
) -> (std::net::SocketAddr, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = watch::channel(false);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(serve_scrapes(listener, store, auth, rx));
    (addr, tx, handle)
}

#[tokio::test]
async fn test_scrape_sees_flushed_events() {
    let store = Arc::new(MemoryStore::new());
    let exporter = exporter_with(
        store.clone(),
        settings(Duration::from_millis(20), Duration::from_millis(5)),
    )
    .await;
    let (addr, stop_scrapes, server) = scrape_server(store.clone(), None).await;

    // The initial snapshot is visible before any event arrives.
    let (head, body) = get(addr, "/metrics", None).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(parse_exposition(&body)["celery_task_received_total"], 0.0);

    let (tx, source) = ChannelSource::channel(16);
    exporter.start(source).unwrap();
    tx.send(RawEvent::new("task-received", "e1").with_name("tasks.ping"))
        .await
        .unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let (_, body) = get(addr, "/metrics", None).await;
            if parse_exposition(&body)["celery_task_received_total"] == 1.0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(seen.is_ok(), "scrape never reflected the event");
    assert_eq!(exporter.state().snapshot().counter(CounterKind::Received), 1);

    exporter.stop().await;
    stop_scrapes.send(true).unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_scrape_requires_credentials() {
    let store = Arc::new(MemoryStore::new());
    let auth = BasicAuth {
        username: "prom".to_string(),
        password: "secret".to_string(),
    };
    let (addr, stop_scrapes, server) = scrape_server(store, Some(auth)).await;

    let (head, _) = get(addr, "/metrics", None).await;
    assert!(head.starts_with("HTTP/1.1 401 Unauthorized"));
    assert!(head.contains("WWW-Authenticate: Basic realm=\"Metrics Authentication\""));

    let (head, _) = get(addr, "/metrics", Some("prom:wrong")).await;
    assert!(head.starts_with("HTTP/1.1 401"));

    let (head, body) = get(addr, "/metrics", Some("prom:secret")).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body, "# No metrics available\n");

    let (head, body) = get(addr, "/health", None).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body, "ok\n");

    stop_scrapes.send(true).unwrap();
    server.await.unwrap();
}
