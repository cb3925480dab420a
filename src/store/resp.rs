//! RESP key-value cache store
//!
//! Speaks the RESP2 request/reply protocol used by Redis-compatible caches.
//! Only `SELECT`, `SET` and `GET` are issued. The connection is opened
//! lazily and discarded after any I/O or framing error.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{SnapshotStore, StoreError};

/// Upper bound on a bulk reply we are willing to buffer
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Decoded server reply
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
}

/// Encode a command as a RESP array of bulk strings
pub fn encode_command(args: &[&[u8]]) -> BytesMut {
    let payload: usize = args.iter().map(|a| a.len() + 16).sum();
    let mut buf = BytesMut::with_capacity(16 + payload);
    buf.put_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.put_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
    buf
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, StoreError> {
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(StoreError::Protocol("connection closed by server".to_string()));
    }
    if !line.ends_with(b"\r\n") {
        return Err(StoreError::Protocol("reply line not terminated by CRLF".to_string()));
    }
    line.truncate(line.len() - 2);
    String::from_utf8(line).map_err(|_| StoreError::Protocol("reply line is not UTF-8".to_string()))
}

/// Read a single reply
pub async fn read_reply<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Reply, StoreError> {
    let line = read_line(reader).await?;
    let kind = line.get(..1).unwrap_or("");
    let rest = line.get(1..).unwrap_or("");

    match kind {
        "+" => Ok(Reply::Simple(rest.to_string())),
        "-" => Ok(Reply::Error(rest.to_string())),
        ":" => rest
            .parse()
            .map(Reply::Integer)
            .map_err(|_| StoreError::Protocol(format!("invalid integer reply: {rest}"))),
        "$" => {
            let len: i64 = rest
                .parse()
                .map_err(|_| StoreError::Protocol(format!("invalid bulk length: {rest}")))?;
            if len < 0 {
                return Ok(Reply::Bulk(None));
            }
            let len = len as usize;
            if len > MAX_BULK_LEN {
                return Err(StoreError::Protocol(format!("bulk reply too large: {len} bytes")));
            }

            let mut data = vec![0u8; len + 2];
            reader.read_exact(&mut data).await?;
            if !data.ends_with(b"\r\n") {
                return Err(StoreError::Protocol("bulk reply not terminated by CRLF".to_string()));
            }
            data.truncate(len);
            Ok(Reply::Bulk(Some(Bytes::from(data))))
        }
        other => Err(StoreError::Protocol(format!("unsupported reply type: {other:?}"))),
    }
}

/// Send one command and read its reply
pub async fn execute<S>(stream: &mut S, args: &[&[u8]]) -> Result<Reply, StoreError>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    stream.write_all(&encode_command(args)).await?;
    stream.flush().await?;
    read_reply(stream).await
}

fn expect_ok(reply: Reply) -> Result<(), StoreError> {
    match reply {
        Reply::Simple(s) if s == "OK" => Ok(()),
        Reply::Error(e) => Err(StoreError::Rejected(e)),
        other => Err(StoreError::Protocol(format!("expected +OK, got {other:?}"))),
    }
}

/// Snapshot stored under one key of a RESP cache
pub struct RespStore {
    addr: String,
    key: String,
    db: Option<u32>,
    timeout: Duration,
    conn: Mutex<Option<BufStream<TcpStream>>>,
}

impl RespStore {
    pub fn new(addr: impl Into<String>, key: impl Into<String>, db: Option<u32>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            key: key.into(),
            db,
            timeout,
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<BufStream<TcpStream>, StoreError> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        let mut stream = BufStream::new(stream);

        if let Some(db) = self.db {
            let db = db.to_string();
            expect_ok(execute(&mut stream, &[b"SELECT", db.as_bytes()]).await?)?;
        }

        info!(addr = %self.addr, db = ?self.db, "Connected to snapshot cache");
        Ok(stream)
    }

    async fn call(&self, args: &[&[u8]]) -> Result<Reply, StoreError> {
        let mut conn = self.conn.lock().await;

        let result = tokio::time::timeout(self.timeout, async {
            if conn.is_none() {
                *conn = Some(self.connect().await?);
            }
            match conn.as_mut() {
                Some(stream) => execute(stream, args).await,
                None => Err(StoreError::Protocol("connection unavailable".to_string())),
            }
        })
        .await
        .unwrap_or(Err(StoreError::Timeout(self.timeout)));

        if let Err(e) = &result {
            debug!(addr = %self.addr, error = %e, "Dropping cache connection");
            *conn = None;
        }
        result
    }
}

#[async_trait]
impl SnapshotStore for RespStore {
    async fn put(&self, blob: Bytes) -> Result<(), StoreError> {
        let reply = self.call(&[b"SET", self.key.as_bytes(), &blob[..]]).await?;
        expect_ok(reply)
    }

    async fn get(&self) -> Result<Option<Bytes>, StoreError> {
        match self.call(&[b"GET", self.key.as_bytes()]).await? {
            Reply::Bulk(blob) => Ok(blob),
            Reply::Error(e) => Err(StoreError::Rejected(e)),
            other => Err(StoreError::Protocol(format!("expected bulk reply, got {other:?}"))),
        }
    }

    fn describe(&self) -> String {
        format!("resp://{}/{}", self.addr, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[test]
    fn test_encode_command() {
        let encoded = encode_command(&[b"SET", b"celery_metrics", b"a 1\n"]);
        assert_eq!(
            &encoded[..],
            b"*3\r\n$3\r\nSET\r\n$14\r\ncelery_metrics\r\n$4\r\na 1\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_execute_set() {
        let mock = Builder::new()
            .write(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n")
            .read(b"+OK\r\n")
            .build();
        let mut stream = BufStream::new(mock);

        let reply = execute(&mut stream, &[b"SET", b"k", b"v"]).await.unwrap();
        assert_eq!(reply, Reply::Simple("OK".to_string()));
    }

    #[tokio::test]
    async fn test_read_bulk_reply() {
        let mut reader = Builder::new().read(b"$5\r\nhello\r\n").build();
        let mut reader = tokio::io::BufReader::new(&mut reader);
        let reply = read_reply(&mut reader).await.unwrap();
        assert_eq!(reply, Reply::Bulk(Some(Bytes::from_static(b"hello"))));
    }

    #[tokio::test]
    async fn test_read_bulk_reply_split_across_reads() {
        let mut reader = Builder::new().read(b"$11\r\nhello").read(b" world\r\n").build();
        let mut reader = tokio::io::BufReader::new(&mut reader);
        let reply = read_reply(&mut reader).await.unwrap();
        assert_eq!(reply, Reply::Bulk(Some(Bytes::from_static(b"hello world"))));
    }

    #[tokio::test]
    async fn test_read_nil_bulk_reply() {
        let mut reader = Builder::new().read(b"$-1\r\n").build();
        let mut reader = tokio::io::BufReader::new(&mut reader);
        assert_eq!(read_reply(&mut reader).await.unwrap(), Reply::Bulk(None));
    }

    #[tokio::test]
    async fn test_read_error_and_integer_replies() {
        let mut reader = Builder::new().read(b"-ERR wrong type\r\n:42\r\n").build();
        let mut reader = tokio::io::BufReader::new(&mut reader);
        assert_eq!(
            read_reply(&mut reader).await.unwrap(),
            Reply::Error("ERR wrong type".to_string())
        );
        assert_eq!(read_reply(&mut reader).await.unwrap(), Reply::Integer(42));
    }

    #[tokio::test]
    async fn test_unterminated_reply_is_protocol_error() {
        let mut reader = Builder::new().read(b"+OK\n").build();
        let mut reader = tokio::io::BufReader::new(&mut reader);
        assert!(matches!(
            read_reply(&mut reader).await,
            Err(StoreError::Protocol(_))
        ));
    }

    #[test]
    fn test_expect_ok() {
        assert!(expect_ok(Reply::Simple("OK".to_string())).is_ok());
        assert!(matches!(
            expect_ok(Reply::Error("READONLY".to_string())),
            Err(StoreError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_cache_fails_put() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let store = RespStore::new(addr.to_string(), "k", None, Duration::from_millis(500));
        assert!(store.put(Bytes::from_static(b"x")).await.is_err());
    }
}
