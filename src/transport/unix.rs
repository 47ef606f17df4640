//! JSON-RPC 2.0 over a unix domain socket (Core Lightning's `lightning-rpc`)

use super::{unwrap_jsonrpc, Connector, RpcMethod, RpcTransport, TransportError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, trace};

const READ_CHUNK: usize = 64 * 1024;

/// Opens [`UnixRpcTransport`] handles after checking the socket accepts
/// connections
pub struct UnixConnector {
    path: PathBuf,
    timeout: Duration,
}

impl UnixConnector {
    /// Connector for the socket at `path`
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self { path, timeout }
    }
}

#[async_trait]
impl Connector for UnixConnector {
    async fn connect(&self) -> Result<Arc<dyn RpcTransport>, TransportError> {
        // A socket file can exist while nobody listens on it, so connect once.
        UnixStream::connect(&self.path).await.map_err(|e| {
            TransportError::Connect(format!("{}: {}", self.path.display(), e))
        })?;

        Ok(Arc::new(UnixRpcTransport::new(self.path.clone(), self.timeout)))
    }

    fn describe(&self) -> String {
        format!("unix:{}", self.path.display())
    }
}

/// JSON-RPC client over a unix socket. Each call uses its own connection so
/// a long poll never blocks other calls.
pub struct UnixRpcTransport {
    path: PathBuf,
    timeout: Duration,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl UnixRpcTransport {
    /// Client for the socket at `path`
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self {
            path,
            timeout,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    async fn roundtrip(&self, request: Vec<u8>) -> Result<Value, TransportError> {
        let mut stream = UnixStream::connect(&self.path)
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {}", self.path.display(), e)))?;

        stream
            .write_all(&request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let mut buf = Vec::with_capacity(READ_CHUNK);
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            if n == 0 {
                return Err(TransportError::Connect(
                    "socket closed before a full response was read".to_string(),
                ));
            }
            buf.extend_from_slice(&chunk[..n]);

            match parse_complete(&buf)? {
                Some(value) => return Ok(value),
                None => trace!("Partial response, {} bytes so far", buf.len()),
            }
        }
    }
}

/// Parse one JSON document from `buf`, or `None` if more bytes are needed
fn parse_complete(buf: &[u8]) -> Result<Option<Value>, TransportError> {
    let mut iter = serde_json::Deserializer::from_slice(buf).into_iter::<Value>();
    match iter.next() {
        Some(Ok(value)) => Ok(Some(value)),
        Some(Err(e)) if e.is_eof() => Ok(None),
        Some(Err(e)) => Err(TransportError::Decode(e.to_string())),
        None => Ok(None),
    }
}

#[async_trait]
impl RpcTransport for UnixRpcTransport {
    async fn call(&self, method: &RpcMethod, params: Value) -> Result<Value, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let params = if params.is_null() { json!({}) } else { params };
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method.name,
            "params": params,
        });
        let request = serde_json::to_vec(&request)
            .map_err(|e| TransportError::Decode(e.to_string()))?;

        debug!("JSON-RPC call {} (id={})", method.name, id);

        let response = if method.long_poll {
            self.roundtrip(request).await?
        } else {
            tokio::time::timeout(self.timeout, self.roundtrip(request))
                .await
                .map_err(|_| TransportError::Timeout(self.timeout))??
        };

        unwrap_jsonrpc(response)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn describe(&self) -> String {
        format!("unix:{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[test]
    fn test_parse_complete_waits_for_more() {
        assert_eq!(parse_complete(br#"{"result": {"a""#).unwrap(), None);
        let value = parse_complete(br#"{"result": {"a": 1}}

"#)
        .unwrap()
        .unwrap();
        assert_eq!(value["result"]["a"], 1);
    }

    #[test]
    fn test_parse_complete_rejects_garbage() {
        assert!(parse_complete(b"]]").is_err());
    }

    #[tokio::test]
    async fn test_call_roundtrip_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lightning-rpc");
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let n = stream.read(&mut buf).await.unwrap();
                // The connector's liveness check connects and hangs up.
                if n == 0 {
                    continue;
                }
                let request: Value = serde_json::from_slice(&buf[..n]).unwrap();
                let response = json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "result": {"method": request["method"]},
                });
                let bytes = serde_json::to_vec(&response).unwrap();
                // Split the write to exercise partial reads.
                let (head, tail) = bytes.split_at(bytes.len() / 2);
                stream.write_all(head).await.unwrap();
                stream.flush().await.unwrap();
                stream.write_all(tail).await.unwrap();
                stream.write_all(b"\n\n").await.unwrap();
            }
        });

        let connector = UnixConnector::new(path, Duration::from_secs(5));
        let transport = connector.connect().await.unwrap();
        let result = transport
            .call(&RpcMethod::named("getinfo"), Value::Null)
            .await
            .unwrap();
        assert_eq!(result["method"], "getinfo");

        transport.close().await;
        let err = transport
            .call(&RpcMethod::named("getinfo"), Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Closed);
    }

    #[tokio::test]
    async fn test_connect_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let connector = UnixConnector::new(dir.path().join("nope"), Duration::from_secs(1));
        let err = connector.connect().await.err().unwrap();
        assert!(matches!(err, TransportError::Connect(_)));
    }
}
