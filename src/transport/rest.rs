//! REST over HTTPS (LND's REST proxy and Core Lightning's `clnrest`)

use super::{rpc_error, Connector, EventStream, RpcMethod, RpcTransport, TransportError, Verb};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Credential attached to every request
#[derive(Clone)]
pub enum RestAuth {
    /// LND macaroon, hex encoded
    Macaroon(String),
    /// Core Lightning rune
    Rune(String),
    /// No credential
    None,
}

impl std::fmt::Debug for RestAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log credential material.
        match self {
            RestAuth::Macaroon(_) => write!(f, "Macaroon(..)"),
            RestAuth::Rune(_) => write!(f, "Rune(..)"),
            RestAuth::None => write!(f, "None"),
        }
    }
}

/// Builds a fresh [`RestTransport`] (own connection pool) per `connect`
pub struct RestConnector {
    base_url: String,
    auth: RestAuth,
    tls_cert_pem: Option<Vec<u8>>,
    timeout: Duration,
}

impl RestConnector {
    /// Connector for `base_url` (e.g. `https://127.0.0.1:8080`)
    pub fn new(
        base_url: impl Into<String>,
        auth: RestAuth,
        tls_cert_pem: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            tls_cert_pem,
            timeout,
        }
    }
}

#[async_trait]
impl Connector for RestConnector {
    async fn connect(&self) -> Result<Arc<dyn RpcTransport>, TransportError> {
        let mut builder = reqwest::Client::builder().connect_timeout(self.timeout);

        if let Some(pem) = &self.tls_cert_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| TransportError::Connect(format!("Invalid TLS certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::Connect(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Arc::new(RestTransport {
            client,
            base_url: self.base_url.clone(),
            auth: self.auth.clone(),
            timeout: self.timeout,
            closed: AtomicBool::new(false),
        }))
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}

/// One REST handle
pub struct RestTransport {
    client: reqwest::Client,
    base_url: String,
    auth: RestAuth,
    timeout: Duration,
    closed: AtomicBool,
}

impl RestTransport {
    fn request(&self, method: &RpcMethod, params: Value) -> reqwest::RequestBuilder {
        let path = match (&self.auth, method.verb) {
            // clnrest exposes every JSON-RPC method as POST /v1/<method>
            (RestAuth::Rune(_), Verb::Post) if !method.name.contains('/') => {
                format!("v1/{}", method.name)
            }
            _ => method.name.trim_start_matches('/').to_string(),
        };
        let url = format!("{}/{}", self.base_url, path);

        let builder = match method.verb {
            Verb::Get => self.client.get(&url).query(&query_pairs(&params)),
            Verb::Delete => self.client.delete(&url).query(&query_pairs(&params)),
            Verb::Post => {
                let body = if params.is_null() { serde_json::json!({}) } else { params };
                self.client.post(&url).json(&body)
            }
        };

        match &self.auth {
            RestAuth::Macaroon(hex) => builder.header("Grpc-Metadata-macaroon", hex),
            RestAuth::Rune(rune) => builder.header("Rune", rune),
            RestAuth::None => builder,
        }
    }

    async fn send(
        &self,
        method: &RpcMethod,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        debug!("REST call {}", method);

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(self.timeout)
            } else {
                TransportError::Connect(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        Err(error_from_body(status.as_u16(), &text))
    }
}

/// Turn a non-2xx body into a [`TransportError::Rpc`]
fn error_from_body(status: u16, text: &str) -> TransportError {
    match serde_json::from_str::<Value>(text) {
        Ok(body) if body.get("message").is_some() => rpc_error(&body),
        Ok(body) if body.get("error").is_some() => rpc_error(&body["error"]),
        _ => TransportError::Rpc {
            code: status as i64,
            message: if text.is_empty() {
                format!("HTTP {}", status)
            } else {
                text.to_string()
            },
        },
    }
}

/// Flatten a JSON object into query pairs
fn query_pairs(params: &Value) -> Vec<(String, String)> {
    let Some(map) = params.as_object() else {
        return Vec::new();
    };
    map.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), v)
        })
        .collect()
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(line.len());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &line[start..end]
}

/// Decode one line of a newline-delimited push stream. LND wraps each
/// message in `{"result": ...}` or `{"error": ...}`.
fn decode_push_line(line: &[u8]) -> Result<Value, TransportError> {
    let value: Value =
        serde_json::from_slice(line).map_err(|e| TransportError::Decode(e.to_string()))?;
    if let Some(error) = value.get("error") {
        if !error.is_null() {
            return Err(rpc_error(error));
        }
    }
    match value.get("result") {
        Some(result) => Ok(result.clone()),
        None => Ok(value),
    }
}

#[async_trait]
impl RpcTransport for RestTransport {
    async fn call(&self, method: &RpcMethod, params: Value) -> Result<Value, TransportError> {
        let mut builder = self.request(method, params);
        if !method.long_poll {
            builder = builder.timeout(self.timeout);
        }

        let response = self.send(method, builder).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn subscribe(&self, method: &RpcMethod, params: Value) -> Result<EventStream, TransportError> {
        let builder = self.request(method, params);
        let response = self.send(method, builder).await?;

        let bytes = Box::pin(response.bytes_stream());
        let stream = futures::stream::unfold(
            (bytes, Vec::<u8>::new(), false),
            |(mut bytes, mut buf, done)| async move {
                if done {
                    return None;
                }
                loop {
                    if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = buf.drain(..=pos).collect();
                        let line = trim_line(&line);
                        if line.is_empty() {
                            continue;
                        }
                        let item = decode_push_line(line);
                        return Some((item, (bytes, buf, false)));
                    }

                    match bytes.next().await {
                        Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                        Some(Err(e)) => {
                            warn!("Push stream interrupted: {}", e);
                            let err = TransportError::Connect(e.to_string());
                            return Some((Err(err), (bytes, buf, true)));
                        }
                        None => {
                            let rest = trim_line(&buf).to_vec();
                            if rest.is_empty() {
                                return None;
                            }
                            return Some((decode_push_line(&rest), (bytes, Vec::new(), true)));
                        }
                    }
                }
            },
        );

        Ok(stream.boxed())
    }

    async fn close(&self) {
        // Dropping the client tears down its pool; the flag stops late callers
        // from silently reopening connections through this handle.
        self.closed.store(true, Ordering::Release);
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_pairs() {
        let pairs = query_pairs(&json!({
            "reversed": true,
            "index_offset": 5,
            "pending_only": null,
            "settle_index": "7",
        }));
        assert!(pairs.contains(&("reversed".to_string(), "true".to_string())));
        assert!(pairs.contains(&("index_offset".to_string(), "5".to_string())));
        assert!(pairs.contains(&("settle_index".to_string(), "7".to_string())));
        assert_eq!(pairs.len(), 3);
        assert!(query_pairs(&Value::Null).is_empty());
    }

    #[test]
    fn test_error_from_lnd_body() {
        let err = error_from_body(
            500,
            r#"{"code":2,"message":"wallet locked, unlock it to enable full RPC access","details":[]}"#,
        );
        assert_eq!(
            err,
            TransportError::Rpc {
                code: 2,
                message: "wallet locked, unlock it to enable full RPC access".to_string()
            }
        );
    }

    #[test]
    fn test_error_from_plain_body() {
        let err = error_from_body(404, "Not Found");
        assert_eq!(
            err,
            TransportError::Rpc {
                code: 404,
                message: "Not Found".to_string()
            }
        );
        assert!(matches!(error_from_body(502, ""), TransportError::Rpc { code: 502, .. }));
    }

    #[test]
    fn test_decode_push_line() {
        let value = decode_push_line(br#"{"result":{"add_index":"3"}}"#).unwrap();
        assert_eq!(value["add_index"], "3");

        let err = decode_push_line(br#"{"error":{"code":14,"message":"EOF"}}"#).unwrap_err();
        assert!(matches!(err, TransportError::Rpc { code: 14, .. }));
    }

    #[test]
    fn test_auth_debug_hides_secret() {
        let auth = RestAuth::Macaroon("0201036c6e64".to_string());
        assert_eq!(format!("{:?}", auth), "Macaroon(..)");
    }
}
