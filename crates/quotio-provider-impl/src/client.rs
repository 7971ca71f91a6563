use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wreq::{Client, Method, Proxy};

use quotio_provider_core::{ChunkStream, ExecuteError};

const MAX_ERROR_BODY_CHARS: usize = 2_048;

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(86_400),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Shared outbound HTTP client. Non-2xx responses become `ExecuteError`
/// values carrying the upstream status and headers (including `retry-after`),
/// which is everything the pool's cooldown table needs.
pub struct UpstreamClient {
    client: Client,
    config: UpstreamClientConfig,
}

impl UpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, ExecuteError> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .read_timeout(config.stream_idle_timeout);
        if let Some(proxy) = config.proxy.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            builder = builder.proxy(Proxy::all(proxy).map_err(map_transport)?);
        }
        let client = builder.build().map_err(map_transport)?;
        Ok(Self { client, config })
    }

    pub async fn send(
        &self,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Option<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<UpstreamResponse, ExecuteError> {
        let builder = self.request(method, url, headers, body)?;
        let call = async {
            let resp = builder.send().await.map_err(map_transport)?;
            let status = resp.status().as_u16();
            let resp_headers = collect_headers(resp.headers());
            let body = resp.bytes().await.map_err(map_transport)?;
            if !(200..300).contains(&status) {
                return Err(ExecuteError::status_error(
                    status,
                    error_message(&body),
                    resp_headers,
                ));
            }
            Ok(UpstreamResponse {
                status,
                headers: resp_headers,
                body,
            })
        };
        tokio::select! {
            biased;
            result = call => result,
            _ = cancel.cancelled() => Err(ExecuteError::cancelled()),
        }
    }

    /// Open a streaming request. The returned channel yields body chunks;
    /// transport failures and idle timeouts arrive as error chunks, and the
    /// reader task drops the connection on every exit path.
    pub async fn send_stream(
        &self,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Option<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, ExecuteError> {
        let builder = self.request(method, url, headers, body)?;
        let resp = tokio::select! {
            biased;
            result = builder.send() => result.map_err(map_transport)?,
            _ = cancel.cancelled() => return Err(ExecuteError::cancelled()),
        };
        let status = resp.status().as_u16();
        let resp_headers = collect_headers(resp.headers());
        if !(200..300).contains(&status) {
            let body = resp.bytes().await.map_err(map_transport)?;
            return Err(ExecuteError::status_error(
                status,
                error_message(&body),
                resp_headers,
            ));
        }

        let (tx, rx) = mpsc::channel(16);
        let idle = self.config.stream_idle_timeout;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            loop {
                let next = tokio::select! {
                    biased;
                    item = tokio::time::timeout(idle, stream.next()) => item,
                    _ = cancel.cancelled() => return,
                };
                let item = match next {
                    Ok(item) => item,
                    Err(_) => {
                        let _ = tx
                            .send(Err(ExecuteError::transport("upstream stream idle timeout")))
                            .await;
                        return;
                    }
                };
                let Some(item) = item else {
                    // Clean upstream end; closing the channel is the signal.
                    return;
                };
                match item {
                    Ok(chunk) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(map_transport(err))).await;
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    fn request(
        &self,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Option<Bytes>,
    ) -> Result<wreq::RequestBuilder, ExecuteError> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ExecuteError::transport(format!("invalid method {method}")))?;
        let mut builder = self.client.request(method, url);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }
        Ok(builder)
    }
}

fn collect_headers(map: &wreq::header::HeaderMap) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, value) in map {
        if let Ok(value) = value.to_str() {
            out.push((name.as_str().to_ascii_lowercase(), value.to_string()));
        }
    }
    out
}

fn error_message(body: &Bytes) -> String {
    let text = String::from_utf8_lossy(body);
    let mut message: String = text.chars().take(MAX_ERROR_BODY_CHARS).collect();
    if message.is_empty() {
        message = "upstream error with empty body".to_string();
    }
    message
}

fn map_transport(err: wreq::Error) -> ExecuteError {
    ExecuteError::transport(format!("{}: {err}", classify(&err)))
}

fn classify(err: &wreq::Error) -> &'static str {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        if message.contains("read") || message.contains("idle") {
            return "read_timeout";
        }
        return "timeout";
    }
    if err.is_connect() {
        if message.contains("dns") || message.contains("resolve") {
            return "dns";
        }
        if message.contains("tls") || message.contains("ssl") {
            return "tls";
        }
        return "connect";
    }
    if err.is_connection_reset() {
        return "reset";
    }
    if message.contains("tls") || message.contains("ssl") {
        return "tls";
    }
    "transport"
}
