//! HTTP transports.
//!
//! Requests go over TCP through `reqwest`, or over a local Unix domain
//! socket through a bare `hyper` HTTP/1 connection (one connection per
//! request). Both hand back the status and a byte stream so the framing
//! layer never knows which was used.

use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use meshtalk_core::error::ProviderError;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// A response body as a stream of byte chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

/// A response whose body has not been read yet.
pub struct Response {
    pub status: u16,
    pub body: ByteStream,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Read the whole body as text.
    pub async fn text(mut self) -> Result<String, ProviderError> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T, ProviderError> {
        let status = self.status;
        let text = self.text().await?;
        serde_json::from_str(&text).map_err(|e| ProviderError::ApiError {
            status_code: status,
            message: format!("Failed to parse response: {e}"),
        })
    }

    /// Map non-success statuses to the error taxonomy, consuming the body
    /// for the message.
    pub async fn error_for_status(self) -> Result<Self, ProviderError> {
        if self.is_success() {
            return Ok(self);
        }
        let status = self.status;
        let body = self.text().await.unwrap_or_default();
        warn!(status, body = %body, "Provider returned error");
        Err(status_error(status, body))
    }
}

/// The error for a non-success status.
pub fn status_error(status: u16, body: String) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited {
            retry_after_secs: 5,
        },
        401 | 403 => ProviderError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        ),
        404 if body.contains("model") => ProviderError::ModelNotFound(body),
        _ => ProviderError::ApiError {
            status_code: status,
            message: body,
        },
    }
}

/// How requests reach the back-end.
#[derive(Clone)]
pub enum Transport {
    Http(reqwest::Client),
    Unix { socket: PathBuf },
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http(_) => f.write_str("Transport::Http"),
            Self::Unix { socket } => write!(f, "Transport::Unix({})", socket.display()),
        }
    }
}

impl Transport {
    /// A TCP transport. Streaming responses can be long, so only the
    /// connect phase is bounded.
    pub fn http() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self::Http(client)
    }

    pub fn unix(socket: impl Into<PathBuf>) -> Self {
        Self::Unix {
            socket: socket.into(),
        }
    }

    pub async fn get(&self, url: &str, headers: &[(&str, String)]) -> Result<Response, ProviderError> {
        self.send("GET", url, headers, None).await
    }

    pub async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: &serde_json::Value,
    ) -> Result<Response, ProviderError> {
        let bytes = serde_json::to_vec(body).map_err(|e| ProviderError::ApiError {
            status_code: 0,
            message: format!("Failed to encode request: {e}"),
        })?;
        self.send("POST", url, headers, Some(Bytes::from(bytes))).await
    }

    async fn send(
        &self,
        method: &str,
        url: &str,
        headers: &[(&str, String)],
        body: Option<Bytes>,
    ) -> Result<Response, ProviderError> {
        debug!(method, url, transport = ?self, "Sending request");
        match self {
            Self::Http(client) => send_http(client, method, url, headers, body).await,
            Self::Unix { socket } => send_unix(socket, method, url, headers, body).await,
        }
    }
}

async fn send_http(
    client: &reqwest::Client,
    method: &str,
    url: &str,
    headers: &[(&str, String)],
    body: Option<Bytes>,
) -> Result<Response, ProviderError> {
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|e| ProviderError::Network(e.to_string()))?;
    let mut request = client.request(method, url);
    for (name, value) in headers {
        request = request.header(*name, value);
    }
    if let Some(body) = body {
        request = request.header("Content-Type", "application/json").body(body);
    }

    let response = request
        .send()
        .await
        .map_err(|e| ProviderError::Network(e.to_string()))?;
    let status = response.status().as_u16();
    let body = response
        .bytes_stream()
        .map(|r| r.map_err(|e| ProviderError::StreamInterrupted(e.to_string())));
    Ok(Response {
        status,
        body: Box::pin(body),
    })
}

#[cfg(unix)]
async fn send_unix(
    socket: &std::path::Path,
    method: &str,
    url: &str,
    headers: &[(&str, String)],
    body: Option<Bytes>,
) -> Result<Response, ProviderError> {
    use http_body_util::{BodyStream, Full};
    use hyper_util::rt::TokioIo;

    let uri: hyper::Uri = url
        .parse()
        .map_err(|e| ProviderError::NotConfigured(format!("invalid URL '{url}': {e}")))?;
    let path = uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".into());
    let host = uri.host().unwrap_or("localhost").to_string();

    let stream = tokio::net::UnixStream::connect(socket).await.map_err(|e| {
        ProviderError::Network(format!("connect {}: {e}", socket.display()))
    })?;
    let (mut sender, connection) =
        hyper::client::conn::http1::handshake::<_, Full<Bytes>>(TokioIo::new(stream))
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "Unix socket connection closed with error");
        }
    });

    let mut builder = hyper::Request::builder()
        .method(method)
        .uri(path)
        .header(hyper::header::HOST, host);
    for (name, value) in headers {
        builder = builder.header(*name, value.as_str());
    }
    if body.is_some() {
        builder = builder.header(hyper::header::CONTENT_TYPE, "application/json");
    }
    let request = builder
        .body(Full::new(body.unwrap_or_default()))
        .map_err(|e| ProviderError::Network(e.to_string()))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| ProviderError::Network(e.to_string()))?;
    let status = response.status().as_u16();
    let body = BodyStream::new(response.into_body()).filter_map(|frame| async move {
        match frame {
            Ok(frame) => frame.into_data().ok().map(Ok),
            Err(e) => Some(Err(ProviderError::StreamInterrupted(e.to_string()))),
        }
    });
    Ok(Response {
        status,
        body: Box::pin(body),
    })
}

#[cfg(not(unix))]
async fn send_unix(
    socket: &std::path::Path,
    _method: &str,
    _url: &str,
    _headers: &[(&str, String)],
    _body: Option<Bytes>,
) -> Result<Response, ProviderError> {
    Err(ProviderError::NotConfigured(format!(
        "Unix domain sockets are not supported on this platform ({})",
        socket.display()
    )))
}
