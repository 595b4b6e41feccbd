//! Upstream HTTP client seam.
//!
//! [`HttpClient`] is what the executor calls; [`ReqwestClient`] is the
//! production implementation. Tests and simulations plug in their own.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::BytesMut;
use futures::{Stream, StreamExt};
use thiserror::Error;

/// Upstream failure.
///
/// The `Display` text becomes the `message` of the `Error` frame sent to
/// the board.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    /// Non-2xx status.
    #[error("HTTP {status}: {body}")]
    Status {
        /// Status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },

    /// Connection, TLS, timeout, or body read failure.
    #[error("{0}")]
    Transport(String),

    /// The URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for HttpError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            Self::InvalidUrl(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// HTTP method of an upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST with a JSON body
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => f.write_str("GET"),
            Self::Post => f.write_str("POST"),
        }
    }
}

/// One upstream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    /// JSON body (POST only).
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    /// A GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            body: None,
            headers: Vec::new(),
        }
    }

    /// A POST request with a JSON body.
    pub fn post(url: impl Into<String>, body: Option<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            body,
            headers: Vec::new(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Look up a header value (case-insensitive name).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Status and body of a completed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    /// Whether the status is 2xx.
    #[inline]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Lines of a streaming response, without their terminators.
///
/// Dropping the stream releases the upstream connection.
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, HttpError>> + Send>>;

/// Upstream HTTP capability.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Perform a call and return its status and body, whatever the status.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;

    /// Open a streaming GET and return its body line by line.
    ///
    /// A non-2xx status is reported as [`HttpError::Status`] before any line.
    async fn open_line_stream(&self, request: HttpRequest) -> Result<LineStream, HttpError>;
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
    timeout: Option<Duration>,
}

impl ReqwestClient {
    /// Create a client with default settings and no timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing `reqwest` client.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self {
            client,
            timeout: None,
        }
    }

    /// Time limit for unary calls, and per body read for streams.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn build(&self, request: HttpRequest) -> reqwest::RequestBuilder {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body.filter(|_| request.method == HttpMethod::Post) {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }
        builder
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut builder = self.build(request);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }

    async fn open_line_stream(&self, request: HttpRequest) -> Result<LineStream, HttpError> {
        let response = self.build(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HttpError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut bytes_stream = response.bytes_stream();
        let timeout = self.timeout;

        let stream = try_stream! {
            let mut buffer = BytesMut::new();

            loop {
                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line = buffer.split_to(pos + 1);
                    yield decode_line(&line[..pos]);
                }

                let next = match timeout {
                    Some(limit) => tokio::time::timeout(limit, bytes_stream.next())
                        .await
                        .map_err(|_| HttpError::Transport("stream read timed out".into()))?,
                    None => bytes_stream.next().await,
                };

                let Some(chunk) = next else { break };
                buffer.extend_from_slice(&chunk.map_err(HttpError::from)?);
            }

            // Unterminated last line
            if !buffer.is_empty() {
                yield decode_line(&buffer);
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Decode one line without its `\n`, dropping a trailing `\r`.
fn decode_line(line: &[u8]) -> String {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}
