//! Request executor - performs the upstream HTTP call for one request.
//!
//! Unary requests (`get`/`post`) end with exactly one `Response` or `Error`
//! frame. Stream requests emit one `StreamData` per upstream line followed
//! by `StreamClosed`, or `Error` if the stream fails. A cancelled request
//! emits nothing further.
//!
//! Every suspension point (the call, the stream open, each line read) races
//! the request's cancellation token; the losing future is dropped, which
//! releases the upstream connection.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ble_http_bridge::executor::{AuthPolicy, ReqwestClient, RequestExecutor};
//!
//! let executor = RequestExecutor::new(Arc::new(ReqwestClient::new()), AuthPolicy::none());
//! executor.run(RequestMethod::Get, url, None, &ctx).await?;
//! ```

mod auth;
mod http;

use std::sync::Arc;

use futures::StreamExt;
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::handler::RequestContext;
use crate::protocol::RequestMethod;

pub use auth::{AuthPolicy, StaticTokenStore, TokenStore};
pub use http::{
    HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, LineStream, ReqwestClient,
};

/// Runs board requests against the upstream client.
#[derive(Clone)]
pub struct RequestExecutor {
    client: Arc<dyn HttpClient>,
    auth: AuthPolicy,
}

impl RequestExecutor {
    /// Create an executor.
    pub fn new(client: Arc<dyn HttpClient>, auth: AuthPolicy) -> Self {
        Self { client, auth }
    }

    /// Serve one request, emitting its frames through `ctx`.
    ///
    /// Returns `Err(Cancelled)` if the request was cancelled, or the write
    /// error if a frame could not be sent. Upstream failures are not errors
    /// here; they are reported to the board as `Error` frames.
    pub async fn run(
        &self,
        method: RequestMethod,
        url: String,
        body: Option<String>,
        ctx: &RequestContext,
    ) -> Result<()> {
        match method {
            RequestMethod::Get => self.unary(HttpRequest::get(url), ctx).await,
            RequestMethod::Post => self.unary(HttpRequest::post(url, body), ctx).await,
            RequestMethod::Stream => self.stream(HttpRequest::get(url), ctx).await,
        }
    }

    async fn unary(&self, request: HttpRequest, ctx: &RequestContext) -> Result<()> {
        let request = self.auth.authorize(request);
        debug!(
            "Request {}: {} {}",
            ctx.request_id(),
            request.method,
            request.url
        );

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(BridgeError::Cancelled),
            r = self.client.execute(request) => r,
        };

        match outcome {
            Ok(response) if response.is_success() => ctx.respond(response.body).await,
            Ok(response) => {
                let err = HttpError::Status {
                    status: response.status,
                    body: response.body,
                };
                ctx.error(err.to_string()).await
            }
            Err(e) => ctx.error(e.to_string()).await,
        }
    }

    async fn stream(&self, request: HttpRequest, ctx: &RequestContext) -> Result<()> {
        let request = self.auth.authorize(request);
        debug!("Request {}: STREAM {}", ctx.request_id(), request.url);

        let opened = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(BridgeError::Cancelled),
            r = self.client.open_line_stream(request) => r,
        };

        let mut lines = match opened {
            Ok(lines) => lines,
            Err(e) => return ctx.error(e.to_string()).await,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(BridgeError::Cancelled),
                next = lines.next() => next,
            };

            match next {
                Some(Ok(line)) => ctx.chunk(format!("{line}\n")).await?,
                Some(Err(e)) => return ctx.error(e.to_string()).await,
                None => {
                    debug!("Stream {} closed by upstream", ctx.request_id());
                    return ctx.end().await;
                }
            }
        }
    }
}
