//! A retrying, deadline-bounded JSON-RPC transport layer.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use alloy::providers::{ProviderBuilder, RootProvider};
use alloy::rpc::client::ClientBuilder;
use alloy::rpc::json_rpc::{RequestPacket, ResponsePacket};
use alloy::transports::{TransportError, TransportErrorKind};
use tower::{Layer, Service};

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);
/// Default backoff between retries.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(200);
/// Default retry budget per request.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Retry policy: every transport-level failure is retried with a constant
/// backoff until the budget is exhausted. JSON-RPC *error responses* are not
/// transport failures and pass through untouched.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    backoff: Duration,
    max_retries: u32,
}

impl RetryPolicy {
    pub const fn new(backoff: Duration, max_retries: u32) -> Self {
        Self {
            backoff,
            max_retries,
        }
    }
}

/// Tower layer installing [`RetryService`] on a transport.
pub struct RetryLayer {
    policy: RetryPolicy,
    timeout: Duration,
}

impl RetryLayer {
    pub const fn new(policy: RetryPolicy, timeout: Duration) -> Self {
        Self { policy, timeout }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            policy: self.policy.clone(),
            timeout: self.timeout,
        }
    }
}

/// A transport service that bounds each attempt with a deadline and retries
/// failed attempts per the configured policy.
#[derive(Clone, Debug)]
pub struct RetryService<S> {
    inner: S,
    policy: RetryPolicy,
    timeout: Duration,
}

impl<S> Service<RequestPacket> for RetryService<S>
where
    S: Service<RequestPacket, Response = ResponsePacket, Error = TransportError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = ResponsePacket;
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: RequestPacket) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let policy = self.policy.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let mut attempt = 0u32;
            loop {
                let result = match tokio::time::timeout(timeout, inner.call(req.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportErrorKind::custom_str(&format!(
                        "request timed out after {timeout:?}"
                    ))),
                };

                match result {
                    Ok(response) => return Ok(response),
                    Err(err) if attempt < policy.max_retries => {
                        attempt += 1;
                        tracing::debug!(%err, attempt, "rpc request failed, retrying");
                        tokio::time::sleep(policy.backoff).await;
                    }
                    Err(err) => return Err(err),
                }
            }
        })
    }
}

/// Builds an HTTP provider with retry and timeout policies installed.
pub fn build_retry_provider(
    rpc_url: url::Url,
    backoff: Duration,
    max_retries: u32,
    timeout: Duration,
) -> RootProvider<RetryService<alloy::transports::http::ReqwestTransport>> {
    let layer = RetryLayer::new(RetryPolicy::new(backoff, max_retries), timeout);
    let client = ClientBuilder::default().layer(layer).http(rpc_url);
    ProviderBuilder::new().on_client(client)
}
