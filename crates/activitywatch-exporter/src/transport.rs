// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP transport with transparent retries.
//!
//! Every request issued by the exporter goes through an [`HttpTransport`]. The
//! [`RetryingTransport`] wrapper re-issues the same request when the underlying
//! transport fails at the connection level or answers with a transient 5xx
//! status, sleeping with exponential backoff between attempts.

use async_trait::async_trait;
use bytes::Bytes;
use core::time::Duration;
use reqwest::header::HeaderMap;
use reqwest::{Method, Request, Response, StatusCode, Url};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Number of additional attempts made after the first one.
pub const RETRY_COUNT: u32 = 3;

/// Timeout applied to connection establishment and to the whole request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0}")]
    Request(#[from] reqwest::Error),
    /// The request body is a stream and can't be buffered for replay.
    #[error("request body can't be buffered for replay")]
    UnreplayableBody,
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response, TransportError>;
}

#[async_trait]
impl HttpTransport for reqwest::Client {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        Ok(self.execute(request).await?)
    }
}

#[async_trait]
impl<T: HttpTransport + ?Sized> HttpTransport for Arc<T> {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        (**self).send(request).await
    }
}

/// Builds the HTTP client shared by every call the exporter makes.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .use_rustls_tls()
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay before the first retry; doubled for every following one.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: RETRY_COUNT,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry - 1)`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }
}

/// Returns true for outcomes worth re-issuing: transport failures and the
/// 500, 502, 503 and 504 statuses.
pub fn should_retry(result: &Result<Response, TransportError>) -> bool {
    match result {
        Err(_) => true,
        Ok(response) => matches!(
            response.status(),
            StatusCode::INTERNAL_SERVER_ERROR
                | StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT
        ),
    }
}

/// Everything needed to rebuild a request, with the body fully buffered.
struct RequestSnapshot {
    method: Method,
    url: Url,
    headers: HeaderMap,
    timeout: Option<Duration>,
    body: Option<Bytes>,
}

impl RequestSnapshot {
    fn capture(request: Request) -> Result<Self, TransportError> {
        let body = match request.body() {
            None => None,
            Some(body) => Some(
                body.as_bytes()
                    .map(Bytes::copy_from_slice)
                    .ok_or(TransportError::UnreplayableBody)?,
            ),
        };
        Ok(Self {
            method: request.method().clone(),
            url: request.url().clone(),
            headers: request.headers().clone(),
            timeout: request.timeout().copied(),
            body,
        })
    }

    fn rebuild(&self) -> Request {
        let mut request = Request::new(self.method.clone(), self.url.clone());
        *request.headers_mut() = self.headers.clone();
        *request.timeout_mut() = self.timeout;
        // Bytes clones share the buffer, each attempt gets an unconsumed body.
        *request.body_mut() = self.body.clone().map(reqwest::Body::from);
        request
    }
}

/// Wraps a transport and retries transient failures with exponential backoff.
///
/// After the retry budget is spent the last response or error is returned to
/// the caller untouched.
pub struct RetryingTransport<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T: HttpTransport> RetryingTransport<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<T: HttpTransport> HttpTransport for RetryingTransport<T> {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let snapshot = RequestSnapshot::capture(request)?;

        let mut result = self.inner.send(snapshot.rebuild()).await;
        let mut retries = 0;
        while retries < self.policy.max_retries && should_retry(&result) {
            retries += 1;
            tokio::time::sleep(self.policy.backoff(retries)).await;

            match &result {
                Ok(response) => warn!("Previous request failed with {}", response.status()),
                Err(e) => debug!("Previous request failed: {e}"),
            }
            info!("Retry {retries} of request to: {}", snapshot.url);

            // Dropping the previous response releases its connection.
            result = self.inner.send(snapshot.rebuild()).await;
        }
        result
    }
}
