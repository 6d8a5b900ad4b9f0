//! Fan-out of a DNS query to every configured DoH upstream.

use crate::error::Error;
use bytes::{Bytes, BytesMut};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use url::Url;

/// Media type of a wire format DNS message ([RFC-8484] section 6).
///
/// [RFC-8484]: https://www.rfc-editor.org/rfc/rfc8484#section-6
pub const DNS_MESSAGE: &str = "application/dns-message";

/// Largest possible DNS message.
pub const MAX_MESSAGE_LEN: usize = 65535;

/// Failure of a single upstream attempt. Never surfaced to clients; a failed attempt only drops
/// out of the race.
#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("upstream returned HTTP {0}")]
    Status(u16),
    #[error("upstream timed out")]
    Timeout,
    #[error("upstream reply exceeds 65535 bytes")]
    TooLarge,
}

/// Sends one raw DNS message to one upstream and returns the raw reply.
#[async_trait::async_trait]
pub trait Transport {
    async fn exchange(&self, upstream: &Url, query: Bytes) -> Result<Bytes, UpstreamError>;
}

pub type DynTransport = Arc<dyn Transport + Send + Sync>;

/// A [`Transport`] that `POST`s queries to DoH endpoints.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn exchange(&self, upstream: &Url, query: Bytes) -> Result<Bytes, UpstreamError> {
        let mut resp = self
            .client
            .post(upstream.clone())
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .header(ACCEPT, DNS_MESSAGE)
            .body(query)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(UpstreamError::Status(resp.status().as_u16()));
        }
        if resp
            .content_length()
            .is_some_and(|len| len > MAX_MESSAGE_LEN as u64)
        {
            return Err(UpstreamError::TooLarge);
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = resp.chunk().await? {
            if body.len() + chunk.len() > MAX_MESSAGE_LEN {
                return Err(UpstreamError::TooLarge);
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}

/// The winning upstream reply.
#[derive(Debug, Clone)]
pub struct Answer {
    pub upstream: Url,
    pub body: Bytes,
    pub latency: Duration,
}

/// Races a query across upstreams, waiting for all of them, and keeps the fastest reply.
#[derive(Clone)]
pub struct Racer {
    transport: DynTransport,
    timeout: Duration,
}

impl Racer {
    #[must_use]
    pub fn new(transport: DynTransport, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Send `query` to every upstream concurrently and return the reply with the lowest
    /// round-trip latency. Equal latencies go to whichever attempt finished first.
    ///
    /// Every attempt runs to completion (or to the per-attempt timeout) before a winner is
    /// picked. Failed attempts are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoUpstream`] if `upstreams` is empty and [`Error::NoAnswer`] if every
    /// attempt failed.
    pub async fn race(&self, upstreams: &[Url], query: Bytes) -> Result<Answer, Error> {
        if upstreams.is_empty() {
            return Err(Error::NoUpstream);
        }

        let mut attempts = JoinSet::new();
        for upstream in upstreams {
            let transport = self.transport.clone();
            let upstream = upstream.clone();
            let query = query.clone();
            let timeout = self.timeout;
            attempts.spawn(async move {
                let start = Instant::now();
                let result = match tokio::time::timeout(
                    timeout,
                    transport.exchange(&upstream, query),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(UpstreamError::Timeout),
                };
                (upstream, result, start.elapsed())
            });
        }

        // Collected in completion order, which is what breaks latency ties.
        let mut answers = Vec::with_capacity(upstreams.len());
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((upstream, Ok(body), latency)) => {
                    tracing::debug!("{upstream} answered in {latency:?}");
                    answers.push(Answer {
                        upstream,
                        body,
                        latency,
                    });
                }
                Ok((upstream, Err(err), _)) => {
                    tracing::debug!("{upstream} failed: {err}");
                }
                Err(err) => {
                    tracing::error!("upstream attempt panicked: {err}");
                }
            }
        }

        answers
            .into_iter()
            .min_by_key(|answer| answer.latency)
            .ok_or(Error::NoAnswer)
    }
}
