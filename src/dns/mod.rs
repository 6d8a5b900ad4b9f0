//! Upstream DNS resolution.
//!
//! A client query passes through two steps before it leaves the gateway:
//!
//! 1. [ECS annotation][ecs::annotate]. Queries that don't already name a client subnet get one
//!    derived from the connecting client's address, masked to a `/24` for IPv4 and a `/48` for
//!    IPv6, so geo-aware upstreams can still pick a nearby answer.
//!
//! 2. [Racing][race::Racer]. The annotated query is `POST`ed to every configured DoH upstream
//!    at once. The gateway waits for all of them and returns the reply with the lowest
//!    round-trip latency.
//!
//! Answers are passed back untouched. Nothing here parses answer records or caches them.

pub mod ecs;
pub mod race;

use crate::error::Error;
use bytes::Bytes;
use race::Racer;
use std::net::IpAddr;
use std::sync::Arc;
use trust_dns_proto::op::Message;
use url::Url;

pub use race::{Answer, DynTransport, HttpTransport, Transport, DNS_MESSAGE};

/// One resolved exchange: the query as it was sent upstream and the winning answer.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub query: Bytes,
    pub answer: Bytes,
}

impl Resolution {
    /// Bytes moved on the client's behalf, the unit tickets are charged in.
    #[must_use]
    pub fn billable_bytes(&self) -> usize {
        self.query.len() + self.answer.len()
    }
}

#[derive(Clone)]
pub struct Resolver {
    upstreams: Arc<[Url]>,
    racer: Racer,
}

impl Resolver {
    #[must_use]
    pub fn new(upstreams: Vec<Url>, racer: Racer) -> Self {
        Resolver {
            upstreams: upstreams.into(),
            racer,
        }
    }

    /// Decode `raw`, annotate it with the client subnet for `client`, and race it across the
    /// upstreams.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedQuery`] if `raw` isn't a DNS message, [`Error::EncodeError`] if
    /// the annotated message can't be encoded, and the [`Racer::race`] errors otherwise.
    pub async fn resolve(&self, raw: &[u8], client: IpAddr) -> Result<Resolution, Error> {
        let query = Message::from_vec(raw).map_err(Error::MalformedQuery)?;
        let query = ecs::annotate(query, client)?;
        let query = Bytes::from(query.to_vec().map_err(Error::EncodeError)?);

        let answer = self.racer.race(&self.upstreams, query.clone()).await?;
        tracing::debug!(
            "{} won for {client} in {:?}",
            answer.upstream,
            answer.latency
        );
        Ok(Resolution {
            query,
            answer: answer.body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::race::tests::{FakeTransport, Script};
    use super::*;
    use std::str::FromStr;
    use std::time::Duration;
    use trust_dns_proto::op::{MessageType, OpCode, Query};
    use trust_dns_proto::rr::{Name, RecordType};

    fn resolver() -> Resolver {
        let transport = FakeTransport::default().with(
            "https://one.test/dns-query",
            Script::Answer {
                delay: Duration::from_millis(1),
                body: b"answer",
            },
        );
        Resolver::new(
            vec![Url::parse("https://one.test/dns-query").unwrap()],
            Racer::new(Arc::new(transport), Duration::from_secs(1)),
        )
    }

    fn raw_query() -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(7)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query);
        msg.add_query(Query::query(
            Name::from_str("example.org.").unwrap(),
            RecordType::AAAA,
        ));
        msg.to_vec().unwrap()
    }

    #[tokio::test]
    async fn resolves_and_reports_outgoing_query() {
        let raw = raw_query();
        let resolution = resolver()
            .resolve(&raw, "198.51.100.9".parse().unwrap())
            .await
            .unwrap();

        assert_eq!(resolution.answer, Bytes::from_static(b"answer"));
        let sent = Message::from_vec(&resolution.query).unwrap();
        assert_eq!(sent.id(), 7);
        assert!(ecs::has_client_subnet(&sent));
        assert!(resolution.query.len() > raw.len());
        assert_eq!(
            resolution.billable_bytes(),
            resolution.query.len() + b"answer".len()
        );
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let err = resolver()
            .resolve(&[0xde, 0xad], "198.51.100.9".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedQuery(_)));
    }
}
