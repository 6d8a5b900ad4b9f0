//! Error types.

use crate::ledger::LedgerError;
use crate::payment::PaymentError;
use axum::extract::rejection::JsonRejection;
use trust_dns_proto::error::ProtoError;
use url::Url;

/// Error enumerates the possible dohtoll error states.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Returned when a top-up or payment confirmation arrives but no
    /// [`PaymentProvider`][crate::payment::PaymentProvider] is configured.
    #[error("not implemented")]
    NotImplemented,

    /// Returned for an unknown token, an exhausted balance, or a charge that failed after the
    /// query was resolved. The message is the same for all three.
    #[error("invalid token")]
    Unauthorized,

    /// Returned when the client's DNS message can't be decoded.
    #[error("malformed DNS query")]
    MalformedQuery(#[source] ProtoError),

    /// Returned when the annotated DNS message can't be encoded again.
    #[error("failed to encode DNS query")]
    EncodeError(#[source] ProtoError),

    /// Returned when a `GET` query has no `dns` parameter.
    #[error("missing 'dns' query parameter")]
    MissingDnsParam,

    /// Returned when the `dns` parameter isn't unpadded base64url.
    #[error("invalid base64url encoding: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    /// Returned when a `POST` query isn't sent as `application/dns-message`.
    #[error("unsupported content type \"{0}\"")]
    UnsupportedMediaType(String),

    /// Returned when the client address can't be determined or parsed.
    #[error("invalid client address \"{0}\"")]
    InvalidClientAddr(String),

    /// Returned when the resolver was built without any upstreams.
    #[error("no upstream")]
    NoUpstream,

    /// Returned when every upstream attempt failed.
    #[error("no answer")]
    NoAnswer,

    /// Returned when a top-up amount is too small, or a confirmed amount can't be parsed.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Returned when a confirmed order number doesn't carry a token.
    #[error("invalid order number \"{0}\"")]
    InvalidOrder(String),

    /// Returned when the ledger backend fails. The cause is logged, not sent to clients.
    #[error("ledger error")]
    Ledger(#[from] LedgerError),

    /// Returned when the payment provider rejects a checkout or notification.
    #[error("payment error")]
    Payment(#[from] PaymentError),

    /// Returned when clients `POST` invalid JSON.
    #[error(transparent)]
    JsonExtractorRejection(#[from] JsonRejection),

    /// Returned when a configured upstream isn't an `http` or `https` URL.
    #[error("upstream \"{0}\" is not an http(s) URL")]
    InvalidUpstream(Url),

    /// Returned when the [config][crate::config::Config] names no upstreams.
    #[error("at least one upstream must be configured")]
    NoUpstreamsConfigured,

    /// Returned when [`Config::price_mb_per_unit`][crate::config::Config::price_mb_per_unit]
    /// is zero.
    #[error("price must be a positive number of megabytes per unit")]
    InvalidPrice,

    /// Returned when a generic IO error occurs.
    #[error("an IO error occurred")]
    IO(#[from] std::io::Error),

    /// Returned when the config file contains invalid JSON.
    #[error("invalid JSON")]
    InvalidJSON(#[from] serde_json::Error),
}
