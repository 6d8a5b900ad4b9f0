//! Payment provider boundary.
//!
//! Tickets are bought in two steps. A top-up request creates an [`Order`] and asks the
//! [`PaymentProvider`] for a checkout payload (a QR code or redirect URL) to show the buyer. Once
//! the buyer pays, the provider calls the gateway's notification webhook, the provider verifies
//! it and hands back the confirmed [`Order`], and only then is the token credited.
//!
//! Order numbers have the form `<token>@<RFC 3339 creation time>`, so the webhook can recover
//! the token from the order alone.

use crate::error::Error;
use axum::http::HeaderMap;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const MIB: u64 = 1024 * 1024;

/// Smallest accepted top-up, in minor currency units.
pub const MIN_TOP_UP_CENTS: u64 = 10;

#[allow(clippy::module_name_repetitions)]
#[derive(thiserror::Error, Debug)]
pub enum PaymentError {
    #[error("payment provider rejected the checkout: {0}")]
    Checkout(String),
    #[error("payment notification failed verification: {0}")]
    Verification(String),
}

/// An order as exchanged with the payment provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub order_no: String,
    /// The provider's transaction id, only known once the order was paid.
    pub trade_no: String,
    /// Amount in major units with two decimals, e.g. `"0.10"`.
    pub amount: String,
}

impl Order {
    /// A fresh, unpaid order of `cents` for `token`.
    #[must_use]
    pub fn new(token: &str, cents: u64, now: OffsetDateTime) -> Self {
        // NB: formatting a UTC timestamp as RFC 3339 can't fail for years 0..=9999.
        let created = now
            .to_offset(time::UtcOffset::UTC)
            .format(&Rfc3339)
            .unwrap_or_else(|_| now.unix_timestamp().to_string());
        Order {
            order_no: format!("{token}@{created}"),
            trade_no: String::new(),
            amount: format!("{}.{:02}", cents / 100, cents % 100),
        }
    }

    /// The token this order credits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOrder`] if the order number has no `@` or an empty token.
    pub fn token(&self) -> Result<&str, Error> {
        match self.order_no.split_once('@') {
            Some((token, _)) if !token.is_empty() => Ok(token),
            _ => Err(Error::InvalidOrder(self.order_no.clone())),
        }
    }

    /// Bytes bought by this order at `mb_per_unit` megabytes per major currency unit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAmount`] if the amount isn't a non-negative decimal with at most
    /// two fractional digits, or the result overflows.
    pub fn bytes(&self, mb_per_unit: u64) -> Result<i64, Error> {
        let invalid = || Error::InvalidAmount(self.amount.clone());
        let cents = parse_cents(&self.amount).ok_or_else(invalid)?;
        let bytes = cents
            .checked_mul(mb_per_unit)
            .and_then(|v| v.checked_mul(MIB))
            .map(|v| v / 100)
            .ok_or_else(invalid)?;
        i64::try_from(bytes).map_err(|_| invalid())
    }
}

fn parse_cents(amount: &str) -> Option<u64> {
    let (whole, frac) = amount.trim().split_once('.').unwrap_or((amount.trim(), ""));
    if whole.is_empty() || frac.len() > 2 || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let whole: u64 = whole.parse().ok()?;
    let frac: u64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<u64>().ok()? * 10,
        _ => frac.parse().ok()?,
    };
    whole.checked_mul(100)?.checked_add(frac)
}

/// An async trait describing the external payment provider.
#[async_trait::async_trait]
#[allow(clippy::module_name_repetitions)]
pub trait PaymentProvider {
    /// Register `order` with the provider and return the payload the buyer needs to pay it.
    /// The provider must confirm payment by calling `notify_url`.
    async fn create_checkout(&self, order: &Order, notify_url: &str)
        -> Result<String, PaymentError>;

    /// Verify a payment notification and return the confirmed order.
    async fn verify_notification(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Order, PaymentError>;
}

#[allow(clippy::module_name_repetitions)]
pub type DynPaymentProvider = Arc<dyn PaymentProvider + Send + Sync>;
