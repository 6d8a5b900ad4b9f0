//! Prepaid byte quota.
//!
//! Each payment creates one [`Ticket`] for the paying token. Tickets expire at the start of the
//! calendar month after the one they were bought in, and a token's traffic is charged against
//! its active tickets oldest first.
//!
//! Two implementations of the [`Ledger`] trait are provided, [`sqlite::SqliteLedger`] and
//! [`free::FreeLedger`]. The former is the durable, metered ledger. The latter reports an
//! always-positive balance and never charges anything, for running the gateway unmetered.

use serde::Serialize;
use std::sync::Arc;
use time::{Date, OffsetDateTime};

pub mod free;
pub mod sqlite;

#[allow(clippy::module_name_repetitions)]
pub use free::FreeLedger;
#[allow(clippy::module_name_repetitions)]
pub use sqlite::SqliteLedger;

/// `DynLedger` is a type alias for a [`Ledger`] shared between request handlers. Implementations
/// synchronize internally.
#[allow(clippy::module_name_repetitions)]
pub type DynLedger = Arc<dyn Ledger + Send + Sync>;

#[allow(clippy::module_name_repetitions)]
#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("cost must be positive, got {0}")]
    InvalidCost(i64),
    #[error("ticket balance changed during consumption")]
    Conflict,
    #[error("corrupt ticket row: {0}")]
    Corrupt(String),
    #[error("ticket expiry out of range: {0}")]
    InvalidTime(#[from] time::error::ComponentRange),
    #[error("ledger task aborted: {0}")]
    Aborted(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// One prepaid, expiring allocation of bytes.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub id: i64,
    #[serde(skip)]
    pub token: String,
    #[serde(rename = "bytes")]
    pub bytes_remaining: i64,
    #[serde(rename = "total_bytes")]
    pub bytes_total: i64,
    pub pay_order: String,
    pub trade_no: String,
    #[serde(rename = "created", with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(rename = "updated", with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(rename = "expires", with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// An async trait describing a per-token ledger of prepaid [`Ticket`]s.
#[async_trait::async_trait]
pub trait Ledger {
    /// Create a ticket of `bytes` for `token`. Allocating again with a `pay_order` that already
    /// has a ticket is a successful no-op.
    async fn allocate(
        &self,
        token: &str,
        bytes: i64,
        pay_order: &str,
        trade_no: &str,
    ) -> Result<(), LedgerError>;

    /// Charge `cost` bytes against the token's active tickets, oldest first.
    async fn consume(&self, token: &str, cost: i64) -> Result<(), LedgerError>;

    /// The `limit` most recently created tickets for `token`, newest first.
    async fn list(&self, token: &str, limit: u32) -> Result<Vec<Ticket>, LedgerError>;
}

/// First instant of the calendar month after the one `created` falls in, in UTC.
///
/// # Errors
///
/// Returns [`LedgerError::InvalidTime`] if `created` is in December of the last representable
/// year.
pub fn expires_at(created: OffsetDateTime) -> Result<OffsetDateTime, LedgerError> {
    let created = created.to_offset(time::UtcOffset::UTC);
    let (year, month) = match created.month() {
        time::Month::December => (created.year() + 1, time::Month::January),
        month => (created.year(), month.next()),
    };
    let date = Date::from_calendar_date(year, month, 1)?;
    Ok(date.midnight().assume_utc())
}
