//! Metered access to the resolver.

use crate::dns::Resolver;
use crate::error::Error;
use crate::ledger::{DynLedger, LedgerError};
use bytes::Bytes;
use std::net::IpAddr;

/// Checks a token's balance, resolves the query, and charges the token for the traffic.
///
/// Quota isn't reserved up front. A request that passes the balance check can still fail at
/// the charge step when a concurrent request drained the ticket in between, after the upstream
/// answer was already fetched.
#[derive(Clone)]
pub struct Gate {
    ledger: DynLedger,
    resolver: Resolver,
}

impl Gate {
    #[must_use]
    pub fn new(ledger: DynLedger, resolver: Resolver) -> Self {
        Gate { ledger, resolver }
    }

    /// Resolve `raw` on behalf of `token` and return the raw answer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] if the token has no balance or can't be charged,
    /// [`Error::Ledger`] if the ledger fails, and the [`Resolver::resolve`] errors otherwise.
    pub async fn handle(&self, token: &str, client: IpAddr, raw: &[u8]) -> Result<Bytes, Error> {
        if token.is_empty() {
            return Err(Error::Unauthorized);
        }

        let newest = self.ledger.list(token, 1).await?;
        match newest.first() {
            Some(ticket) if ticket.bytes_remaining > 0 => {}
            _ => return Err(Error::Unauthorized),
        }

        let resolution = self.resolver.resolve(raw, client).await?;
        let cost = i64::try_from(resolution.billable_bytes()).unwrap_or(i64::MAX);
        match self.ledger.consume(token, cost).await {
            Ok(()) => Ok(resolution.answer),
            Err(LedgerError::InsufficientBalance) => {
                tracing::warn!("charge of {cost} bytes failed after resolving for {client}");
                Err(Error::Unauthorized)
            }
            Err(err) => {
                tracing::error!("charge of {cost} bytes failed: {err}");
                Err(err.into())
            }
        }
    }
}
