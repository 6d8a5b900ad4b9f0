use crate::ledger::{expires_at, Ledger, LedgerError, Ticket};
use time::OffsetDateTime;

/// Balance reported by the synthetic ticket.
pub const FREE_BALANCE: i64 = 100;

/// An unmetered [`Ledger`]. Every token has one synthetic ticket with a fixed positive
/// balance, and allocations and charges are discarded.
#[derive(Default, Debug, Clone, Copy)]
#[allow(clippy::module_name_repetitions)]
pub struct FreeLedger;

#[async_trait::async_trait]
impl Ledger for FreeLedger {
    async fn allocate(
        &self,
        _token: &str,
        _bytes: i64,
        _pay_order: &str,
        _trade_no: &str,
    ) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn consume(&self, _token: &str, _cost: i64) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn list(&self, token: &str, _limit: u32) -> Result<Vec<Ticket>, LedgerError> {
        let now = OffsetDateTime::now_utc();
        Ok(vec![Ticket {
            id: 0,
            token: token.to_string(),
            bytes_remaining: FREE_BALANCE,
            bytes_total: FREE_BALANCE,
            pay_order: String::new(),
            trade_no: String::new(),
            created_at: now,
            updated_at: now,
            expires_at: expires_at(now)?,
        }])
    }
}
