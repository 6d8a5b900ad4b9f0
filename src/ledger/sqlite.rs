//! A SQLite-backed implementation of the [`Ledger`][super::Ledger] trait.
//!
//! The database runs in WAL mode. All timestamps are stored as Unix seconds so that expiry
//! checks are plain integer comparisons.
//!
//! Consumption has two paths:
//!
//! * A fast path that charges the oldest active ticket in a single guarded `UPDATE`. Two
//!   concurrent charges against the same ticket can't both pass the guard.
//! * A slow path, taken only when the fast path touched no row, that spreads the charge over
//!   several tickets inside one `BEGIN IMMEDIATE` transaction. The write lock is taken before
//!   the balances are read, so concurrent slow charges queue on `busy_timeout` instead of
//!   failing. Every row is still written with a compare-and-set on the balance that was read,
//!   and a mismatch rolls the whole transaction back.
use crate::ledger::{expires_at, Ledger, LedgerError, Ticket};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS tickets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        token TEXT NOT NULL,
        bytes_remaining INTEGER NOT NULL,
        bytes_total INTEGER NOT NULL,
        pay_order TEXT NOT NULL,
        trade_no TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    );
    "#,
    "CREATE INDEX IF NOT EXISTS tickets_token_expires ON tickets(token, expires_at)",
    "CREATE UNIQUE INDEX IF NOT EXISTS tickets_pay_order ON tickets(pay_order)",
];

const TICKET_COLUMNS: &str = "id, token, bytes_remaining, bytes_total, pay_order, trade_no, \
                              created_at, updated_at, expires_at";

#[derive(FromRow)]
struct TicketRow {
    id: i64,
    token: String,
    bytes_remaining: i64,
    bytes_total: i64,
    pay_order: String,
    trade_no: String,
    created_at: i64,
    updated_at: i64,
    expires_at: i64,
}

impl TryFrom<TicketRow> for Ticket {
    type Error = LedgerError;

    fn try_from(row: TicketRow) -> Result<Self, Self::Error> {
        let at = |secs: i64| {
            OffsetDateTime::from_unix_timestamp(secs)
                .map_err(|err| LedgerError::Corrupt(format!("ticket {}: {err}", row.id)))
        };
        Ok(Ticket {
            id: row.id,
            created_at: at(row.created_at)?,
            updated_at: at(row.updated_at)?,
            expires_at: at(row.expires_at)?,
            token: row.token,
            bytes_remaining: row.bytes_remaining,
            bytes_total: row.bytes_total,
            pay_order: row.pay_order,
            trade_no: row.trade_no,
        })
    }
}

/// A durable ticket ledger stored in a SQLite database file.
#[derive(Debug, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Open the ledger database at `path`, creating it and its schema if missing.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the database can't be opened or the schema can't be
    /// created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        tracing::info!("ticket ledger opened at {}", path.as_ref().display());
        Ok(Self { pool })
    }

    pub(crate) async fn allocate_at(
        &self,
        token: &str,
        bytes: i64,
        pay_order: &str,
        trade_no: &str,
        now: OffsetDateTime,
    ) -> Result<(), LedgerError> {
        let created = now.unix_timestamp();
        let expires = expires_at(now)?.unix_timestamp();
        let res = sqlx::query(
            "INSERT INTO tickets \
             (token, bytes_remaining, bytes_total, pay_order, trade_no, created_at, updated_at, expires_at) \
             VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?5, ?6)",
        )
        .bind(token)
        .bind(bytes)
        .bind(pay_order)
        .bind(trade_no)
        .bind(created)
        .bind(expires)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => {
                tracing::info!("allocated a ticket of {bytes} bytes, trade {trade_no}");
                Ok(())
            }
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                tracing::debug!("trade {trade_no} already allocated");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) async fn consume_at(
        &self,
        token: &str,
        cost: i64,
        now: OffsetDateTime,
    ) -> Result<(), LedgerError> {
        if cost <= 0 {
            return Err(LedgerError::InvalidCost(cost));
        }
        if self.consume_fast(token, cost, now).await? {
            return Ok(());
        }
        self.consume_slow(token, cost, now).await
    }

    /// Charge the oldest active ticket in one statement, if it covers `cost` on its own.
    async fn consume_fast(
        &self,
        token: &str,
        cost: i64,
        now: OffsetDateTime,
    ) -> Result<bool, LedgerError> {
        let res = sqlx::query(
            "UPDATE tickets SET bytes_remaining = bytes_remaining - ?1, updated_at = ?2 \
             WHERE id = (SELECT id FROM tickets \
                         WHERE token = ?3 AND expires_at > ?2 AND bytes_remaining > 0 \
                         ORDER BY id ASC LIMIT 1) \
             AND bytes_remaining >= ?1",
        )
        .bind(cost)
        .bind(now.unix_timestamp())
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn consume_slow(
        &self,
        token: &str,
        cost: i64,
        now: OffsetDateTime,
    ) -> Result<(), LedgerError> {
        // Detached so a cancelled request can't return the connection mid-transaction.
        tokio::spawn(spread_charge(
            self.pool.clone(),
            token.to_string(),
            cost,
            now.unix_timestamp(),
        ))
        .await?
    }

    pub(crate) async fn list_tickets(
        &self,
        token: &str,
        limit: u32,
    ) -> Result<Vec<Ticket>, LedgerError> {
        let rows: Vec<TicketRow> = sqlx::query_as(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE token = ?1 ORDER BY id DESC LIMIT ?2"
        ))
        .bind(token)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Ticket::try_from).collect()
    }
}

async fn spread_charge(
    pool: SqlitePool,
    token: String,
    cost: i64,
    now: i64,
) -> Result<(), LedgerError> {
    let mut conn = pool.acquire().await?;
    begin_immediate(&mut conn).await?;

    let res = match active_balances(&mut conn, &token, now).await {
        Ok(active) => match spread_cost(&active, cost) {
            Some(updates) => write_balances(&mut conn, &updates, now).await,
            None => Err(LedgerError::InsufficientBalance),
        },
        Err(err) => Err(err),
    };
    finish(&mut conn, res).await?;
    tracing::debug!("charged {cost} bytes across several tickets");
    Ok(())
}

/// Start a transaction holding the database write lock, waiting out `busy_timeout` for it.
async fn begin_immediate(conn: &mut SqliteConnection) -> Result<(), LedgerError> {
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(())
}

/// Commit if `res` is Ok, roll back otherwise.
async fn finish(
    conn: &mut SqliteConnection,
    res: Result<(), LedgerError>,
) -> Result<(), LedgerError> {
    match res {
        Ok(()) => {
            if let Err(err) = sqlx::query("COMMIT").execute(&mut *conn).await {
                sqlx::query("ROLLBACK").execute(&mut *conn).await?;
                return Err(err.into());
            }
            Ok(())
        }
        Err(err) => {
            sqlx::query("ROLLBACK").execute(&mut *conn).await?;
            Err(err)
        }
    }
}

async fn active_balances(
    conn: &mut SqliteConnection,
    token: &str,
    now: i64,
) -> Result<Vec<(i64, i64)>, LedgerError> {
    Ok(sqlx::query_as(
        "SELECT id, bytes_remaining FROM tickets \
         WHERE token = ?1 AND bytes_remaining > 0 AND expires_at > ?2 \
         ORDER BY id ASC",
    )
    .bind(token)
    .bind(now)
    .fetch_all(&mut *conn)
    .await?)
}

/// Apply `(id, old, new)` balance writes. Each row is only written if it still holds `old`.
async fn write_balances(
    conn: &mut SqliteConnection,
    updates: &[(i64, i64, i64)],
    now: i64,
) -> Result<(), LedgerError> {
    for &(id, old, new) in updates {
        let res = sqlx::query(
            "UPDATE tickets SET bytes_remaining = ?1, updated_at = ?2 \
             WHERE id = ?3 AND bytes_remaining = ?4",
        )
        .bind(new)
        .bind(now)
        .bind(id)
        .bind(old)
        .execute(&mut *conn)
        .await?;
        if res.rows_affected() != 1 {
            return Err(LedgerError::Conflict);
        }
    }
    Ok(())
}

/// Walk `(id, balance)` pairs oldest first, draining each until `cost` is covered. Returns the
/// `(id, old balance, new balance)` writes to apply, or `None` if the combined balance falls
/// short of `cost`.
fn spread_cost(active: &[(i64, i64)], cost: i64) -> Option<Vec<(i64, i64, i64)>> {
    let available: i64 = active.iter().map(|(_, balance)| *balance).sum();
    if active.is_empty() || available < cost {
        return None;
    }

    let mut outstanding = cost;
    let mut updates = Vec::new();
    for &(id, balance) in active {
        if balance >= outstanding {
            updates.push((id, balance, balance - outstanding));
            break;
        }
        outstanding -= balance;
        updates.push((id, balance, 0));
    }
    Some(updates)
}

#[async_trait::async_trait]
impl Ledger for SqliteLedger {
    async fn allocate(
        &self,
        token: &str,
        bytes: i64,
        pay_order: &str,
        trade_no: &str,
    ) -> Result<(), LedgerError> {
        self.allocate_at(token, bytes, pay_order, trade_no, OffsetDateTime::now_utc())
            .await
    }

    async fn consume(&self, token: &str, cost: i64) -> Result<(), LedgerError> {
        self.consume_at(token, cost, OffsetDateTime::now_utc()).await
    }

    async fn list(&self, token: &str, limit: u32) -> Result<Vec<Ticket>, LedgerError> {
        self.list_tickets(token, limit).await
    }
}
