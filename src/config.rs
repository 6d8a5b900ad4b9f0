use crate::error::Error;
use crate::ledger::{DynLedger, FreeLedger, SqliteLedger};
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub type SharedConfig = Arc<Config>;

const DEFAULT_PRICE_MB_PER_UNIT: u64 = 1024;

/// Which [`Ledger`][crate::ledger::Ledger] backs the gateway.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LedgerConfig {
    /// Unmetered: every token has access.
    Free,
    /// Metered: tickets are stored in the SQLite database at `path`.
    Sqlite { path: String },
}

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub api_timeout: Duration,
    /// DoH endpoints every query is raced across.
    pub upstreams: Vec<Url>,
    /// Upper bound on a single upstream attempt.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub upstream_timeout: Duration,
    /// Megabytes of traffic bought by one major currency unit.
    #[serde(default = "default_price")]
    pub price_mb_per_unit: u64,
    /// Header carrying the client address when running behind a reverse proxy, e.g.
    /// `x-forwarded-for`. Without it the TCP peer address is used.
    #[serde(default)]
    pub client_ip_header: Option<String>,
    pub ledger: LedgerConfig,
}

fn default_price() -> u64 {
    DEFAULT_PRICE_MB_PER_UNIT
}

impl Config {
    pub fn try_from_file(p: impl AsRef<Path>) -> Result<Self, Error> {
        let f = File::open(p)?;
        let reader = BufReader::new(f);
        let conf: Config = serde_json::from_reader(reader)?;
        conf.validate()?;
        Ok(conf)
    }

    /// Build the configured ledger backend.
    pub async fn ledger(&self) -> Result<DynLedger, Error> {
        Ok(match &self.ledger {
            LedgerConfig::Free => {
                tracing::warn!("running unmetered, every token has access");
                Arc::new(FreeLedger)
            }
            LedgerConfig::Sqlite { path } => Arc::new(SqliteLedger::open(path).await?),
        })
    }

    fn validate(&self) -> Result<(), Error> {
        if self.upstreams.is_empty() {
            return Err(Error::NoUpstreamsConfigured);
        }
        if let Some(upstream) = self
            .upstreams
            .iter()
            .find(|u| !matches!(u.scheme(), "http" | "https"))
        {
            return Err(Error::InvalidUpstream(upstream.clone()));
        }
        if self.price_mb_per_unit == 0 {
            return Err(Error::InvalidPrice);
        }
        Ok(())
    }
}
