use crate::error::Error;
use crate::payment::MIN_TOP_UP_CENTS;
use base64::engine::general_purpose;
use base64::{alphabet, engine, Engine};
use lazy_static::lazy_static;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

const TOKEN_LEN_BYTES: usize = 16;

lazy_static! {
    static ref BASE64_ENGINE: engine::GeneralPurpose =
        engine::GeneralPurpose::new(&alphabet::URL_SAFE, general_purpose::NO_PAD);
}

/// Query string of a `GET` DNS query ([RFC-8484] section 4.1).
///
/// [RFC-8484]: https://www.rfc-editor.org/rfc/rfc8484#section-4.1
#[derive(Deserialize, Debug, Clone, Default)]
pub(super) struct DnsQueryParams {
    pub dns: Option<String>,
}

impl DnsQueryParams {
    pub fn decode(&self) -> Result<Vec<u8>, Error> {
        let encoded = self.dns.as_deref().ok_or(Error::MissingDnsParam)?;
        Ok(BASE64_ENGINE.decode(encoded)?)
    }
}

#[derive(Deserialize, Debug, Clone, Default, Eq, PartialEq)]
pub(super) struct TopUpRequest {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(alias = "amount_minor_units")]
    pub cents: u64,
}

impl TopUpRequest {
    pub fn validate(&self) -> Result<(), Error> {
        if self.cents < MIN_TOP_UP_CENTS {
            return Err(Error::InvalidAmount(format!(
                "cents must be at least {MIN_TOP_UP_CENTS}"
            )));
        }
        Ok(())
    }

    /// The token to credit, or a freshly minted one when the request didn't name one.
    pub fn token_or_mint(&self) -> String {
        match self.token.as_deref() {
            Some(token) if !token.is_empty() => token.to_string(),
            _ => mint_token(),
        }
    }
}

#[derive(Serialize, Debug, Clone, Default, Eq, PartialEq)]
pub(super) struct TopUpResult {
    pub qr: String,
    pub token: String,
    pub order: String,
}

fn mint_token() -> String {
    let mut raw = [0u8; TOKEN_LEN_BYTES];
    OsRng.fill_bytes(&mut raw);
    BASE64_ENGINE.encode(raw)
}
