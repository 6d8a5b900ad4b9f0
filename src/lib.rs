//! dohtoll
//!
//! A metered [DNS-over-HTTPS][RFC-8484] gateway. Clients query `/dns-query/<token>`, queries
//! are annotated with an [EDNS Client Subnet][RFC-7871] derived from the client address, and
//! raced across several upstream DoH resolvers. The fastest answer wins and the token's
//! prepaid tickets are charged for the bytes moved.
//!
//! [RFC-8484]: https://www.rfc-editor.org/rfc/rfc8484
//! [RFC-7871]: https://www.rfc-editor.org/rfc/rfc7871
//!
#![warn(clippy::pedantic)]

pub mod api;
pub mod config;
pub mod dns;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod payment;

pub use api::new as new_http;
pub use config::{Config, SharedConfig};
pub use gate::Gate;
pub use ledger::{FreeLedger, SqliteLedger};
