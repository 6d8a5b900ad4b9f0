//! HTTP API: metered DNS-over-HTTPS plus ticket management.
//!
//! # API Endpoints
//!
//! ## `/healthcheck` (GET)
//!
//!   Returns HTTP 200 (OK) and the JSON body `{"ok":"healthy"}` when the service is operational.
//!
//! ## `/dns-query/:token` (GET, POST)
//!
//!   A [RFC-8484] DoH endpoint. `GET` takes the query as the unpadded base64url `dns` query
//!   parameter. `POST` takes the raw query as a body of type `application/dns-message`.
//!
//!   The query is forwarded only if `token` has an active ticket with a positive balance. The
//!   answer is returned as `application/dns-message` and the ticket is charged the size of the
//!   query sent upstream plus the size of the answer. Unknown or exhausted tokens get HTTP 401
//!   (Unauthorized). `/dns-query` without a token always returns 401.
//!
//! ## `/ticket` (POST)
//!
//!   Starts a top-up. Expects a JSON request body of the form:
//!
//!   ```json
//!   { "token": "optional-existing-token", "cents": 100 }
//!   ```
//!
//!   A token is minted when none is given. Returns the payment provider's checkout code along
//!   with the token and order number:
//!
//!   ```json
//!   { "qr": "...", "token": "...", "order": "token@2024-05-01T00:00:00Z" }
//!   ```
//!
//!   Returns HTTP 501 (Not Implemented) when no payment provider is configured.
//!
//! ## `/ticket/notify` (POST)
//!
//!   Payment provider callback. A verified notification allocates a ticket for the order's
//!   token and the reply is the plain text `success`. Replayed notifications for the same
//!   order are accepted without allocating twice.
//!
//! ## `/ticket/:token` (GET)
//!
//!   Lists the token's ten most recent tickets, newest first.
//!
//! [RFC-8484]: https://www.rfc-editor.org/rfc/rfc8484

mod api_error;
mod model;
mod routes;
pub mod server;

pub use server::new;
