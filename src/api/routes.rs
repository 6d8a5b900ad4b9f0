use crate::api::api_error::APIError;
use crate::api::model::{DnsQueryParams, TopUpRequest, TopUpResult};
use crate::api::server::AppState;
use crate::config::Config;
use crate::dns::DNS_MESSAGE;
use crate::error::Error;
use crate::ledger::Ticket;
use crate::payment::Order;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::WithRejection;
use bytes::Bytes;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use time::OffsetDateTime;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const TICKET_LISTING_LIMIT: u32 = 10;

pub(super) fn new(state: AppState) -> Router {
    Router::new()
        .route("/healthcheck", get(health_check))
        .route("/dns-query", get(missing_token).post(missing_token))
        .route("/dns-query/", get(missing_token).post(missing_token))
        .route("/dns-query/:token", get(dns_query_get).post(dns_query_post))
        .route("/ticket", post(top_up))
        .route("/ticket/notify", post(payment_notify))
        .route("/ticket/:token", get(list_tickets))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(state.config.api_timeout))
        .with_state(state)
}

#[allow(clippy::unused_async)]
async fn health_check() -> impl IntoResponse {
    Json(json!({"ok":"healthy"}))
}

#[allow(clippy::unused_async)]
async fn missing_token() -> APIError {
    Error::Unauthorized.into()
}

async fn dns_query_get(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(token): Path<String>,
    headers: HeaderMap,
    Query(params): Query<DnsQueryParams>,
) -> Result<Response, APIError> {
    let client = client_ip(&state.config, &headers, peer)?;
    let raw = params.decode()?;
    let answer = state.gate.handle(&token, client, &raw).await?;
    Ok(dns_message(answer))
}

async fn dns_query_post(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, APIError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with(DNS_MESSAGE) {
        return Err(Error::UnsupportedMediaType(content_type.to_string()).into());
    }

    let client = client_ip(&state.config, &headers, peer)?;
    let answer = state.gate.handle(&token, client, &body).await?;
    Ok(dns_message(answer))
}

fn dns_message(answer: Bytes) -> Response {
    ([(header::CONTENT_TYPE, DNS_MESSAGE)], answer).into_response()
}

/// The address the client subnet is derived from: the TCP peer, or the first entry of the
/// configured proxy header.
fn client_ip(config: &Config, headers: &HeaderMap, peer: SocketAddr) -> Result<IpAddr, Error> {
    let ip = match &config.client_ip_header {
        None => peer.ip(),
        Some(name) => {
            let value = headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| Error::InvalidClientAddr(String::new()))?;
            let first = value.split(',').next().unwrap_or_default().trim();
            first
                .parse()
                .map_err(|_| Error::InvalidClientAddr(first.to_string()))?
        }
    };
    // Dual-stack listeners report IPv4 clients as mapped IPv6 addresses.
    Ok(match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    })
}

async fn list_tickets(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<Vec<Ticket>>, APIError> {
    let tickets = state
        .ledger
        .list(&token, TICKET_LISTING_LIMIT)
        .await
        .map_err(Error::from)?;
    Ok(Json(tickets))
}

async fn top_up(
    State(state): State<AppState>,
    headers: HeaderMap,
    WithRejection(Json(payload), _): WithRejection<Json<TopUpRequest>, APIError>,
) -> Result<Json<TopUpResult>, APIError> {
    let payment = state.payment.as_ref().ok_or(Error::NotImplemented)?;
    payload.validate()?;

    let token = payload.token_or_mint();
    let order = Order::new(&token, payload.cents, OffsetDateTime::now_utc());
    let host = match headers.get(header::HOST).and_then(|v| v.to_str().ok()) {
        Some(host) => host.to_string(),
        None => state.config.bind_addr.to_string(),
    };
    let notify_url = format!("https://{host}/ticket/notify");

    let qr = payment
        .create_checkout(&order, &notify_url)
        .await
        .map_err(Error::from)?;
    tracing::info!("created checkout of {} for a new order", order.amount);
    Ok(Json(TopUpResult {
        qr,
        token,
        order: order.order_no,
    }))
}

async fn payment_notify(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<&'static str, APIError> {
    let payment = state.payment.as_ref().ok_or(Error::NotImplemented)?;
    let order = payment
        .verify_notification(&headers, &body)
        .await
        .map_err(Error::from)?;

    let token = order.token()?;
    let bytes = order.bytes(state.config.price_mb_per_unit)?;
    state
        .ledger
        .allocate(token, bytes, &order.order_no, &order.trade_no)
        .await
        .map_err(Error::from)?;
    tracing::info!("confirmed trade {} for {} bytes", order.trade_no, bytes);
    Ok("success")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::dns::race::tests::{FakeTransport, Script};
    use crate::dns::race::Racer;
    use crate::dns::Resolver;
    use crate::gate::Gate;
    use crate::ledger::sqlite::tests::ledger;
    use crate::ledger::{DynLedger, FreeLedger};
    use crate::payment::{DynPaymentProvider, PaymentError, PaymentProvider};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde::Deserialize;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;
    use url::Url;

    // example.com A, unpadded base64url.
    const QUERY: &str = "AAABAAABAAAAAAAAB2V4YW1wbGUDY29tAAABAAE";

    /// Accepts notifications carrying `x-signature: ok` and a JSON order body.
    struct FakeProvider;

    #[derive(Deserialize)]
    struct Notification {
        order_no: String,
        trade_no: String,
        amount: String,
    }

    #[async_trait::async_trait]
    impl PaymentProvider for FakeProvider {
        async fn create_checkout(
            &self,
            order: &Order,
            notify_url: &str,
        ) -> Result<String, PaymentError> {
            Ok(format!("pay://{}?notify={notify_url}", order.amount))
        }

        async fn verify_notification(
            &self,
            headers: &HeaderMap,
            body: &[u8],
        ) -> Result<Order, PaymentError> {
            if headers.get("x-signature").map(|v| v.as_bytes()) != Some(b"ok") {
                return Err(PaymentError::Verification("bad signature".to_string()));
            }
            let n: Notification = serde_json::from_slice(body)
                .map_err(|err| PaymentError::Verification(err.to_string()))?;
            Ok(Order {
                order_no: n.order_no,
                trade_no: n.trade_no,
                amount: n.amount,
            })
        }
    }

    fn config(client_ip_header: Option<&str>) -> Config {
        Config {
            bind_addr: "127.0.0.1:8053".parse().unwrap(),
            api_timeout: Duration::from_secs(5),
            upstreams: vec![Url::parse("https://upstream.test/dns-query").unwrap()],
            upstream_timeout: Duration::from_secs(1),
            price_mb_per_unit: 1024,
            client_ip_header: client_ip_header.map(str::to_string),
            ledger: LedgerConfig::Free,
        }
    }

    fn app(
        config: Config,
        ledger: DynLedger,
        payment: Option<DynPaymentProvider>,
    ) -> Router {
        let transport = FakeTransport::default().with(
            "https://upstream.test/dns-query",
            Script::Answer {
                delay: Duration::from_millis(1),
                body: b"\x00\x00\x81\x80",
            },
        );
        let resolver = Resolver::new(
            config.upstreams.clone(),
            Racer::new(Arc::new(transport), config.upstream_timeout),
        );
        new(AppState {
            config: Arc::new(config),
            gate: Arc::new(Gate::new(ledger.clone(), resolver)),
            ledger,
            payment,
        })
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let mut req = req;
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("203.0.113.5:40000".parse().unwrap()));
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        (status, headers, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, json: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::HOST, "gw.test")
            .body(Body::from(json.to_string()))
            .unwrap()
    }

    fn notification(order_no: &str, signature: &str) -> Request<Body> {
        let body = json!({"order_no": order_no, "trade_no": "T-1", "amount": "0.10"});
        Request::builder()
            .method("POST")
            .uri("/ticket/notify")
            .header("x-signature", signature)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn get_query_returns_dns_message() {
        let app = app(config(None), Arc::new(FreeLedger), None);
        let (status, headers, body) = send(&app, get(&format!("/dns-query/abc?dns={QUERY}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], DNS_MESSAGE);
        assert_eq!(&body[..], b"\x00\x00\x81\x80");
    }

    #[tokio::test]
    async fn post_query_requires_dns_message_body() {
        let app = app(config(None), Arc::new(FreeLedger), None);
        let raw = base64::Engine::decode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            QUERY,
        )
        .unwrap();

        let req = Request::builder()
            .method("POST")
            .uri("/dns-query/abc")
            .header(header::CONTENT_TYPE, DNS_MESSAGE)
            .body(Body::from(raw.clone()))
            .unwrap();
        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"\x00\x00\x81\x80");

        let req = Request::builder()
            .method("POST")
            .uri("/dns-query/abc")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from(raw))
            .unwrap();
        let (status, _, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn query_without_token_is_unauthorized() {
        let app = app(config(None), Arc::new(FreeLedger), None);
        for uri in ["/dns-query", "/dns-query/"] {
            let (status, _, body) = send(&app, get(&format!("{uri}?dns={QUERY}"))).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(body["error"], "invalid token");
        }
    }

    #[tokio::test]
    async fn bad_query_parameters_are_bad_requests() {
        let app = app(config(None), Arc::new(FreeLedger), None);
        let (status, _, _) = send(&app, get("/dns-query/abc")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _, _) = send(&app, get("/dns-query/abc?dns=%%%")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _, _) = send(&app, get("/dns-query/abc?dns=AAAB")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_token_is_unauthorized() {
        let (sqlite, _dir) = ledger().await;
        let app = app(config(None), Arc::new(sqlite), None);
        let (status, _, _) = send(&app, get(&format!("/dns-query/nobody?dns={QUERY}"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn proxy_header_supplies_client_address() {
        let app = app(config(Some("x-forwarded-for")), Arc::new(FreeLedger), None);
        let uri = format!("/dns-query/abc?dns={QUERY}");

        let (status, _, _) = send(&app, get(&uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let req = Request::builder()
            .uri(&uri)
            .header("x-forwarded-for", "not-an-ip")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let req = Request::builder()
            .uri(&uri)
            .header("x-forwarded-for", "198.51.100.7, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn mapped_ipv6_peers_are_treated_as_ipv4() {
        let peer: SocketAddr = "[::ffff:192.0.2.1]:443".parse().unwrap();
        let ip = client_ip(&config(None), &HeaderMap::new(), peer).unwrap();
        assert_eq!(ip, "192.0.2.1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn top_up_without_provider_is_not_implemented() {
        let app = app(config(None), Arc::new(FreeLedger), None);
        let (status, _, _) = send(&app, post_json("/ticket", r#"{"cents": 100}"#)).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        let (status, _, _) = send(&app, notification("abc@now", "ok")).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn top_up_validates_body() {
        let app = app(config(None), Arc::new(FreeLedger), Some(Arc::new(FakeProvider)));
        let (status, _, _) = send(&app, post_json("/ticket", r#"{"cents": 5}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _, _) = send(&app, post_json("/ticket", "{")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _, _) = send(&app, post_json("/ticket", r#"{"cents": "ten"}"#)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn top_up_then_confirm_credits_token() {
        let (sqlite, _dir) = ledger().await;
        let app = app(config(None), Arc::new(sqlite), Some(Arc::new(FakeProvider)));

        let (status, _, body) = send(&app, post_json("/ticket", r#"{"cents": 10}"#)).await;
        assert_eq!(status, StatusCode::OK);
        let checkout: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let token = checkout["token"].as_str().unwrap().to_string();
        let order = checkout["order"].as_str().unwrap().to_string();
        assert_eq!(token.len(), 22);
        assert!(order.starts_with(&format!("{token}@")));
        assert_eq!(
            checkout["qr"],
            "pay://0.10?notify=https://gw.test/ticket/notify"
        );

        // Nothing is credited until the provider confirms.
        let (_, _, body) = send(&app, get(&format!("/ticket/{token}"))).await;
        assert_eq!(&body[..], b"[]");

        let (status, _, body) = send(&app, notification(&order, "forged")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_ne!(&body[..], b"success");

        for _ in 0..2 {
            let (status, _, body) = send(&app, notification(&order, "ok")).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(&body[..], b"success");
        }

        let (status, _, body) = send(&app, get(&format!("/ticket/{token}"))).await;
        assert_eq!(status, StatusCode::OK);
        let tickets: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let tickets = tickets.as_array().unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0]["total_bytes"], 1024 * 1024 * 1024 / 10);
        assert_eq!(tickets[0]["bytes"], 1024 * 1024 * 1024 / 10);
        assert_eq!(tickets[0]["pay_order"], order.as_str());
        assert_eq!(tickets[0]["trade_no"], "T-1");

        let (status, _, _) = send(&app, get(&format!("/dns-query/{token}?dns={QUERY}"))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn notification_without_token_is_rejected() {
        let (sqlite, _dir) = ledger().await;
        let app = app(config(None), Arc::new(sqlite), Some(Arc::new(FakeProvider)));
        let (status, _, _) = send(&app, notification("no-separator", "ok")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
