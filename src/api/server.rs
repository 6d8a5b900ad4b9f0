use crate::api::routes;
use crate::config::SharedConfig;
use crate::gate::Gate;
use crate::ledger::DynLedger;
use crate::payment::DynPaymentProvider;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
pub(super) struct AppState {
    pub config: SharedConfig,
    pub gate: Arc<Gate>,
    pub ledger: DynLedger,
    pub payment: Option<DynPaymentProvider>,
}

pub fn new(
    config: SharedConfig,
    gate: Gate,
    ledger: DynLedger,
    payment: Option<DynPaymentProvider>,
) -> impl Future<Output = hyper::Result<()>> {
    axum::Server::bind(&config.bind_addr).serve(
        routes::new(AppState {
            config,
            gate: Arc::new(gate),
            ledger,
            payment,
        })
        .into_make_service_with_connect_info::<SocketAddr>(),
    )
}
