use crate::error::Error;
use crate::payment::PaymentError;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub(crate) struct APIError(anyhow::Error);

impl IntoResponse for APIError {
    fn into_response(self) -> Response {
        let any_err = self.0;
        let status = match any_err.downcast_ref::<Error>() {
            Some(Error::Unauthorized) => StatusCode::UNAUTHORIZED,
            Some(Error::NotImplemented) => StatusCode::NOT_IMPLEMENTED,
            Some(
                Error::MalformedQuery(_)
                | Error::EncodeError(_)
                | Error::MissingDnsParam
                | Error::InvalidBase64(_)
                | Error::InvalidClientAddr(_)
                | Error::InvalidAmount(_)
                | Error::InvalidOrder(_),
            ) => StatusCode::BAD_REQUEST,
            Some(Error::UnsupportedMediaType(_)) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Some(Error::NoAnswer) => StatusCode::BAD_GATEWAY,
            Some(Error::Ledger(err)) => {
                tracing::error!("ledger error: {err}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Some(Error::Payment(err)) => {
                tracing::warn!("{err}");
                match err {
                    PaymentError::Verification(_) => StatusCode::BAD_REQUEST,
                    PaymentError::Checkout(_) => StatusCode::INTERNAL_SERVER_ERROR,
                }
            }
            Some(Error::JsonExtractorRejection(err)) => json_rejection_status(err),
            Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
            // Extractor rejections arrive here unwrapped through `WithRejection`.
            None => any_err
                .downcast_ref::<JsonRejection>()
                .map_or(StatusCode::INTERNAL_SERVER_ERROR, json_rejection_status),
        };
        let body = Json(json!({
            "error": format!("{any_err}"),
        }));
        (status, body).into_response()
    }
}

fn json_rejection_status(err: &JsonRejection) -> StatusCode {
    match err {
        JsonRejection::JsonDataError(_) => StatusCode::UNPROCESSABLE_ENTITY,
        JsonRejection::JsonSyntaxError(_) => StatusCode::BAD_REQUEST,
        JsonRejection::MissingJsonContentType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl<E> From<E> for APIError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
