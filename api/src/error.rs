//! HTTP error envelope
//!
//! Renders the billing error taxonomy as `{code, message, details}`.
//! Internal variants log the underlying cause and surface a generic
//! message; infrastructure error strings never reach callers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use tally_common::BillingError;

pub struct ApiError(BillingError);

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.code() {
            "invalid_argument" => StatusCode::BAD_REQUEST,
            "not_found" | "currency_not_found" => StatusCode::NOT_FOUND,
            "bill_closed" => StatusCode::PRECONDITION_FAILED,
            "upstream_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = if self.0.is_internal() {
            error!(error = %self.0, "internal error");
            "internal error".to_string()
        } else {
            self.0.to_string()
        };

        let body = Json(json!({
            "code": self.0.code(),
            "message": message,
            "details": null,
        }));

        (status, body).into_response()
    }
}
