//! HTTP routes and handlers
//!
//! JSON in, JSON out. Handlers run the admission checks and delegate to
//! the billing service; every 2xx body is a `{data: Bill}` envelope.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::Method;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use tally_common::validation::{validate_add_line_item_request, validate_create_bill_request};
use tally_common::{AddLineItemRequest, AppConfig, BillResponse, CreateBillRequest};
use tally_core::BillingService;

use crate::error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<BillingService>,
    pub cfg: Arc<AppConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/bills", post(create_bill))
        .route("/bills/:bill_id", get(get_bill))
        .route("/bills/:bill_id/line-items", post(add_line_item))
        .route("/bills/:bill_id/close", post(close_bill))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn create_bill(
    State(state): State<AppState>,
    Json(req): Json<CreateBillRequest>,
) -> Result<Json<BillResponse>, ApiError> {
    info!(customer_id = %req.customer_id, "creating new bill via HTTP API");
    validate_create_bill_request(&req, &state.cfg.billing.validation)?;

    let bill = state.service.create_bill(&req).await?;
    Ok(Json(BillResponse { data: bill }))
}

async fn get_bill(
    State(state): State<AppState>,
    Path(bill_id): Path<Uuid>,
) -> Result<Json<BillResponse>, ApiError> {
    let bill = state.service.get_bill(bill_id).await?;
    Ok(Json(BillResponse { data: bill }))
}

async fn add_line_item(
    State(state): State<AppState>,
    Path(bill_id): Path<Uuid>,
    Json(req): Json<AddLineItemRequest>,
) -> Result<Json<BillResponse>, ApiError> {
    info!(bill_id = %bill_id, currency = %req.currency, "adding line item via HTTP API");
    validate_add_line_item_request(&req, &state.cfg.billing.validation)?;

    let bill = state.service.add_line_item(bill_id, &req).await?;
    Ok(Json(BillResponse { data: bill }))
}

async fn close_bill(
    State(state): State<AppState>,
    Path(bill_id): Path<Uuid>,
) -> Result<Json<BillResponse>, ApiError> {
    info!(bill_id = %bill_id, "closing bill via HTTP API");
    let bill = state.service.close_bill(bill_id).await?;
    Ok(Json(BillResponse { data: bill }))
}
