//! HTTP surface for the storefront's UI-action boundary.

use axum::{extract::{Path, Query, State}, http::StatusCode, routing::{delete, get, post}, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use validator::Validate;
use crate::domain::aggregates::{check_selection, BundleDefinition, PromoAnnotation, SelectionEntry, SelectionSummary};
use crate::domain::value_objects::{BundleId, CartId, SlotId};
use crate::pricing::{price_bundle, BundlePrice, CatalogPrices};
use crate::promo::{check_payment_session, CartTotals, PaymentSessionStatus, PromoStacker};
use crate::services::{CatalogService, PromoValidation, RemoteError};
use crate::sync::{CartSyncEngine, SyncOutcome};
use crate::BundleError;

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CartSyncEngine>,
    pub promos: Arc<PromoStacker>,
    pub catalog: Arc<dyn CatalogService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(serde_json::json!({"status": "healthy", "service": "storefront-bundles"})) }))
        .route("/api/v1/bundles/:id", get(get_bundle))
        .route("/api/v1/bundles/:id/price", post(preview_price))
        .route("/api/v1/carts/:cart_id/bundles/:bundle_id", post(add_bundle).put(update_bundle).patch(update_bundle).delete(remove_bundle))
        .route("/api/v1/carts/:cart_id/bundles/:bundle_id/items/:slot_id", delete(remove_bundle_item))
        .route("/api/v1/carts/:cart_id/totals", get(cart_totals))
        .route("/api/v1/carts/:cart_id/promo", post(apply_promo).delete(remove_promo))
        .route("/api/v1/promo/validate", post(validate_promo))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(err: BundleError) -> (StatusCode, String) {
    let status = match &err {
        BundleError::MissingReference(_) | BundleError::NoCart => StatusCode::BAD_REQUEST,
        BundleError::BundleNotFound(_) | BundleError::ItemNotInCart { .. } => StatusCode::NOT_FOUND,
        BundleError::InvalidSelection(_) | BundleError::InvalidCode(_) | BundleError::Pricing(_) => StatusCode::UNPROCESSABLE_ENTITY,
        BundleError::Remote(RemoteError::NotFound(_)) => StatusCode::NOT_FOUND,
        BundleError::Remote(RemoteError::Rejected { status, .. }) if (400..500).contains(status) => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        BundleError::Remote(_) | BundleError::Metadata(_) | BundleError::InvalidBundle(_) => StatusCode::BAD_GATEWAY,
    };
    (status, err.to_string())
}

fn invalid(errors: validator::ValidationErrors) -> (StatusCode, String) {
    (StatusCode::UNPROCESSABLE_ENTITY, errors.to_string())
}

#[derive(Debug, Deserialize, Validate)]
pub struct SelectionItem {
    #[validate(length(min = 1))]
    pub slot_id: String,
    #[validate(length(min = 1))]
    pub variant_id: String,
    #[validate(range(min = 1))]
    pub quantity: u32,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct SelectionRequest {
    #[serde(default)]
    #[validate]
    pub items: Vec<SelectionItem>,
}

impl SelectionRequest {
    fn entries(self) -> Vec<SelectionEntry> {
        self.items.into_iter().map(|i| SelectionEntry::new(i.slot_id, i.variant_id, i.quantity)).collect()
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct PromoRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    #[validate(email)]
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct TotalsParams { pub session_amount: Option<i64> }

#[derive(Debug, Serialize)]
pub struct PricePreview { pub summary: SelectionSummary, pub price: Option<BundlePrice> }

#[derive(Debug, Serialize)]
pub struct TotalsResponse {
    #[serde(flatten)]
    pub totals: CartTotals,
    pub payment_session: Option<PaymentSessionStatus>,
}

async fn load_bundle(s: &AppState, id: &str) -> Result<BundleDefinition, (StatusCode, String)> {
    let by_id = s.catalog.bundle_by_id(&BundleId::from(id)).await.map_err(|e| error_response(e.into()))?;
    let bundle = match by_id {
        Some(bundle) => Some(bundle),
        None => s.catalog.bundle_by_handle(id).await.map_err(|e| error_response(e.into()))?,
    };
    bundle.ok_or_else(|| error_response(BundleError::BundleNotFound(id.to_string())))
}

async fn get_bundle(State(s): State<AppState>, Path(id): Path<String>) -> ApiResult<BundleDefinition> {
    load_bundle(&s, &id).await.map(Json)
}

async fn preview_price(State(s): State<AppState>, Path(id): Path<String>, Json(r): Json<SelectionRequest>) -> ApiResult<PricePreview> {
    r.validate().map_err(invalid)?;
    let bundle = load_bundle(&s, &id).await?;
    let entries = r.entries();
    let summary = check_selection(&bundle, &entries);
    let price = price_bundle(&bundle, &entries, &CatalogPrices).ok();
    Ok(Json(PricePreview { summary, price }))
}

async fn add_bundle(State(s): State<AppState>, Path((cart_id, bundle_id)): Path<(String, String)>, Json(r): Json<SelectionRequest>) -> ApiResult<SyncOutcome> {
    r.validate().map_err(invalid)?;
    s.engine.add_bundle_to_cart(&CartId::from(cart_id), &BundleId::from(bundle_id), r.entries()).await.map(Json).map_err(error_response)
}

async fn update_bundle(State(s): State<AppState>, Path((cart_id, bundle_id)): Path<(String, String)>, Json(r): Json<SelectionRequest>) -> ApiResult<SyncOutcome> {
    r.validate().map_err(invalid)?;
    s.engine.update_bundle_in_cart(&CartId::from(cart_id), &BundleId::from(bundle_id), r.entries()).await.map(Json).map_err(error_response)
}

async fn remove_bundle(State(s): State<AppState>, Path((cart_id, bundle_id)): Path<(String, String)>) -> ApiResult<SyncOutcome> {
    s.engine.remove_bundle_from_cart(&CartId::from(cart_id), &BundleId::from(bundle_id), None).await.map(Json).map_err(error_response)
}

async fn remove_bundle_item(State(s): State<AppState>, Path((cart_id, bundle_id, slot_id)): Path<(String, String, String)>) -> ApiResult<SyncOutcome> {
    let slot_id = SlotId::from(slot_id);
    s.engine
        .remove_bundle_from_cart(&CartId::from(cart_id), &BundleId::from(bundle_id), Some(&slot_id))
        .await
        .map(Json)
        .map_err(error_response)
}

async fn cart_totals(State(s): State<AppState>, Path(cart_id): Path<String>, Query(p): Query<TotalsParams>) -> ApiResult<TotalsResponse> {
    let totals = s.promos.totals(&CartId::from(cart_id)).await.map_err(error_response)?;
    let payment_session = p.session_amount.map(|recorded| check_payment_session(recorded, &totals));
    Ok(Json(TotalsResponse { totals, payment_session }))
}

async fn validate_promo(State(s): State<AppState>, Json(r): Json<PromoRequest>) -> ApiResult<PromoValidation> {
    r.validate().map_err(invalid)?;
    s.promos.validate(&r.code, &r.email).await.map(Json).map_err(error_response)
}

async fn apply_promo(State(s): State<AppState>, Path(cart_id): Path<String>, Json(r): Json<PromoRequest>) -> ApiResult<PromoAnnotation> {
    r.validate().map_err(invalid)?;
    let cart_id = CartId::from(cart_id);
    s.promos.apply(Some(&cart_id), &r.code, &r.email).await.map(Json).map_err(error_response)
}

async fn remove_promo(State(s): State<AppState>, Path(cart_id): Path<String>) -> Result<StatusCode, (StatusCode, String)> {
    let cart_id = CartId::from(cart_id);
    s.promos.remove(Some(&cart_id)).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}
