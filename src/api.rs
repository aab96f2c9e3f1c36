//! HTTP adapter over the cart core.
//!
//! Callers identify the cart with `key` (anonymous code), `buyer_id` and
//! `kind` query parameters. When both `key` and `buyer_id` are present the
//! anonymous cart is merged into the buyer's first.

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;
use validator::Validate;

use crate::checkout::{CartView, CheckoutBuilder};
use crate::domain::aggregates::{Cart, SettleData};
use crate::domain::value_objects::{parse_checked_map, CartKind, CartOwner, CheckedMap, ItemPair};
use crate::repository::CartRepository;
use crate::CartError;

#[derive(Clone)]
pub struct AppState {
    pub carts: CartRepository,
    pub checkout: CheckoutBuilder,
    pub nats: Option<async_nats::Client>,
    pub events_subject: String,
}

#[derive(Debug)]
pub enum ApiError {
    Cart(CartError),
    Invalid(String),
}

impl From<CartError> for ApiError { fn from(e: CartError) -> Self { Self::Cart(e) } }
impl From<validator::ValidationErrors> for ApiError { fn from(e: validator::ValidationErrors) -> Self { Self::Invalid(e.to_string()) } }

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::Invalid(message) => (StatusCode::BAD_REQUEST, "invalid_request", message),
            Self::Cart(e) => {
                let status = match &e {
                    CartError::CartNotFound | CartError::ItemNotFound { .. } => StatusCode::NOT_FOUND,
                    CartError::Conflict(_) => StatusCode::CONFLICT,
                    e if e.is_validation() => StatusCode::UNPROCESSABLE_ENTITY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() { tracing::error!(error = %e, "cart request failed"); }
                (status, e.code(), e.to_string())
            }
        };
        (status, Json(serde_json::json!({"error": code, "message": message}))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct CartQuery {
    pub key: Option<String>,
    pub buyer_id: Option<i64>,
    #[serde(default)]
    pub kind: CartKind,
}

#[derive(Debug, Deserialize, Validate)]
pub struct PutRequest {
    pub item_id: i64,
    #[serde(default)]
    pub sku_id: i64,
    #[validate(range(min = 1, max = 9999))]
    pub quantity: u32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateRequest {
    pub item_id: i64,
    #[serde(default)]
    pub sku_id: i64,
    #[validate(range(max = 9999))]
    pub quantity: u32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SettleRequest {
    #[validate(range(min = 1))]
    pub shop_id: i64,
    pub payment_opt: i32,
    pub deliver_opt: i32,
    #[serde(default)]
    pub address_id: i64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddressRequest {
    #[validate(range(min = 1))]
    pub address_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct QuickParams { pub max: Option<usize> }

#[derive(Debug, Serialize)]
pub struct ReleaseResponse { pub consumed: bool }

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(serde_json::json!({"status": "healthy", "service": "opensase-cart"})) }))
        .route("/api/v1/cart", get(get_cart))
        .route("/api/v1/cart/quick", get(quick_cart))
        .route("/api/v1/cart/items", post(put_item).put(update_item).delete(remove_item))
        .route("/api/v1/cart/checked", post(sign_checked))
        .route("/api/v1/cart/check", post(check_cart))
        .route("/api/v1/cart/release", post(release_cart))
        .route("/api/v1/cart/address", put(set_address))
        .route("/api/v1/cart/settle", get(get_settle).post(settle))
        .layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive()).with_state(state)
}

async fn resolve(s: &AppState, q: &CartQuery) -> ApiResult<Cart> {
    let key = q.key.as_deref().filter(|k| !k.is_empty());
    let cart = match (q.buyer_id, key) {
        (Some(buyer_id), Some(key)) => s.carts.merge_on_login(key, buyer_id, q.kind).await?,
        (Some(buyer_id), None) => s.carts.get_my_cart(buyer_id, q.kind).await?,
        (None, Some(key)) => s.carts.resolve(&CartOwner::Anonymous(key.to_string()), q.kind).await?,
        (None, None) => s.carts.new_anonymous_cart(q.kind),
    };
    Ok(cart)
}

/// Publishes pending domain events; delivery failures are logged, not returned.
async fn publish(s: &AppState, cart: &mut Cart) {
    let events = cart.take_events();
    let Some(nats) = &s.nats else { return };
    for event in events {
        match serde_json::to_vec(&event) {
            Ok(payload) => {
                if let Err(e) = nats.publish(s.events_subject.clone(), payload.into()).await {
                    warn!(error = %e, "failed to publish cart event");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode cart event"),
        }
    }
}

async fn save_and_view(s: &AppState, cart: &mut Cart) -> ApiResult<Json<CartView>> {
    cart.save().await?;
    publish(s, cart).await;
    Ok(Json(s.checkout.view(cart).await?))
}

async fn get_cart(State(s): State<AppState>, Query(q): Query<CartQuery>) -> ApiResult<Json<CartView>> {
    let mut cart = resolve(&s, &q).await?;
    publish(&s, &mut cart).await;
    Ok(Json(s.checkout.view(&cart).await?))
}

async fn quick_cart(State(s): State<AppState>, Query(q): Query<CartQuery>, Query(p): Query<QuickParams>) -> ApiResult<Response> {
    let cart = resolve(&s, &q).await?;
    let body = s.checkout.quick_view(&cart, p.max.unwrap_or(5)).await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

async fn put_item(State(s): State<AppState>, Query(q): Query<CartQuery>, Json(r): Json<PutRequest>) -> ApiResult<Json<CartView>> {
    r.validate()?;
    let mut cart = resolve(&s, &q).await?;
    cart.put(r.item_id, r.sku_id, r.quantity).await?;
    save_and_view(&s, &mut cart).await
}

async fn update_item(State(s): State<AppState>, Query(q): Query<CartQuery>, Json(r): Json<UpdateRequest>) -> ApiResult<Json<CartView>> {
    r.validate()?;
    let mut cart = resolve(&s, &q).await?;
    cart.update(r.item_id, r.sku_id, r.quantity)?;
    save_and_view(&s, &mut cart).await
}

async fn remove_item(State(s): State<AppState>, Query(q): Query<CartQuery>, Json(r): Json<PutRequest>) -> ApiResult<Json<CartView>> {
    r.validate()?;
    let mut cart = resolve(&s, &q).await?;
    cart.remove(r.item_id, r.sku_id, r.quantity);
    save_and_view(&s, &mut cart).await
}

async fn sign_checked(State(s): State<AppState>, Query(q): Query<CartQuery>, Json(pairs): Json<Vec<ItemPair>>) -> ApiResult<Json<CartView>> {
    let mut cart = resolve(&s, &q).await?;
    cart.sign_item_checked(&pairs);
    save_and_view(&s, &mut cart).await
}

async fn check_cart(State(s): State<AppState>, Query(q): Query<CartQuery>) -> ApiResult<StatusCode> {
    resolve(&s, &q).await?.check()?;
    Ok(StatusCode::NO_CONTENT)
}

/// Body is a checked map such as `{"1":["10","11"]}`.
async fn release_cart(State(s): State<AppState>, Query(q): Query<CartQuery>, body: String) -> ApiResult<Json<ReleaseResponse>> {
    let trimmed = body.trim();
    let checked = if trimmed.is_empty() || trimmed == "{}" {
        CheckedMap::new()
    } else {
        parse_checked_map(trimmed).ok_or_else(|| ApiError::Invalid("malformed checked map".into()))?
    };
    let mut cart = resolve(&s, &q).await?;
    let consumed = cart.release(&checked);
    if consumed { cart.destroy().await?; } else { cart.save().await?; }
    publish(&s, &mut cart).await;
    Ok(Json(ReleaseResponse { consumed }))
}

async fn set_address(State(s): State<AppState>, Query(q): Query<CartQuery>, Json(r): Json<AddressRequest>) -> ApiResult<StatusCode> {
    r.validate()?;
    let mut cart = resolve(&s, &q).await?;
    cart.set_buyer_address(r.address_id).await?;
    publish(&s, &mut cart).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn settle(State(s): State<AppState>, Query(q): Query<CartQuery>, Json(r): Json<SettleRequest>) -> ApiResult<Json<SettleData>> {
    r.validate()?;
    let mut cart = resolve(&s, &q).await?;
    cart.settle_persist(r.shop_id, r.payment_opt, r.deliver_opt, r.address_id).await?;
    publish(&s, &mut cart).await;
    Ok(Json(cart.get_settle_data().await?))
}

async fn get_settle(State(s): State<AppState>, Query(q): Query<CartQuery>) -> ApiResult<Json<SettleData>> {
    let cart = resolve(&s, &q).await?;
    Ok(Json(cart.get_settle_data().await?))
}
