use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::error;

use kds_common::{
    Action, CartItem, FeedCursor, OrderStatus, RetentionPolicy, Role, Station, TicketStatus,
};

use super::db::{DbHandle, FeedOrder, NewOrder, TicketQuery};
#[cfg(test)]
use super::db::KitchenDb;
use crate::errors::KdsError;

/// Header carrying the caller's role, set by the auth collaborator in front of us.
pub const ROLE_HEADER: &str = "x-staff-role";

pub const MAX_FEED_LIMIT: u32 = 500;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub retention: RetentionPolicy,
    pub default_feed_limit: u32,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateCategoryRequest {
    pub title: String,
    pub station: String,
}

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub cart: Vec<CartItem>,
    pub table_label: Option<String>,
    pub delivery_address: Option<String>,
}

#[derive(Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

#[derive(Deserialize)]
pub struct PriorityRequest {
    pub priority: i32,
}

#[derive(Deserialize, Default)]
pub struct TicketListParams {
    pub station: Option<String>,
    /// Comma-separated ticket statuses.
    pub status: Option<String>,
    pub limit: Option<u32>,
    /// RFC 3339. Only tickets changed after this instant, oldest change first.
    pub updated_after: Option<String>,
    /// Resumes a page cut short at `updated_after`: tickets changed at exactly
    /// that instant are returned only when their id is greater.
    pub after_id: Option<i64>,
    /// `board` (default) or `changes`.
    pub order: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl From<KdsError> for ApiError {
    fn from(err: KdsError) -> Self {
        let message = err.to_string();
        match err {
            KdsError::Unauthenticated => ApiError::Unauthorized(message),
            KdsError::Forbidden { .. } => ApiError::Forbidden(message),
            KdsError::OrderNotFound { .. }
            | KdsError::TicketNotFound { .. }
            | KdsError::TicketItemNotFound { .. } => ApiError::NotFound(message),
            KdsError::BadRequest(_) => ApiError::BadRequest(message),
            KdsError::InvalidTransition(_) => ApiError::Conflict(message),
            KdsError::Contention { .. } => ApiError::Unavailable(message),
            KdsError::InvariantViolation(_) | KdsError::Database(_) | KdsError::Internal(_) => {
                error!(error = %message, "request failed");
                ApiError::Internal(message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        let retryable = status == StatusCode::SERVICE_UNAVAILABLE;
        (
            status,
            Json(serde_json::json!({"error": message, "retryable": retryable})),
        )
            .into_response()
    }
}

// ── Role extraction ───────────────────────────────────────────────────

/// The caller's role, read from [`ROLE_HEADER`]. Missing or unknown roles
/// are rejected with 401 before the handler runs.
pub struct StaffRole(pub Role);

impl StaffRole {
    fn require(&self, action: Action) -> Result<(), ApiError> {
        KdsError::require(self.0, action).map_err(ApiError::from)
    }
}

impl<S> FromRequestParts<S> for StaffRole
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::from(KdsError::Unauthenticated))?;
        Role::from_str(raw.trim())
            .map(StaffRole)
            .map_err(|_| ApiError::from(KdsError::Unauthenticated))
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/categories", get(list_categories).post(create_category))
        .route("/api/orders", post(create_order))
        .route("/api/orders/{id}", get(get_order))
        .route("/api/orders/{id}/status", post(set_order_status))
        .route("/api/tickets", get(list_tickets))
        .route("/api/tickets/{id}", get(get_ticket))
        .route("/api/tickets/{id}/bump", post(bump_ticket))
        .route("/api/tickets/{id}/recall", post(recall_ticket))
        .route("/api/tickets/{id}/priority", post(set_priority))
        .route("/api/ticket-items/{id}/toggle", post(toggle_item))
        .route("/api/ticket-items/{id}/cancel", post(cancel_item))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Build a store query from the feed's query string. Station displays may
/// omit `station` and get their own.
fn ticket_query(
    params: TicketListParams,
    role: Role,
    default_limit: u32,
) -> Result<TicketQuery, ApiError> {
    let station = match (params.station.as_deref(), role) {
        (Some(s), _) => Station::from_str(s).map_err(ApiError::BadRequest)?,
        (None, Role::Kitchen) => Station::Kitchen,
        (None, Role::Bar) => Station::Bar,
        (None, _) => {
            return Err(ApiError::BadRequest(
                "Query parameter 'station' is required".into(),
            ));
        }
    };

    let statuses = match params.status.as_deref() {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(TicketStatus::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map_err(ApiError::BadRequest)?,
        None => Vec::new(),
    };

    let updated_after = params
        .updated_after
        .as_deref()
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| ApiError::BadRequest(format!("Invalid updated_after '{}': {}", raw, e)))
        })
        .transpose()?;

    let after = match (updated_after, params.after_id) {
        (Some(changed_at), after_id) => Some(FeedCursor {
            changed_at,
            ticket_id: after_id.unwrap_or(i64::MAX),
        }),
        (None, Some(_)) => {
            return Err(ApiError::BadRequest(
                "Query parameter 'after_id' needs 'updated_after'".into(),
            ));
        }
        (None, None) => None,
    };

    let order = params
        .order
        .as_deref()
        .map(FeedOrder::from_str)
        .transpose()
        .map_err(ApiError::BadRequest)?
        .unwrap_or_default();

    Ok(TicketQuery {
        station,
        statuses,
        limit: params.limit.unwrap_or(default_limit).clamp(1, MAX_FEED_LIMIT),
        after,
        order,
    })
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_categories(
    State(state): State<SharedState>,
    role: StaffRole,
) -> Result<impl IntoResponse, ApiError> {
    role.require(Action::ReadTickets)?;
    let categories = state.db.call(|db| db.list_categories()).await?;
    Ok(Json(categories))
}

async fn create_category(
    State(state): State<SharedState>,
    role: StaffRole,
    Json(req): Json<CreateCategoryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    role.require(Action::ManageCategories)?;
    let station = Station::from_str(&req.station).map_err(ApiError::BadRequest)?;
    let title = req.title;
    let category = state
        .db
        .call(move |db| db.create_category(&title, station))
        .await?;
    Ok((StatusCode::CREATED, Json(category)))
}

async fn create_order(
    State(state): State<SharedState>,
    role: StaffRole,
    Json(req): Json<CreateOrderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    role.require(Action::PlaceOrder)?;
    let order = NewOrder {
        cart: req.cart,
        table_label: req.table_label,
        delivery_address: req.delivery_address,
    };
    let detail = state.db.call(move |db| db.create_order(&order)).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn get_order(
    State(state): State<SharedState>,
    role: StaffRole,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    role.require(Action::ReadTickets)?;
    let detail = state.db.call(move |db| db.get_order_detail(id)).await?;
    match detail {
        Some(detail) => Ok(Json(detail)),
        None => Err(KdsError::OrderNotFound { id }.into()),
    }
}

async fn set_order_status(
    State(state): State<SharedState>,
    role: StaffRole,
    Path(id): Path<i64>,
    Json(req): Json<StatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    role.require(Action::UpdateOrderStatus)?;
    let status = OrderStatus::from_str(&req.status).map_err(ApiError::BadRequest)?;
    let detail = state
        .db
        .call(move |db| db.set_order_status(id, status))
        .await?;
    Ok(Json(detail))
}

async fn list_tickets(
    State(state): State<SharedState>,
    role: StaffRole,
    Query(params): Query<TicketListParams>,
) -> Result<impl IntoResponse, ApiError> {
    role.require(Action::ReadTickets)?;
    let query = ticket_query(params, role.0, state.default_feed_limit)?;
    let retention = state.retention;
    let tickets = state
        .db
        .call(move |db| db.list_station_tickets(&query, &retention, Utc::now()))
        .await?;
    Ok(Json(tickets))
}

async fn get_ticket(
    State(state): State<SharedState>,
    role: StaffRole,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    role.require(Action::ReadTickets)?;
    let view = state.db.call(move |db| db.get_ticket_view(id)).await?;
    match view {
        Some(view) => Ok(Json(view)),
        None => Err(KdsError::TicketNotFound { id }.into()),
    }
}

async fn bump_ticket(
    State(state): State<SharedState>,
    role: StaffRole,
    Path(id): Path<i64>,
    Json(req): Json<StatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    role.require(Action::WorkTickets)?;
    let target = TicketStatus::from_str(&req.status).map_err(ApiError::BadRequest)?;
    let view = state.db.call(move |db| db.bump_ticket(id, target)).await?;
    Ok(Json(view))
}

async fn recall_ticket(
    State(state): State<SharedState>,
    role: StaffRole,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    role.require(Action::WorkTickets)?;
    let view = state.db.call(move |db| db.recall_ticket(id)).await?;
    Ok(Json(view))
}

async fn set_priority(
    State(state): State<SharedState>,
    role: StaffRole,
    Path(id): Path<i64>,
    Json(req): Json<PriorityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    role.require(Action::SetPriority)?;
    let priority = req.priority;
    let view = state
        .db
        .call(move |db| db.set_ticket_priority(id, priority))
        .await?;
    Ok(Json(view))
}

async fn toggle_item(
    State(state): State<SharedState>,
    role: StaffRole,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    role.require(Action::WorkTickets)?;
    let view = state.db.call(move |db| db.toggle_item(id)).await?;
    Ok(Json(view))
}

async fn cancel_item(
    State(state): State<SharedState>,
    role: StaffRole,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    role.require(Action::CancelItem)?;
    let view = state.db.call(move |db| db.cancel_item(id)).await?;
    Ok(Json(view))
}
