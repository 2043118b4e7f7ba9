//! # Admin REST API
//!
//! Builds the axum router for the roster server. All handlers share
//! application state through axum's `State` extractor and answer with the
//! `{ success, data?, error? }` envelope, except the export, which is raw
//! protobuf.
//!
//! ## Endpoints
//!
//! | Method | Path                 | Description                              |
//! |--------|----------------------|------------------------------------------|
//! | GET    | `/health`            | Liveness probe                           |
//! | GET    | `/api/public-key`    | Verifying key and algorithm names        |
//! | GET    | `/api/users`         | All users, newest first                  |
//! | GET    | `/api/users/stats`   | Signups per day, trailing week           |
//! | GET    | `/api/users/export`  | Protobuf `UserList`                      |
//! | GET    | `/api/users/:id`     | One user                                 |
//! | POST   | `/api/users`         | Create (signs the email)                 |
//! | PUT    | `/api/users/:id`     | Partial update (re-signs a new email)    |
//! | DELETE | `/api/users/:id`     | Delete                                   |

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use roster_integrity::config::{DEFAULT_STATS_DAYS, EXPORT_CONTENT_TYPE};
use roster_integrity::crypto::KeyStore;
use roster_integrity::export;
use roster_integrity::user::{NewUser, Role, Status, StoreError, UserStore, UserUpdate};

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state. Cheap to clone, everything is behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Reported server version.
    pub version: String,
    /// The deployment keypair.
    pub keys: Arc<KeyStore>,
    /// Signing user store.
    pub users: Arc<UserStore>,
    pub metrics: SharedMetrics,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/public-key", get(public_key_handler))
        .route("/api/users", get(list_users_handler).post(create_user_handler))
        .route("/api/users/stats", get(stats_handler))
        .route("/api/users/export", get(export_handler))
        .route(
            "/api/users/:id",
            get(get_user_handler)
                .put(update_user_handler)
                .delete(delete_user_handler),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Envelope & Errors
// ---------------------------------------------------------------------------

/// The JSON envelope every non-export endpoint answers with.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

const INVALID_USER_ID: &str = "Invalid user ID";
const USER_NOT_FOUND: &str = "User not found";
const MISSING_REQUIRED_FIELDS: &str = "Missing required fields: email, role, status";
const INVALID_ROLE: &str = "Invalid role. Must be: admin, user, or guest";
const INVALID_STATUS: &str = "Invalid status. Must be: active or inactive";

/// A failed request, rendered as an error envelope.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound,
    Conflict(String),
    Internal(&'static str),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound => (StatusCode::NOT_FOUND, USER_NOT_FOUND.to_string()),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m.to_string()),
        };
        (status, Json(ApiResponse::failure(message))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// Maps a store failure to a response. `context` is the message used for
/// anything that is not the caller's fault.
fn store_error(e: StoreError, context: &'static str) -> ApiError {
    match e {
        StoreError::NotFound(_) => ApiError::NotFound,
        StoreError::DuplicateEmail => ApiError::Conflict("Email already exists".to_string()),
        StoreError::InvalidEmail => ApiError::BadRequest("Invalid email format".to_string()),
        other => {
            tracing::error!(error = %other, "{}", context);
            ApiError::Internal(context)
        }
    }
}

fn parse_id(raw: &str) -> Result<u64, ApiError> {
    raw.parse::<u64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| ApiError::BadRequest(INVALID_USER_ID.to_string()))
}

// ---------------------------------------------------------------------------
// Request Types
// ---------------------------------------------------------------------------

/// Body of `POST /api/users`. Fields are optional here so that a missing
/// field gets the API's own message rather than a serde error.
#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: Option<String>,
    pub role: Option<String>,
    pub status: Option<String>,
}

impl CreateUserRequest {
    fn validate(self) -> Result<NewUser, ApiError> {
        let (Some(email), Some(role), Some(status)) = (self.email, self.role, self.status) else {
            return Err(ApiError::BadRequest(MISSING_REQUIRED_FIELDS.to_string()));
        };
        if email.is_empty() || role.is_empty() || status.is_empty() {
            return Err(ApiError::BadRequest(MISSING_REQUIRED_FIELDS.to_string()));
        }
        Ok(NewUser {
            email,
            role: parse_role(&role)?,
            status: parse_status(&status)?,
        })
    }
}

/// Body of `PUT /api/users/:id`.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub role: Option<String>,
    pub status: Option<String>,
}

impl UpdateUserRequest {
    fn validate(self) -> Result<UserUpdate, ApiError> {
        Ok(UserUpdate {
            email: self.email,
            role: self.role.as_deref().map(parse_role).transpose()?,
            status: self.status.as_deref().map(parse_status).transpose()?,
        })
    }
}

fn parse_role(s: &str) -> Result<Role, ApiError> {
    s.parse()
        .map_err(|_| ApiError::BadRequest(INVALID_ROLE.to_string()))
}

fn parse_status(s: &str) -> Result<Status, ApiError> {
    s.parse()
        .map_err(|_| ApiError::BadRequest(INVALID_STATUS.to_string()))
}

/// Payload of `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` — liveness only.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::ok(HealthResponse {
        status: "ok".to_string(),
        version: state.version.clone(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    }))
}

/// `GET /api/public-key` — the only channel through which consumers learn
/// the verifying key.
async fn public_key_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let info = state.keys.public_key_info().map_err(|e| {
        tracing::error!(error = %e, "public key unavailable");
        ApiError::Internal("Failed to retrieve public key")
    })?;
    Ok(Json(ApiResponse::ok(info)))
}

async fn list_users_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let users = state
        .users
        .list()
        .map_err(|e| store_error(e, "Failed to fetch users"))?;
    Ok(Json(ApiResponse::ok(users)))
}

async fn get_user_handler(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&raw_id)?;
    let user = state
        .users
        .get(id)
        .map_err(|e| store_error(e, "Failed to fetch user"))?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(ApiResponse::ok(user)))
}

async fn create_user_handler(
    State(state): State<AppState>,
    body: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body?;
    let new_user = request.validate()?;

    let user = state
        .users
        .create(new_user)
        .map_err(|e| store_error(e, "Failed to create user"))?;

    state.metrics.signatures_issued_total.inc();
    state.metrics.users_total.set(state.users.count() as i64);
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(user))))
}

async fn update_user_handler(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    body: Result<Json<UpdateUserRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&raw_id)?;
    let Json(request) = body?;
    let update = request.validate()?;
    let resigns = update.email.is_some();

    let user = state
        .users
        .update(id, update)
        .map_err(|e| store_error(e, "Failed to update user"))?;

    if resigns {
        state.metrics.signatures_issued_total.inc();
    }
    Ok(Json(ApiResponse::ok(user)))
}

async fn delete_user_handler(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&raw_id)?;
    state
        .users
        .delete(id)
        .map_err(|e| store_error(e, "Failed to delete user"))?;

    state.metrics.users_total.set(state.users.count() as i64);
    Ok(Json(ApiResponse::ok(serde_json::json!({ "id": id }))))
}

/// `GET /api/users/stats` — signups per day for the trailing week.
async fn stats_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let today = chrono::Utc::now().date_naive();
    let counts = state
        .users
        .daily_counts(DEFAULT_STATS_DAYS, today)
        .map_err(|e| store_error(e, "Failed to fetch statistics"))?;
    Ok(Json(ApiResponse::ok(counts)))
}

/// `GET /api/users/export` — the whole roster as a protobuf `UserList`.
async fn export_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let users = state
        .users
        .list()
        .map_err(|e| store_error(e, "Failed to export users"))?;
    let bytes = export::encode(&users).map_err(|e| {
        tracing::error!(error = %e, "export encoding failed");
        ApiError::Internal("Failed to export users")
    })?;

    state.metrics.exports_total.inc();
    state.metrics.exported_records.set(users.len() as i64);
    state.metrics.export_size_bytes.observe(bytes.len() as f64);
    tracing::info!(records = users.len(), bytes = bytes.len(), "roster exported");

    Ok(([(header::CONTENT_TYPE, EXPORT_CONTENT_TYPE)], bytes))
}
