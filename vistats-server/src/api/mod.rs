//! HTTP API endpoints

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use vistats_core::analytics::{BucketSums, PageviewData, QueryInput, SessionData, Statistics};
use vistats_core::storage::{
    ClientInfo, CreatePageviewInput, CreateSessionInput, EngineStats, ShardInfo, StorageEngine,
};
use vistats_core::{AuthToken, Collection, Timestamp, User, VistatsError};

/// Application state
pub type AppState = Arc<StorageEngine>;

type ApiResult<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

/// Create the API router
pub fn create_router(engine: Arc<StorageEngine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health))
        .route("/ping", get(ping))

        // Tracking
        .route("/sessions", post(create_session))
        .route("/sessions/update", post(update_session))
        .route("/pageviews", post(create_pageview))

        // Users and tokens
        .route("/users", post(create_user))
        .route("/users/:id", get(get_user).delete(delete_user))
        .route("/users/:id/collections", get(user_collections))
        .route("/users/:id/tokens", post(create_token))
        .route("/tokens/:id", get(get_token).delete(delete_token))

        // Collections
        .route("/collections", post(create_collection))
        .route("/collections/:id", get(get_collection).delete(delete_collection))
        .route("/collections/:id/teammates", post(add_teammate))
        .route("/collections/:id/teammates/:user_id", delete(remove_teammate))
        .route("/collections/:id/shards", get(list_shards))
        .route("/collections/:id/shards/:shard_id", delete(delete_shard))
        .route("/collections/:id/seed", post(seed))

        // Queries
        .route("/collections/:id/data/sums", post(bucket_sums))
        .route("/collections/:id/data/stats", post(statistics))
        .route("/collections/:id/data/sessions", post(sessions))
        .route("/collections/:id/data/pageviews", post(pageviews))

        // Stats
        .route("/stats", get(stats))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionKeyResponse {
    pub session_key: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSessionRequest {
    pub collection_id: String,
    pub session_key: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionKeyRequest {
    pub session_key: String,
}

/// A user without the password hash
#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: u64,
    pub email: String,
    pub name: String,
    pub created: Timestamp,
    pub is_admin: bool,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            name: user.name,
            created: user.created,
            is_admin: user.is_admin,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateCollectionRequest {
    pub owner_id: u64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct TeammateRequest {
    pub user_id: u64,
}

#[derive(Debug, Deserialize)]
pub struct SeedRequest {
    pub from: Timestamp,
    pub to: Timestamp,
    pub n: usize,
}

#[derive(Debug, Serialize)]
pub struct SeedResponse {
    pub sessions: usize,
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    #[serde(default)]
    pub with_shared: bool,
}

// ============================================================================
// Error mapping
// ============================================================================

fn status_of(e: &VistatsError) -> StatusCode {
    if e.is_not_found() {
        StatusCode::NOT_FOUND
    } else if e.is_conflict() {
        StatusCode::CONFLICT
    } else if matches!(e, VistatsError::InvalidInput(_) | VistatsError::InvalidKey(_)) {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn api_error(e: VistatsError) -> (StatusCode, Json<ErrorResponse>) {
    let status = status_of(&e);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("Request failed: {}", e);
    }
    (status, Json(ErrorResponse { error: e.to_string() }))
}

/// Client attributes taken from request headers
fn client_info(headers: &HeaderMap) -> ClientInfo {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };
    let forwarded = header("x-forwarded-for");
    let user_ip = match forwarded.split(',').next() {
        Some(ip) if !ip.trim().is_empty() => ip.trim().to_string(),
        _ => header("x-real-ip"),
    };
    ClientInfo {
        user_agent: header("user-agent"),
        user_ip,
        country_code: header("cf-ipcountry"),
        ..Default::default()
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: vistats_core::VERSION.to_string(),
    })
}

async fn ping() -> &'static str {
    "pong"
}

async fn create_session(
    State(engine): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreateSessionInput>,
) -> ApiResult<Json<SessionKeyResponse>> {
    let session_key = engine
        .create_session(&client_info(&headers), &input)
        .map_err(api_error)?;
    Ok(Json(SessionKeyResponse { session_key }))
}

async fn update_session(
    State(engine): State<AppState>,
    Json(req): Json<UpdateSessionRequest>,
) -> ApiResult<StatusCode> {
    engine
        .update_session(&req.collection_id, &req.session_key)
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_pageview(
    State(engine): State<AppState>,
    Json(input): Json<CreatePageviewInput>,
) -> ApiResult<StatusCode> {
    engine.create_pageview(&input).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_user(
    State(engine): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> ApiResult<(StatusCode, Json<UserResponse>)> {
    if req.email.trim().is_empty() {
        return Err(api_error(VistatsError::InvalidInput("email is empty".into())));
    }
    let mut user = User {
        email: req.email,
        name: req.name,
        password: req.password,
        ..Default::default()
    };
    engine.insert_user(&mut user).map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(user.into())))
}

async fn get_user(
    State(engine): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Json<UserResponse>> {
    engine
        .get_user(id)
        .map(|u| Json(u.into()))
        .map_err(api_error)
}

async fn delete_user(State(engine): State<AppState>, Path(id): Path<u64>) -> ApiResult<StatusCode> {
    engine.delete_user(id).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn user_collections(
    State(engine): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<UserQuery>,
) -> ApiResult<Json<Vec<Collection>>> {
    let mut collections = engine.collections_by_owner(id).map_err(api_error)?;
    if !query.with_shared {
        collections.retain(|c| c.owner_id == id);
    }
    Ok(Json(collections))
}

async fn create_token(
    State(engine): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<(StatusCode, Json<AuthToken>)> {
    engine.get_user(id).map_err(api_error)?;
    let token = engine.insert_auth_token(id).map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(token)))
}

async fn get_token(State(engine): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<AuthToken>> {
    engine.get_auth_token(&id).map(Json).map_err(api_error)
}

async fn delete_token(State(engine): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    engine.delete_auth_token(&id).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_collection(
    State(engine): State<AppState>,
    Json(req): Json<CreateCollectionRequest>,
) -> ApiResult<(StatusCode, Json<Collection>)> {
    engine.get_user(req.owner_id).map_err(api_error)?;
    let collection = engine
        .create_collection(req.owner_id, &req.name)
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(collection)))
}

async fn get_collection(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Collection>> {
    engine.get_collection(&id).map(Json).map_err(api_error)
}

async fn delete_collection(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    engine.delete_collection(&id).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_teammate(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TeammateRequest>,
) -> ApiResult<Json<Collection>> {
    engine.add_teammate(&id, req.user_id).map(Json).map_err(api_error)
}

async fn remove_teammate(
    State(engine): State<AppState>,
    Path((id, user_id)): Path<(String, u64)>,
) -> ApiResult<Json<Collection>> {
    engine.remove_teammate(&id, user_id).map(Json).map_err(api_error)
}

async fn list_shards(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ShardInfo>>> {
    engine.collection_shards(&id).map(Json).map_err(api_error)
}

async fn delete_shard(
    State(engine): State<AppState>,
    Path((id, shard_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    engine
        .delete_collection_shard(&id, &shard_id)
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn seed(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SeedRequest>,
) -> ApiResult<Json<SeedResponse>> {
    // one large blocking transaction
    let sessions = tokio::task::spawn_blocking(move || engine.seed(&id, req.from, req.to, req.n))
        .await
        .map_err(|e| api_error(VistatsError::Internal(e.to_string())))?
        .map_err(api_error)?;
    Ok(Json(SeedResponse { sessions }))
}

async fn bucket_sums(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<QueryInput>,
) -> ApiResult<Json<BucketSums>> {
    engine.get_bucket_sums(&id, &input).map(Json).map_err(api_error)
}

async fn statistics(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<QueryInput>,
) -> ApiResult<Json<Statistics>> {
    engine.get_statistics(&id, &input).map(Json).map_err(api_error)
}

async fn sessions(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<QueryInput>,
) -> ApiResult<Json<Vec<SessionData>>> {
    engine.get_sessions(&id, &input).map(Json).map_err(api_error)
}

async fn pageviews(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SessionKeyRequest>,
) -> ApiResult<Json<Vec<PageviewData>>> {
    engine
        .get_pageviews(&id, &req.session_key)
        .map(Json)
        .map_err(api_error)
}

async fn stats(State(engine): State<AppState>) -> ApiResult<Json<EngineStats>> {
    engine.stats().map(Json).map_err(api_error)
}
