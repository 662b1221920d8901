//! # Authorization HTTP Server
//!
//! HTTP front for the appraisal authorization layer.
//!
//! ## Endpoints
//!
//! - `POST /v1/guard` - Evaluate the guard chain for a route
//! - `POST /v1/has-role` - Caller-bound role check
//! - `POST /v1/data` - Privileged data operation behind row policies
//! - `POST /v1/session/refresh` - Drop cached roles/entitlement for the caller
//! - `POST /v1/session/sign-out` - Tear down the caller's session
//! - `GET /health` - Health check
//! - `GET /metrics` - Prometheus metrics
//!
//! ## Configuration
//!
//! Environment variables:
//! - `PORT` - HTTP server port (default: 8080)
//! - `DATABASE_URL` - Postgres URL; in-memory stores when unset
//! - `JWT_SECRET` - HS256 secret for bearer tokens (required)
//! - `SESSION_CACHE_TTL` - Session cache TTL in seconds (default: 300)
//! - `SESSION_IDLE_TIMEOUT` - Seconds before an unused session is evicted (default: 1800)
//! - `PAYMENT_GATEWAYS` - In-memory gateways as `id` or `id:Name`, comma separated
//!   (default: none). The Postgres backend reads `payment_gateways` instead.
//! - `SIGN_IN_PATH`, `DEFAULT_AREA_PATH`, `PLANS_PATH` - Redirect targets
//! - `ROUTE_TABLE_PATH` - Optional JSON route table
//! - `RUST_LOG` - Log level (default: info)

use anyhow::Context;
use appraisal_authz::privilege::{DataOutcome, DataRequest, StorePrivilegeCheck};
use appraisal_authz::resolver::{
    EntitlementStore, InMemoryEntitlementStore, InMemoryRoleStore, RoleStore,
};
use appraisal_authz::{
    AccessEngine, AuthenticatedCaller, AuthzConfig, AuthzError, DataTier, GuardEvaluation,
    Principal, PrincipalId, PrivilegeCheck, SessionRegistry, SharedSession, TrustBoundary,
};
use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    serve, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Data tier the server routes `/v1/data` through
enum DataBackend {
    Memory(DataTier),
    #[cfg(feature = "postgres")]
    Postgres(appraisal_authz::privilege::PostgresDataTier),
}

impl DataBackend {
    async fn execute(
        &self,
        caller: &AuthenticatedCaller,
        request: DataRequest,
    ) -> appraisal_authz::Result<DataOutcome> {
        match self {
            DataBackend::Memory(tier) => tier.execute(caller, request).await,
            #[cfg(feature = "postgres")]
            DataBackend::Postgres(tier) => tier.execute(caller, request).await,
        }
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    engine: Arc<AccessEngine>,
    boundary: Arc<TrustBoundary>,
    privilege: Arc<dyn PrivilegeCheck>,
    data: Arc<DataBackend>,
    sessions: Arc<SessionRegistry>,
    start_time: std::time::Instant,
}

impl AppState {
    fn session_for(&self, caller: &AuthenticatedCaller) -> SharedSession {
        self.sessions.get_or_open(caller.principal_id(), || {
            self.engine.open_session(Some(caller.principal()))
        })
    }
}

/// Error response body
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

/// Application error type
#[derive(Debug)]
enum AppError {
    Unauthorized(String),
    Forbidden,
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", Some(msg)),
            // No detail: the caller learns only that the operation was refused
            AppError::Forbidden => (StatusCode::FORBIDDEN, "forbidden", None),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg)),
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", Some(msg))
            }
        };

        let body = Json(ErrorResponse {
            error: error.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<AuthzError> for AppError {
    fn from(err: AuthzError) -> Self {
        match err {
            AuthzError::InvalidToken(msg) => AppError::Unauthorized(msg),
            AuthzError::Forbidden => AppError::Forbidden,
            AuthzError::InvalidInput(msg) => AppError::BadRequest(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok())
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthenticatedCaller, AppError> {
    let header = bearer(headers)
        .ok_or_else(|| AppError::Unauthorized("missing bearer token".to_string()))?;
    Ok(state.boundary.verify_header(header)?)
}

#[derive(Debug, Deserialize)]
struct GuardRequest {
    route: String,
}

#[derive(Debug, Deserialize)]
struct HasRoleRequest {
    principal_id: PrincipalId,
    role: String,
}

#[derive(Debug, Serialize)]
struct HasRoleResponse {
    has_role: bool,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    principal_id: PrincipalId,
    generation: u64,
}

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    uptime_seconds: u64,
    active_sessions: usize,
    version: String,
}

/// Metrics response (Prometheus format)
struct MetricsResponse {
    metrics: String,
}

impl IntoResponse for MetricsResponse {
    fn into_response(self) -> Response {
        (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            self.metrics,
        )
            .into_response()
    }
}

/// POST /v1/guard - Evaluate a route's guard chain
///
/// Without a bearer token the request is evaluated as an anonymous visitor.
async fn guard_route(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<GuardRequest>,
) -> Result<Json<GuardEvaluation>, AppError> {
    let evaluation = if bearer(&headers).is_some() {
        let caller = authenticate(&state, &headers)?;
        let session = state.session_for(&caller);
        let mut session = session.lock().await;
        state.engine.guard_route(&mut session, &req.route).await
    } else {
        let mut session = state.engine.open_session(Some(Principal::anonymous()));
        state.engine.guard_route(&mut session, &req.route).await
    };

    info!("Guard {}: {:?}", req.route, evaluation.state);
    Ok(Json(evaluation))
}

/// POST /v1/has-role - Role check bound to the authenticated caller
async fn has_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<HasRoleRequest>,
) -> Result<Json<HasRoleResponse>, AppError> {
    let caller = authenticate(&state, &headers)?;
    let has_role = state
        .privilege
        .has_role(&caller, &req.principal_id, &req.role)
        .await?;
    Ok(Json(HasRoleResponse { has_role }))
}

/// POST /v1/data - Privileged data operation
async fn data_operation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DataRequest>,
) -> Result<Json<DataOutcome>, AppError> {
    let caller = authenticate(&state, &headers)?;
    let outcome = state.data.execute(&caller, req).await?;
    Ok(Json(outcome))
}

/// POST /v1/session/refresh - Force re-resolution on the next guard
async fn refresh_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SessionResponse>, AppError> {
    let caller = authenticate(&state, &headers)?;
    let session = state.session_for(&caller);
    let mut session = session.lock().await;
    session.refresh();

    Ok(Json(SessionResponse {
        principal_id: caller.principal_id().clone(),
        generation: session.generation(),
    }))
}

/// POST /v1/session/sign-out - Tear down the caller's session
async fn sign_out(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let caller = authenticate(&state, &headers)?;
    if let Some(session) = state.sessions.remove(caller.principal_id()) {
        let mut session = session.lock().await;
        session.sign_out();
        session.teardown();
    }
    info!("Signed out {}", caller.principal_id());
    Ok(StatusCode::NO_CONTENT)
}

/// GET /health - Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        active_sessions: state.sessions.len(),
        version: appraisal_authz::VERSION.to_string(),
    })
}

/// GET /metrics - Prometheus metrics endpoint
async fn metrics(State(state): State<AppState>) -> MetricsResponse {
    let metrics = format!(
        "# HELP authz_uptime_seconds Server uptime in seconds\n\
         # TYPE authz_uptime_seconds gauge\n\
         authz_uptime_seconds {}\n\
         # HELP authz_active_sessions Sessions held by the server\n\
         # TYPE authz_active_sessions gauge\n\
         authz_active_sessions {}\n\
         {}",
        state.start_time.elapsed().as_secs(),
        state.sessions.len(),
        state.engine.metrics().render_prometheus()
    );

    MetricsResponse { metrics }
}

/// Create the HTTP router with all endpoints
fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace = TraceLayer::new_for_http().on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/v1/guard", post(guard_route))
        .route("/v1/has-role", post(has_role))
        .route("/v1/data", post(data_operation))
        .route("/v1/session/refresh", post(refresh_session))
        .route("/v1/session/sign-out", post(sign_out))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(ServiceBuilder::new().layer(trace).layer(cors))
        .with_state(state)
}

/// Stores, privilege check, and data tier for the configured backend
async fn build_backend(
    config: &AuthzConfig,
) -> anyhow::Result<(
    Arc<dyn RoleStore>,
    Arc<dyn EntitlementStore>,
    Arc<dyn PrivilegeCheck>,
    DataBackend,
)> {
    #[cfg(feature = "postgres")]
    {
        if let Some(url) = &config.database_url {
            use appraisal_authz::privilege::{PostgresDataTier, PostgresPrivilegeCheck};
            use appraisal_authz::resolver::postgres::{connect, run_migrations};
            use appraisal_authz::resolver::{PostgresEntitlementStore, PostgresRoleStore};

            info!("Connecting to Postgres");
            let pool = connect(url).await.context("connecting to database")?;
            run_migrations(&pool).await.context("running migrations")?;

            return Ok((
                Arc::new(PostgresRoleStore::from_pool(pool.clone())),
                Arc::new(PostgresEntitlementStore::from_pool(pool.clone())),
                Arc::new(PostgresPrivilegeCheck::from_pool(pool.clone())),
                DataBackend::Postgres(PostgresDataTier::from_pool(pool)),
            ));
        }
    }

    #[cfg(not(feature = "postgres"))]
    {
        if config.database_url.is_some() {
            warn!("DATABASE_URL set but the postgres feature is disabled; using in-memory stores");
        }
    }

    warn!("Using in-memory stores; assignments are lost on restart");
    let roles: Arc<dyn RoleStore> = Arc::new(InMemoryRoleStore::new());
    let entitlements: Arc<dyn EntitlementStore> = Arc::new(InMemoryEntitlementStore::new());
    let check: Arc<dyn PrivilegeCheck> = Arc::new(StorePrivilegeCheck::new(roles.clone()));
    let tier = DataTier::new(check.clone(), roles.clone(), entitlements.clone());
    tier.seed_gateways(&config.payment_gateways).await;

    Ok((roles, entitlements, check, DataBackend::Memory(tier)))
}

/// Periodically evict sessions idle for longer than `idle`
fn spawn_session_sweeper(sessions: Arc<SessionRegistry>, idle: Duration) {
    let period = idle.min(Duration::from_secs(60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sessions.evict_idle(idle);
        }
    });
}

/// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }

    info!("Starting graceful shutdown");
}

/// Main server entrypoint
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Appraisal Authorization Server v{}", appraisal_authz::VERSION);

    let config = AuthzConfig::from_env().context("loading configuration")?;

    info!("Configuration:");
    info!("  Port: {}", config.port);
    info!("  Session TTL: {}s", config.session_ttl.as_secs());
    info!("  Session idle timeout: {}s", config.session_idle.as_secs());
    info!("  Persistent store: {}", config.database_url.is_some());
    info!(
        "  Redirects: sign-in={} default={} plans={}",
        config.redirects.sign_in, config.redirects.default_area, config.redirects.plan_selection
    );

    let routes = config.route_table().context("loading route table")?;
    let (roles, entitlements, privilege, data) = build_backend(&config).await?;

    let engine = AccessEngine::new(roles, entitlements, routes, config.engine_config());
    let data = match data {
        DataBackend::Memory(tier) => DataBackend::Memory(tier.with_metrics(engine.metrics().clone())),
        #[cfg(feature = "postgres")]
        DataBackend::Postgres(tier) => {
            DataBackend::Postgres(tier.with_metrics(engine.metrics().clone()))
        }
    };

    let state = AppState {
        engine: Arc::new(engine),
        boundary: Arc::new(TrustBoundary::new(config.jwt_secret.as_bytes())),
        privilege,
        data: Arc::new(data),
        sessions: Arc::new(SessionRegistry::new()),
        start_time: std::time::Instant::now(),
    };

    spawn_session_sweeper(state.sessions.clone(), config.session_idle);

    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Server shut down gracefully");
    Ok(())
}
