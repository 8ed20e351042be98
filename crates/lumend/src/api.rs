use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::engine::Engine;
use crate::engine::EngineError;
use crate::engine::StateReport;
use crate::fixture::Command;
use crate::presence::PresenceUpdate;
use crate::routine::RoutineError;
use crate::routine::RoutineOverride;
use crate::state::DeviceState;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
    devices: usize,
}

/// Response for command endpoints
#[derive(Serialize)]
struct CommandResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    targets: Option<Vec<String>>,
}

impl CommandResponse {
    fn ok(targets: Vec<String>) -> Json<Self> {
        Json(Self {
            ok: true,
            targets: Some(targets),
        })
    }
}

/// Response for POST /api/scan
#[derive(Serialize)]
struct ScanResponse {
    ok: bool,
    count: usize,
    names: Vec<String>,
}

/// A single device is reported as `{name: state}`, a group as its aggregate
#[derive(Serialize)]
#[serde(untagged)]
enum StateResponse {
    Device(BTreeMap<String, DeviceState>),
    Group(StateReport),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Handler failure, rendered as `{"error": "..."}`
enum ApiError {
    Engine(EngineError),
    BadRequest(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Engine(e) => {
                let status = match &e {
                    EngineError::UnknownTarget(_)
                    | EngineError::UnknownScene(_)
                    | EngineError::Routine(RoutineError::UnknownRoutine(_))
                    | EngineError::Routine(RoutineError::UnknownTarget(_)) => StatusCode::NOT_FOUND,
                    EngineError::Routine(RoutineError::Busy { .. }) => StatusCode::CONFLICT,
                    EngineError::Routine(RoutineError::Store(_)) | EngineError::Store(_) => {
                        tracing::error!("Request failed: {}", e);
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.to_string())
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Shared application state
#[derive(Clone)]
struct AppState {
    version: &'static str,
    engine: Arc<Engine>,
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<AppState>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
            devices: state.engine.registry().len(),
        }),
    )
}

#[tracing::instrument(skip(state))]
async fn bulbs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.registry().as_ref().clone())
}

#[tracing::instrument(skip(state))]
async fn groups(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.groups().clone())
}

#[tracing::instrument(skip(state))]
async fn scan(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let registry = state.engine.reconcile_now().await?;
    Ok(Json(ScanResponse {
        ok: true,
        count: registry.len(),
        names: registry.keys().cloned().collect(),
    }))
}

#[tracing::instrument(skip(state))]
async fn all_states(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.all_states().await)
}

#[tracing::instrument(skip(state))]
async fn target_state(
    State(state): State<AppState>,
    Path(target): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let report = state.engine.get_state(&target).await?;
    let response = match report {
        StateReport::Device(device) => StateResponse::Device(BTreeMap::from([(target, device)])),
        group => StateResponse::Group(group),
    };
    Ok(Json(response))
}

async fn command(state: &AppState, target: &str, command: Command) -> ApiResult<impl IntoResponse> {
    let targets = state.engine.apply_command(target, command).await?;
    Ok(CommandResponse::ok(targets))
}

#[tracing::instrument(skip(state))]
async fn power(
    State(state): State<AppState>,
    Path((target, power)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let on = match power.as_str() {
        "on" => true,
        "off" => false,
        other => {
            return Err(ApiError::BadRequest(format!(
                "power must be on or off, not {}",
                other
            )));
        }
    };
    command(&state, &target, Command::SetPower(on)).await
}

#[derive(Debug, Deserialize)]
struct BrightQuery {
    level: i64,
}

#[tracing::instrument(skip(state))]
async fn bright(
    State(state): State<AppState>,
    Path(target): Path<String>,
    Query(query): Query<BrightQuery>,
) -> ApiResult<impl IntoResponse> {
    command(&state, &target, Command::brightness(query.level)).await
}

#[derive(Debug, Deserialize)]
struct CtQuery {
    k: i64,
}

#[tracing::instrument(skip(state))]
async fn color_temp(
    State(state): State<AppState>,
    Path(target): Path<String>,
    Query(query): Query<CtQuery>,
) -> ApiResult<impl IntoResponse> {
    command(&state, &target, Command::color_temp(query.k)).await
}

#[derive(Debug, Deserialize)]
struct RgbQuery {
    r: i64,
    g: i64,
    b: i64,
}

#[tracing::instrument(skip(state))]
async fn rgb(
    State(state): State<AppState>,
    Path(target): Path<String>,
    Query(query): Query<RgbQuery>,
) -> ApiResult<impl IntoResponse> {
    command(&state, &target, Command::rgb(query.r, query.g, query.b)).await
}

#[tracing::instrument(skip(state))]
async fn toggle(
    State(state): State<AppState>,
    Path(target): Path<String>,
) -> ApiResult<impl IntoResponse> {
    command(&state, &target, Command::Toggle).await
}

#[tracing::instrument(skip(state))]
async fn pulse(
    State(state): State<AppState>,
    Path(target): Path<String>,
) -> ApiResult<impl IntoResponse> {
    command(&state, &target, Command::Pulse).await
}

#[tracing::instrument(skip(state))]
async fn scene(
    State(state): State<AppState>,
    Path(scene): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.engine.run_scene(&scene).await?;
    Ok(Json(CommandResponse {
        ok: true,
        targets: None,
    }))
}

#[tracing::instrument(skip(state))]
async fn get_presence(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.presence_config())
}

#[tracing::instrument(skip(state))]
async fn put_presence(
    State(state): State<AppState>,
    Json(update): Json<PresenceUpdate>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.update_presence(update).await?))
}

#[tracing::instrument(skip(state))]
async fn presence_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.presence_status())
}

#[tracing::instrument(skip(state))]
async fn get_routines(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.routines())
}

#[tracing::instrument(skip(state))]
async fn put_routines(
    State(state): State<AppState>,
    Json(overrides): Json<BTreeMap<String, RoutineOverride>>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.configure_routines(overrides).await?))
}

#[tracing::instrument(skip(state))]
async fn routine_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.routine_status())
}

#[derive(Debug, Deserialize)]
struct StartQuery {
    target: Option<String>,
}

#[tracing::instrument(skip(state))]
async fn start_routine(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<StartQuery>,
) -> ApiResult<impl IntoResponse> {
    let targets = state
        .engine
        .start_routine(&name, query.target.as_deref())?;
    Ok(CommandResponse::ok(targets))
}

#[tracing::instrument(skip(state))]
async fn stop_routine(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    Json(CommandResponse {
        ok: state.engine.stop_routine(&name),
        targets: None,
    })
}

/// Create the API router with all endpoints
pub fn create_router(engine: Arc<Engine>) -> Router {
    let state = AppState {
        version: env!("CARGO_PKG_VERSION"),
        engine,
    };

    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/api/bulbs", get(bulbs))
        .route("/api/groups", get(groups))
        .route("/api/scan", post(scan))
        .route("/api/state", get(all_states))
        .route("/api/state/:target", get(target_state))
        .route("/api/power/:target/:state", post(power))
        .route("/api/bright/:target", post(bright))
        .route("/api/ct/:target", post(color_temp))
        .route("/api/rgb/:target", post(rgb))
        .route("/api/toggle/:target", post(toggle))
        .route("/api/pulse/:target", post(pulse))
        .route("/api/scene/:scene", post(scene))
        .route("/api/presence", get(get_presence).put(put_presence))
        .route("/api/presence/status", get(presence_status))
        .route("/api/routines", get(get_routines).put(put_routines))
        .route("/api/routines/status", get(routine_status))
        .route("/api/routines/:name/start", post(start_routine))
        .route("/api/routines/:name/stop", post(stop_routine))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Start the HTTP API server
///
/// Binds to `listen:port` and serves until `shutdown_rx` fires, then drains
/// in-flight requests.
pub async fn serve(
    engine: Arc<Engine>,
    listen: String,
    port: u16,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = create_router(engine);

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}
