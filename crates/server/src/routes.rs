//! Route table (spec §4.G), nested under `/api/v1/mining`.

use crate::error::ServerError;
use crate::middleware::RequestId;
use crate::AppState;
use axum::extract::{Extension, Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use fleetctl_backends::{Config, Stats};
use fleetctl_core::Event;
use fleetctl_p2p::NodeId;
use fleetctl_store::Resolution;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const MAX_LOG_LINES: usize = 10_000;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest(
            "/api/v1/mining",
            Router::new()
                .route("/info", get(info))
                .route("/miners", get(list_miners))
                .route("/miners/available", get(available_backends))
                .route("/miners/:name/install", post(install_backend))
                .route("/miners/:name/uninstall", delete(uninstall_backend))
                .route("/miners/:name", post(start_miner).delete(stop_miner))
                .route("/miners/:name/stats", get(miner_stats))
                .route("/miners/:name/logs", get(miner_logs))
                .route("/miners/:name/stdin", post(miner_stdin))
                .route("/miners/:name/hashrate-history", get(miner_hashrate_history))
                .route("/history/miners/:name/hashrate", get(persisted_hashrate))
                .route("/profiles", get(list_profiles).post(create_profile))
                .route("/profiles/:id", get(get_profile).put(update_profile).delete(delete_profile))
                .route("/profiles/:id/start", post(start_from_profile))
                .route("/peers/optimal", get(optimal_peer))
                .route("/peers/:peer_id/miners/:name/stats", get(remote_miner_stats))
                .route("/peers/:peer_id/miners/:name/logs", get(remote_miner_logs))
                .route("/peers/:peer_id/miners/:backend_kind", post(start_remote_miner).delete(stop_remote_miner))
                .route("/miners/:name/stats/fleet", get(fleet_stats))
                .route("/ws/events", get(crate::ws::upgrade)),
        )
        .with_state(state)
}

fn valid_name(name: &str) -> Result<(), ServerError> {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"));
    if name.is_empty() || name.len() > 128 || !re.is_match(name) {
        return Err(ServerError::bad_request("name must match ^[A-Za-z0-9_-]+$", Uuid::new_v4().to_string()));
    }
    Ok(())
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

#[derive(Serialize)]
struct InfoResponse {
    version: &'static str,
    uptime_secs: u64,
    miners: Vec<fleetctl_core::MinerSummary>,
    store_enabled: bool,
}

async fn info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    let miners = state.supervisor.list_miners().await;
    let uptime_secs = state.started_at.elapsed().unwrap_or_default().as_secs();
    Json(InfoResponse { version: env!("CARGO_PKG_VERSION"), uptime_secs, miners, store_enabled: state.store.is_enabled() })
}

async fn list_miners(State(state): State<Arc<AppState>>) -> Json<Vec<fleetctl_core::MinerSummary>> {
    Json(state.supervisor.list_miners().await)
}

#[derive(Serialize)]
struct BackendInfoResponse {
    name: &'static str,
    installed: bool,
    version: Option<String>,
}

async fn available_backends(State(state): State<Arc<AppState>>) -> Json<Vec<BackendInfoResponse>> {
    let backends = state
        .supervisor
        .available_backends()
        .await
        .into_iter()
        .map(|b| BackendInfoResponse { name: b.name, installed: b.installed, version: b.version })
        .collect();
    Json(backends)
}

#[derive(Deserialize)]
struct InstallRequest {
    version: Option<String>,
}

async fn install_backend(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path(backend_kind): Path<String>,
    body: Option<Json<InstallRequest>>,
) -> Result<Json<fleetctl_backends::InstallationRecord>, ServerError> {
    valid_name(&backend_kind).map_err(|_| ServerError::bad_request("invalid backend name", request_id.0.clone()))?;
    let version = body.map(|Json(b)| b.version).unwrap_or(None);
    let record = state.supervisor.install(&backend_kind, version).await.map_err(|e| ServerError::from_core(e, request_id.0))?;
    Ok(Json(record))
}

async fn uninstall_backend(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path(backend_kind): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.supervisor.uninstall(&backend_kind).await.map_err(|e| ServerError::from_core(e, request_id.0))?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn start_miner(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path(backend_kind): Path<String>,
    Json(config): Json<Config>,
) -> Result<Json<fleetctl_core::MinerSummary>, ServerError> {
    valid_name(&backend_kind).map_err(|_| ServerError::bad_request("invalid backend name", request_id.0.clone()))?;
    let summary = state.supervisor.start_miner(&backend_kind, config).await.map_err(|e| ServerError::from_core(e, request_id.0))?;
    state.event_hub.publish(Event::miner_started(&summary.name)).await;
    Ok(Json(summary))
}

async fn stop_miner(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path(instance_name): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    valid_name(&instance_name).map_err(|_| ServerError::bad_request("invalid instance name", request_id.0.clone()))?;
    state.supervisor.stop_miner(&instance_name).await.map_err(|e| ServerError::from_core(e, request_id.0))?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn miner_stats(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path(instance_name): Path<String>,
) -> Result<Json<fleetctl_backends::Stats>, ServerError> {
    let instance = state.supervisor.get_instance(&instance_name).await.map_err(|e| ServerError::from_core(e, request_id.0.clone()))?;
    let stats = instance.get_stats().await.map_err(|e| ServerError::from_core(e, request_id.0))?;
    Ok(Json(stats))
}

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default = "default_lines")]
    lines: usize,
}

fn default_lines() -> usize {
    200
}

async fn miner_logs(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path(instance_name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<String>>, ServerError> {
    let instance = state.supervisor.get_instance(&instance_name).await.map_err(|e| ServerError::from_core(e, request_id.0))?;
    let lines = query.lines.min(MAX_LOG_LINES);
    Ok(Json(instance.get_logs(lines).await))
}

#[derive(Deserialize)]
struct StdinRequest {
    data: String,
}

fn shell_metachar_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r#"[;&|`$(){}<>\\\n\r"']"#).expect("static regex"))
}

async fn miner_stdin(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path(instance_name): Path<String>,
    Json(body): Json<StdinRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    if shell_metachar_regex().is_match(&body.data) {
        return Err(ServerError::bad_request("stdin payload contains disallowed shell characters", request_id.0));
    }
    let instance = state.supervisor.get_instance(&instance_name).await.map_err(|e| ServerError::from_core(e, request_id.0.clone()))?;
    instance.write_stdin(&body.data).await.map_err(|e| ServerError::from_core(e, request_id.0))?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn miner_hashrate_history(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path(instance_name): Path<String>,
) -> Result<Json<Vec<fleetctl_core::HashratePoint>>, ServerError> {
    let instance = state.supervisor.get_instance(&instance_name).await.map_err(|e| ServerError::from_core(e, request_id.0))?;
    Ok(Json(instance.hashrate_history().await))
}

#[derive(Deserialize)]
struct RangeQuery {
    since: Option<i64>,
    until: Option<i64>,
    #[serde(default)]
    resolution: ResolutionParam,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "lowercase")]
enum ResolutionParam {
    High,
    #[default]
    Low,
}

async fn persisted_hashrate(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path(instance_name): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<fleetctl_store::HashratePoint>>, ServerError> {
    let since = query.since.unwrap_or(0);
    let until = query.until.unwrap_or_else(now_unix);
    let resolution = match query.resolution {
        ResolutionParam::High => Resolution::High,
        ResolutionParam::Low => Resolution::Low,
    };
    let points = state
        .store
        .hashrate_history(&instance_name, since, until, resolution)
        .await
        .map_err(|e| ServerError::from_core(fleetctl_core::CoreError::Store(e), request_id.0))?;
    Ok(Json(points))
}

async fn list_profiles(State(state): State<Arc<AppState>>) -> Json<Vec<fleetctl_core::Profile>> {
    Json(state.profiles.list().await)
}

#[derive(Deserialize)]
struct ProfileRequest {
    name: String,
    backend_kind: String,
    config: Config,
}

async fn create_profile(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<ProfileRequest>,
) -> Result<Json<fleetctl_core::Profile>, ServerError> {
    let profile = state
        .profiles
        .create(body.name, body.backend_kind, body.config)
        .await
        .map_err(|e| ServerError::from_core(e, request_id.0))?;
    state.event_hub.publish(Event::profile_changed(&profile.id)).await;
    Ok(Json(profile))
}

async fn get_profile(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
) -> Result<Json<fleetctl_core::Profile>, ServerError> {
    Ok(Json(state.profiles.get(&id).await.map_err(|e| ServerError::from_core(e, request_id.0))?))
}

async fn update_profile(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
    Json(body): Json<ProfileRequest>,
) -> Result<Json<fleetctl_core::Profile>, ServerError> {
    let profile = state
        .profiles
        .update(&id, body.name, body.backend_kind, body.config)
        .await
        .map_err(|e| ServerError::from_core(e, request_id.0))?;
    state.event_hub.publish(Event::profile_changed(&profile.id)).await;
    Ok(Json(profile))
}

async fn delete_profile(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.profiles.delete(&id).await.map_err(|e| ServerError::from_core(e, request_id.0))?;
    state.event_hub.publish(Event::profile_changed(&id)).await;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn start_from_profile(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
) -> Result<Json<fleetctl_core::MinerSummary>, ServerError> {
    let summary = state
        .profiles
        .start_from_profile(&id, &state.supervisor)
        .await
        .map_err(|e| ServerError::from_core(e, request_id.0))?;
    state.event_hub.publish(Event::miner_started(&summary.name)).await;
    Ok(Json(summary))
}

fn parse_peer_id(raw: &str, request_id: &str) -> Result<NodeId, ServerError> {
    Uuid::parse_str(raw)
        .map(NodeId)
        .map_err(|_| ServerError::bad_request("peer_id must be a uuid", request_id.to_string()))
}

/// Outbound §4.J control surface: this node driving a peer over the P2P
/// `Controller`, as distinct from the `/miners/*` routes above which act on
/// this node's own `Supervisor`.
async fn remote_miner_stats(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path((peer_id, instance_name)): Path<(String, String)>,
) -> Result<Json<Stats>, ServerError> {
    let peer_id = parse_peer_id(&peer_id, &request_id.0)?;
    let stats = state
        .controller
        .get_remote_stats(peer_id, &instance_name)
        .await
        .map_err(|e| ServerError::from_p2p(e, request_id.0))?;
    Ok(Json(stats))
}

async fn remote_miner_logs(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path((peer_id, instance_name)): Path<(String, String)>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<String>>, ServerError> {
    let peer_id = parse_peer_id(&peer_id, &request_id.0)?;
    let lines = query.lines.min(MAX_LOG_LINES);
    let logs = state
        .controller
        .get_remote_logs(peer_id, &instance_name, lines)
        .await
        .map_err(|e| ServerError::from_p2p(e, request_id.0))?;
    Ok(Json(logs))
}

async fn start_remote_miner(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path((peer_id, backend_kind)): Path<(String, String)>,
    Json(config): Json<Config>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let peer_id = parse_peer_id(&peer_id, &request_id.0)?;
    valid_name(&backend_kind).map_err(|_| ServerError::bad_request("invalid backend name", request_id.0.clone()))?;
    state
        .controller
        .start_remote_miner(peer_id, &backend_kind, config)
        .await
        .map_err(|e| ServerError::from_p2p(e, request_id.0))?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn stop_remote_miner(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path((peer_id, instance_name)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let peer_id = parse_peer_id(&peer_id, &request_id.0)?;
    valid_name(&instance_name).map_err(|_| ServerError::bad_request("invalid instance name", request_id.0.clone()))?;
    state
        .controller
        .stop_remote_miner(peer_id, &instance_name)
        .await
        .map_err(|e| ServerError::from_p2p(e, request_id.0))?;
    Ok(Json(serde_json::json!({"ok": true})))
}

/// Fans the same instance name out across every connected peer (spec §4.J
/// `get_all_stats`), keyed by peer id for the caller to correlate.
async fn fleet_stats(State(state): State<Arc<AppState>>, Path(instance_name): Path<String>) -> Json<HashMap<String, Stats>> {
    let stats = state.controller.get_all_stats(&instance_name).await;
    Json(stats.into_iter().map(|(id, s)| (id.to_string(), s)).collect())
}

async fn optimal_peer(State(state): State<Arc<AppState>>) -> Json<Option<String>> {
    Json(state.controller.select_optimal_peer().await.map(|id| id.to_string()))
}
