//! Query Surface (C7), Event Ingest Surface (C6), and process lifecycle (C8)
//!
//! Follows the teacher's `bin/server.rs` conventions
//! (`examples/nuniesmith-audit/src/bin/server.rs`): an `AppState` threaded
//! through `axum::extract::State`, an `ApiResponse<T>` success/error
//! envelope, and a CORS-permissive router built once in `create_router`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::Config;
use crate::counter_store::{CounterStore, RedisCounterStore};
use crate::datafile::DatafileRepository;
use crate::error::OptimizerError;
use crate::overlay;
use crate::scheduler::Scheduler;
use crate::types::{CounterSnapshot, CycleSummary, EventPayload, StatsEntry, VariantKey};

#[derive(Clone)]
pub struct AppState {
    datafiles: Arc<RwLock<DatafileRepository>>,
    store: Arc<dyn CounterStore>,
    scheduler: Arc<Scheduler>,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

impl ApiResponse<()> {
    fn not_found(msg: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            StatusCode::NOT_FOUND,
            Json(Self {
                success: false,
                data: None,
                error: Some(msg.into()),
            }),
        )
    }

    fn from_error(err: &OptimizerError) -> (StatusCode, Json<Self>) {
        let status = if err.is_transient() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (
            status,
            Json(Self {
                success: false,
                data: None,
                error: Some(err.to_string()),
            }),
        )
    }

    fn bad_request(msg: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            StatusCode::BAD_REQUEST,
            Json(Self {
                success: false,
                data: None,
                error: Some(msg.into()),
            }),
        )
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "variant-weight-optimizer",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn get_datafile_handler(State(state): State<AppState>, Path(path): Path<String>) -> impl IntoResponse {
    let datafiles = state.datafiles.read().await;
    let Some(df) = datafiles.get(&path) else {
        return ApiResponse::not_found(format!("unknown datafile: {path}")).into_response();
    };

    let mut counters = std::collections::HashMap::new();
    for feature in df.feature_keys() {
        let Some(variants) = df.variants(&feature) else {
            continue;
        };
        for v in variants {
            let key = VariantKey::new(path.clone(), feature.clone(), v.value.clone());
            // Overlay computation never fails to serve (spec §7): a lookup
            // failure falls back to the on-disk weight for that variant.
            let snap = state.store.get_counters(&key).await.unwrap_or_default();
            counters.insert((feature.clone(), v.value.clone()), snap);
        }
    }

    let rewritten = overlay::overlay(df, &counters);
    Json(rewritten).into_response()
}

async fn expose_handler(State(state): State<AppState>, Json(body): Json<serde_json::Value>) -> impl IntoResponse {
    match parse_event_payload(body) {
        Ok(payload) => ingest(&state, &payload, true).await,
        Err(msg) => ApiResponse::bad_request(msg).into_response(),
    }
}

async fn convert_handler(State(state): State<AppState>, Json(body): Json<serde_json::Value>) -> impl IntoResponse {
    match parse_event_payload(body) {
        Ok(payload) => ingest(&state, &payload, false).await,
        Err(msg) => ApiResponse::bad_request(msg).into_response(),
    }
}

/// Deserializes the body into an [`EventPayload`] by hand, rather than via
/// the `Json<EventPayload>` extractor, so a body missing `datafile`/
/// `features` maps to `400` like any other malformed body (spec §6, §7)
/// instead of axum's default `422` for well-formed-JSON-but-wrong-shape.
fn parse_event_payload(body: serde_json::Value) -> std::result::Result<EventPayload, String> {
    serde_json::from_value(body).map_err(|e| format!("invalid event payload: {e}"))
}

async fn ingest(state: &AppState, payload: &EventPayload, is_expose: bool) -> axum::response::Response {
    // No validation that the feature/variant is declared anywhere: unknown
    // keys still increment harmlessly (spec §4.6).
    for (feature, variant) in &payload.features {
        let key = VariantKey::new(payload.datafile.clone(), feature.clone(), variant.clone());
        let result = if is_expose {
            state.store.incr_exposure(&key).await
        } else {
            state.store.incr_conversion(&key).await
        };
        // Increments never retry: losing one event beats double-counting
        // under ambiguity (spec §7).
        if let Err(e) = result {
            error!("counter increment failed for {:?}: {e}", key);
            return ApiResponse::<()>::from_error(&e).into_response();
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    datafile: Option<String>,
    feature: Option<String>,
}

type StatsTree = BTreeMap<String, BTreeMap<String, BTreeMap<String, StatsEntry>>>;

async fn stats_handler(State(state): State<AppState>, Query(query): Query<StatsQuery>) -> impl IntoResponse {
    let keys = match state.store.list_keys().await {
        Ok(k) => k,
        Err(e) => return ApiResponse::<()>::from_error(&e).into_response(),
    };

    let mut seen = std::collections::HashSet::new();
    let mut tree: StatsTree = BTreeMap::new();

    for raw_key in keys {
        // The iterator may return duplicates; dedupe here (spec §4.1).
        if !seen.insert(raw_key.clone()) {
            continue;
        }
        let Some(parsed) = VariantKey::parse_store_key(&raw_key) else {
            continue;
        };
        if let Some(ref df_filter) = query.datafile {
            if &parsed.datafile != df_filter {
                continue;
            }
        }
        if let Some(ref feat_filter) = query.feature {
            if &parsed.feature != feat_filter {
                continue;
            }
        }

        let snap: CounterSnapshot = state.store.get_counters(&parsed).await.unwrap_or_default();
        tree.entry(parsed.datafile.clone())
            .or_default()
            .entry(parsed.feature.clone())
            .or_default()
            .insert(parsed.variant.clone(), snap.into());
    }

    Json(tree).into_response()
}

async fn recalculate_handler(State(state): State<AppState>) -> impl IntoResponse {
    let summary: CycleSummary = state.scheduler.run_cycle().await;
    ApiResponse::ok(summary).into_response()
}

// ============================================================================
// Router & lifecycle
// ============================================================================

/// Bounded retry window for the boot-time store reachability probe
/// (spec §6 exit-codes, §7 "store-fatal at boot"). `connect()` only builds
/// a connection pool and never opens a socket, so an unreachable Redis
/// would otherwise go unnoticed until the first request.
const BOOT_STORE_RETRY_ATTEMPTS: u32 = 5;
const BOOT_STORE_RETRY_DELAY: Duration = Duration::from_secs(2);

async fn connect_store_with_retry(redis_config: &crate::config::RedisConfig) -> anyhow::Result<RedisCounterStore> {
    let store = RedisCounterStore::connect(redis_config)?;
    let mut attempt = 0;
    loop {
        match store.ping().await {
            Ok(()) => return Ok(store),
            Err(e) => {
                attempt += 1;
                if attempt >= BOOT_STORE_RETRY_ATTEMPTS {
                    anyhow::bail!("store unreachable at boot after {attempt} attempts: {e}");
                }
                tracing::warn!(
                    "store unreachable at boot (attempt {attempt}/{BOOT_STORE_RETRY_ATTEMPTS}): {e}; retrying in {:?}",
                    BOOT_STORE_RETRY_DELAY
                );
                tokio::time::sleep(BOOT_STORE_RETRY_DELAY).await;
            }
        }
    }
}

fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/datafile/*path", get(get_datafile_handler))
        .route("/expose", post(expose_handler))
        .route("/convert", post(convert_handler))
        .route("/stats", get(stats_handler))
        .route("/recalculate", post(recalculate_handler))
        .layer(cors)
        .with_state(state)
}

/// Wire up the counter store, datafile repository, and scheduler, then
/// serve until a shutdown signal arrives. Mirrors the teacher's
/// `main()` in structure (config load -> store init -> router -> serve)
/// but adds the background scheduler task and graceful-shutdown wait
/// (spec §5, §6).
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let repo = DatafileRepository::load(&config.datafiles_dir)?;
    info!("datafiles loaded: {}", repo.len());
    let datafiles = Arc::new(RwLock::new(repo));

    let store: Arc<dyn CounterStore> = Arc::new(connect_store_with_retry(&config.redis).await?);

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        datafiles.clone(),
        config.scheduler.min_exposures_for_update,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = scheduler.clone().spawn(config.scheduler.update_interval, shutdown_rx);

    let state = AppState {
        datafiles,
        store,
        scheduler,
    };
    let app = create_router(state);

    let addr = config.server.addr();
    info!("optimizer server starting on http://{addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    // Bounded grace period for the scheduler's in-flight cycle (spec §5).
    let _ = tokio::time::timeout(Duration::from_secs(30), scheduler_handle).await;

    info!("optimizer server shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter_store::InMemoryCounterStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::io::Write;
    use tower::ServiceExt;

    fn write_datafile(dir: &std::path::Path, rel: &str, contents: &str) {
        let full = dir.join(rel);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        let mut f = std::fs::File::create(full).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    fn test_state(dir: &std::path::Path) -> AppState {
        let repo = DatafileRepository::load(dir).unwrap();
        let datafiles = Arc::new(RwLock::new(repo));
        let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
        let scheduler = Arc::new(Scheduler::new(store.clone(), datafiles.clone(), 100));
        AppState {
            datafiles,
            store,
            scheduler,
        }
    }

    #[tokio::test]
    async fn scenario_s1_overlay_passthrough_with_no_counters() {
        let tmp = tempfile::tempdir().unwrap();
        write_datafile(
            tmp.path(),
            "d.json",
            r#"{"features":{"f":{"variations":[{"value":"A","weight":50},{"value":"B","weight":50}]}}}"#,
        );
        let state = test_state(tmp.path());
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/datafile/d.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let weights: Vec<f64> = json["features"]["f"]["variations"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["weight"].as_f64().unwrap())
            .collect();
        assert_eq!(weights, vec![50.0, 50.0]);
    }

    #[tokio::test]
    async fn unknown_datafile_is_404() {
        let tmp = tempfile::tempdir().unwrap();
        write_datafile(tmp.path(), "d.json", r#"{"features":{}}"#);
        let state = test_state(tmp.path());
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/datafile/missing.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn scenario_s2_single_expose_increments_one_variant() {
        let tmp = tempfile::tempdir().unwrap();
        write_datafile(
            tmp.path(),
            "d.json",
            r#"{"features":{"f":{"variations":[{"value":"A","weight":50},{"value":"B","weight":50}]}}}"#,
        );
        let state = test_state(tmp.path());
        let app = create_router(state.clone());

        let body = serde_json::json!({"datafile": "d.json", "features": {"f": "A"}}).to_string();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/expose")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let a = state.store.get_counters(&VariantKey::new("d.json", "f", "A")).await.unwrap();
        assert_eq!(a.exposures, 1);
        assert_eq!(a.conversions, 0);
        let b = state.store.get_counters(&VariantKey::new("d.json", "f", "B")).await.unwrap();
        assert_eq!(b.exposures, 0);
    }

    #[tokio::test]
    async fn scenario_s6_convert_before_expose_is_tolerated() {
        let tmp = tempfile::tempdir().unwrap();
        write_datafile(
            tmp.path(),
            "d.json",
            r#"{"features":{"f":{"variations":[{"value":"A","weight":100}]}}}"#,
        );
        let state = test_state(tmp.path());
        let app = create_router(state.clone());

        let body = serde_json::json!({"datafile": "d.json", "features": {"f": "A"}}).to_string();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/convert")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let snap = state.store.get_counters(&VariantKey::new("d.json", "f", "A")).await.unwrap();
        assert_eq!(snap.exposures, 0);
        assert_eq!(snap.conversions, 1);
        assert_eq!(snap.conversion_rate(), 0.0);
    }

    #[tokio::test]
    async fn malformed_expose_body_is_400() {
        let tmp = tempfile::tempdir().unwrap();
        write_datafile(tmp.path(), "d.json", r#"{"features":{}}"#);
        let state = test_state(tmp.path());
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/expose")
                    .header("content-type", "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn expose_body_missing_required_field_is_400() {
        let tmp = tempfile::tempdir().unwrap();
        write_datafile(tmp.path(), "d.json", r#"{"features":{}}"#);
        let state = test_state(tmp.path());
        let app = create_router(state);

        // Valid JSON, but missing the required `features` field.
        let body = serde_json::json!({"datafile": "d.json"}).to_string();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/expose")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stats_reports_grouped_counters() {
        let tmp = tempfile::tempdir().unwrap();
        write_datafile(
            tmp.path(),
            "d.json",
            r#"{"features":{"f":{"variations":[{"value":"A","weight":50}]}}}"#,
        );
        let state = test_state(tmp.path());
        state.store.incr_exposure(&VariantKey::new("d.json", "f", "A")).await.unwrap();
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/stats?datafile=d.json&feature=f")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["d.json"]["f"]["A"]["exposures"], 1);
    }
}
