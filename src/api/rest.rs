// =============================================================================
// REST API Endpoints - Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Read endpoints and execution are
// public; catalog reload requires the admin bearer token.
//
// Execution responses are the script's own success document, untouched.
// Failures use one envelope: `{success: false, error: {type, message,
// details?, statusCode}}` where `type` is the gateway error kind.
//
// CORS is permissive: the charting client is served from another origin.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Json, Path, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::auth::AdminToken;
use crate::app_state::AppState;
use crate::cache::{fingerprint, CacheStats};
use crate::error::GatewayError;
use crate::executor::LauncherStats;
use crate::types::IndicatorRequest;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/indicators", get(list_indicators))
        .route("/api/v1/indicators/metadata", get(all_metadata))
        .route("/api/v1/indicators/:name/metadata", get(one_metadata))
        .route("/api/v1/indicators/execute", post(execute))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/indicators/reload", post(reload))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Error envelope
// =============================================================================

/// `GatewayError` rendered as an HTTP response.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
        GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::Indicator { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        GatewayError::Script { .. } => StatusCode::BAD_GATEWAY,
        GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::Spawn { .. } | GatewayError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let mut error = json!({
            "type": self.0.kind(),
            "message": self.0.to_string(),
            "statusCode": status.as_u16(),
        });
        if let Some(details) = self.0.details() {
            error["details"] = Value::String(details);
        }
        (status, Json(json!({ "success": false, "error": error }))).into_response()
    }
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
    uptime_secs: u64,
    scripts_dir: String,
    indicators: usize,
    execution_timeout_ms: u64,
    launcher: LauncherStats,
    cache: CacheStats,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_secs: state.uptime_secs(),
        scripts_dir: state.registry.scripts_dir().display().to_string(),
        indicators: state.registry.list_indicators().len(),
        execution_timeout_ms: state.gateway.timeout().as_millis() as u64,
        launcher: state.launcher.stats(),
        cache: state.responses.stats(),
    })
}

// =============================================================================
// Discovery (public)
// =============================================================================

async fn list_indicators(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let names = state.registry.list_indicators();
    Json(json!({ "success": true, "count": names.len(), "data": names }))
}

async fn all_metadata(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let schemas = state.registry.describe_all().await;
    Json(json!({ "success": true, "count": schemas.len(), "data": schemas }))
}

async fn one_metadata(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let schema = state.registry.describe_one(&name).await?;
    Ok(Json(json!({ "success": true, "data": schema })))
}

// =============================================================================
// Execution (public)
// =============================================================================

async fn execute(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let mut response = match run_request(&state, &request_id, body).await {
        Ok(doc) => Json(doc).into_response(),
        Err(err) if err.0.is_client_error() => {
            info!(request_id = %request_id, kind = err.0.kind(), error = %err.0, "execute request rejected");
            err.into_response()
        }
        Err(err) => {
            warn!(request_id = %request_id, kind = err.0.kind(), error = %err.0, "execute request failed");
            err.into_response()
        }
    };
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn run_request(
    state: &AppState,
    request_id: &str,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Value, ApiError> {
    let Json(body) =
        body.map_err(|e| GatewayError::validation(format!("invalid JSON body: {}", e.body_text())))?;
    let request = IndicatorRequest::from_value(body)?;

    info!(
        request_id,
        indicator = %request.name,
        candles = request.candle_data.len(),
        "execute request received"
    );

    let key = fingerprint(&(&request.name, &request.candle_data, &request.params))
        .map(|f| format!("execute:{f}"));
    if let Some(hit) = key.as_deref().and_then(|k| state.responses.get(k)) {
        info!(request_id, indicator = %request.name, "served from cache");
        return Ok(hit);
    }

    let doc = state.gateway.execute(&request).await?;
    if let Some(key) = key {
        state.responses.insert(key, doc.clone());
    }
    Ok(doc)
}

// =============================================================================
// Reload (authenticated)
// =============================================================================

async fn reload(
    _auth: AdminToken,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let names = state.registry.reload()?;
    // Script versions may have changed underneath cached responses.
    state.responses.clear();
    info!(count = names.len(), "indicator catalog reloaded via API");
    Ok(Json(json!({ "success": true, "count": names.len(), "data": names })))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testkit::{bars, describe_script, sh_scripts, SMA_SCRIPT};
    use crate::runtime_config::RuntimeConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(dir: &std::path::Path, tweak: impl FnOnce(&mut RuntimeConfig)) -> (Router, Arc<AppState>) {
        let mut config = RuntimeConfig {
            interpreter: Some("sh".to_string()),
            scripts_dir: dir.to_path_buf(),
            script_extension: "sh".to_string(),
            execution_timeout_ms: 5_000,
            describe_timeout_ms: 2_000,
            ..RuntimeConfig::default()
        };
        tweak(&mut config);
        let state = Arc::new(AppState::new(config));
        state.registry.reload().unwrap();
        (router(state.clone()), state)
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Option<String>, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let request_id = resp
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, request_id, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn execute_body(name: &str, n: usize, params: Value) -> Value {
        json!({
            "name": name,
            "candleData": bars(n),
            "params": params,
            "metadata": { "symbol": "AAPL", "interval": "1m" }
        })
    }

    #[tokio::test]
    async fn health_reports_catalog_size() {
        let dir = sh_scripts(&[("sma", SMA_SCRIPT), ("ema", "cat")]);
        let (app, _) = app(dir.path(), |_| {});

        let (status, _, body) = call(&app, get("/api/v1/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["indicators"], 2);
        assert_eq!(body["executionTimeoutMs"], 5_000);
        assert_eq!(body["launcher"]["spawnedTotal"], 0);
    }

    #[tokio::test]
    async fn execute_sma_end_to_end() {
        let dir = sh_scripts(&[("sma", SMA_SCRIPT)]);
        let (app, _) = app(dir.path(), |_| {});

        let req = post_json("/api/v1/indicators/execute", execute_body("sma", 100, json!({ "period": 20 })));
        let (status, request_id, body) = call(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(request_id.is_some());
        assert_eq!(body["success"], true);
        assert_eq!(body["values"].as_array().unwrap().len(), 81);
    }

    #[tokio::test]
    async fn execute_maps_error_kinds_to_status() {
        let dir = sh_scripts(&[
            ("crash", "echo 'fatal: segfault in talib' >&2\nexit 139"),
            ("slow", "sleep 10"),
            ("picky", r#"echo '{"success":false,"error":{"type":"ValueError","message":"period must be > 1"}}'"#),
        ]);
        let (app, _) = app(dir.path(), |c| c.execution_timeout_ms = 300);

        let cases = [
            (execute_body("sma", 0, json!({})), StatusCode::BAD_REQUEST, "ValidationError"),
            (execute_body("vwap", 5, json!({})), StatusCode::NOT_FOUND, "NotFoundError"),
            (execute_body("crash", 5, json!({})), StatusCode::BAD_GATEWAY, "ScriptError"),
            (execute_body("slow", 5, json!({})), StatusCode::GATEWAY_TIMEOUT, "TimeoutError"),
            (execute_body("picky", 5, json!({})), StatusCode::UNPROCESSABLE_ENTITY, "IndicatorError"),
        ];
        for (body, expected_status, expected_type) in cases {
            let (status, _, resp) = call(&app, post_json("/api/v1/indicators/execute", body)).await;
            assert_eq!(status, expected_status, "{resp}");
            assert_eq!(resp["success"], false);
            assert_eq!(resp["error"]["type"], expected_type);
            assert_eq!(resp["error"]["statusCode"], expected_status.as_u16());
        }
    }

    #[tokio::test]
    async fn unstartable_interpreter_is_a_500_spawn_error() {
        let dir = sh_scripts(&[("sma", SMA_SCRIPT)]);
        let (app, state) = app(dir.path(), |c| c.interpreter = Some("no-such-interpreter".to_string()));

        let req = post_json("/api/v1/indicators/execute", execute_body("sma", 5, json!({})));
        let (status, _, resp) = call(&app, req).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(resp["error"]["type"], "SpawnError");
        assert_eq!(resp["error"]["statusCode"], 500);
        assert_eq!(state.launcher.stats().spawned_total, 0);

        let (_, _, health) = call(&app, get("/api/v1/health")).await;
        assert_eq!(health["launcher"]["spawnedTotal"], 0);
    }

    #[tokio::test]
    async fn reload_of_vanished_directory_is_a_500_io_error() {
        let parent = tempfile::tempdir().unwrap();
        let scripts = parent.path().join("scripts");
        std::fs::create_dir(&scripts).unwrap();
        std::fs::write(scripts.join("sma.sh"), format!("#!/bin/sh\n{SMA_SCRIPT}\n")).unwrap();
        let (app, _) = app(&scripts, |c| c.admin_token = Some("s3cret".to_string()));
        std::fs::remove_dir_all(&scripts).unwrap();

        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/indicators/reload")
            .header("authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        let (status, _, resp) = call(&app, req).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(resp["error"]["type"], "IoError");

        let (_, _, list) = call(&app, get("/api/v1/indicators")).await;
        assert_eq!(list["data"], json!(["sma"]));
    }

    #[tokio::test]
    async fn script_error_details_quote_stderr() {
        let dir = sh_scripts(&[("crash", "echo 'fatal: segfault in talib' >&2\nexit 2")]);
        let (app, _) = app(dir.path(), |_| {});

        let (_, _, resp) = call(&app, post_json("/api/v1/indicators/execute", execute_body("crash", 5, json!({})))).await;
        assert!(resp["error"]["details"].as_str().unwrap().contains("segfault in talib"));
    }

    #[tokio::test]
    async fn malformed_body_is_validation_error() {
        let dir = sh_scripts(&[("sma", SMA_SCRIPT)]);
        let (app, state) = app(dir.path(), |_| {});

        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/indicators/execute")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, _, resp) = call(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(resp["error"]["type"], "ValidationError");

        let body = json!({ "name": "sma", "candleData": bars(5), "params": "period=20" });
        let (status, _, _) = call(&app, post_json("/api/v1/indicators/execute", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(state.launcher.stats().spawned_total, 0);
    }

    #[tokio::test]
    async fn metadata_endpoints_skip_broken_scripts() {
        let rsi = describe_script("rsi");
        let dir = sh_scripts(&[
            ("sma", SMA_SCRIPT),
            ("rsi", rsi.as_str()),
            ("broken", "echo 'SyntaxError' >&2\nexit 1"),
        ]);
        let (app, _) = app(dir.path(), |_| {});

        let (status, _, body) = call(&app, get("/api/v1/indicators")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!(["broken", "rsi", "sma"]));

        let (status, _, body) = call(&app, get("/api/v1/indicators/metadata")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2);
        assert_eq!(body["data"][0]["name"], "rsi");
        assert_eq!(body["data"][1]["name"], "sma");

        let (status, _, body) = call(&app, get("/api/v1/indicators/sma/metadata")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["parameters"][0]["name"], "period");

        let (status, _, body) = call(&app, get("/api/v1/indicators/broken/metadata")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["type"], "ScriptError");

        let (status, _, _) = call(&app, get("/api/v1/indicators/missing/metadata")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reload_requires_token_and_picks_up_new_scripts() {
        let dir = sh_scripts(&[("sma", SMA_SCRIPT)]);
        let (app, _) = app(dir.path(), |c| c.admin_token = Some("s3cret".to_string()));
        std::fs::write(dir.path().join("ema.sh"), "#!/bin/sh\ncat\n").unwrap();

        let anonymous = Request::builder()
            .method("POST")
            .uri("/api/v1/indicators/reload")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = call(&app, anonymous).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let wrong = Request::builder()
            .method("POST")
            .uri("/api/v1/indicators/reload")
            .header("authorization", "Bearer nope")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = call(&app, wrong).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let authorised = Request::builder()
            .method("POST")
            .uri("/api/v1/indicators/reload")
            .header("authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = call(&app, authorised).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!(["ema", "sma"]));
    }

    #[tokio::test]
    async fn reload_without_configured_token_is_refused() {
        let dir = sh_scripts(&[("sma", SMA_SCRIPT)]);
        let (app, _) = app(dir.path(), |_| {});

        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/indicators/reload")
            .header("authorization", "Bearer anything")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = call(&app, req).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn response_cache_serves_repeat_requests() {
        let nonce = r#"echo "{\"success\":true,\"values\":[],\"pid\":$$}""#;
        let dir = sh_scripts(&[("nonce", nonce)]);

        let (cached, state) = app(dir.path(), |c| c.cache_enabled = true);
        let body = execute_body("nonce", 5, json!({}));
        let (_, _, first) = call(&cached, post_json("/api/v1/indicators/execute", body.clone())).await;
        let (_, _, second) = call(&cached, post_json("/api/v1/indicators/execute", body.clone())).await;
        assert_eq!(first, second);
        assert_eq!(state.launcher.stats().spawned_total, 1);

        let (uncached, state) = app(dir.path(), |_| {});
        call(&uncached, post_json("/api/v1/indicators/execute", body.clone())).await;
        call(&uncached, post_json("/api/v1/indicators/execute", body)).await;
        assert_eq!(state.launcher.stats().spawned_total, 2);
    }
}
