use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::{sync::Arc, time::Instant};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    classifier::ModelStatus,
    engine::ThreatEngine,
    error::AppError,
    types::{BatchRequest, BatchResponse, ClassifyRequest, Verdict},
};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ThreatEngine>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(engine: Arc<ThreatEngine>, metrics: Option<PrometheusHandle>) -> Self {
        Self { engine, metrics }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/classify", post(classify))
        .route("/classify/batch", post(classify_batch))
        .route("/model", get(model_status))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn classify(
    State(state): State<AppState>,
    Json(request): Json<ClassifyRequest>,
) -> Result<Json<Verdict>, AppError> {
    metrics::counter!("requests_total", "endpoint" => "classify").increment(1);
    let verdict = state.engine.classify(&request.url)?;
    Ok(Json(verdict))
}

async fn classify_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, AppError> {
    metrics::counter!("requests_total", "endpoint" => "classify_batch").increment(1);

    let limit = state.engine.max_batch_size();
    if request.urls.len() > limit {
        return Err(AppError::InvalidInput(format!(
            "batch of {} URLs exceeds the limit of {}",
            request.urls.len(),
            limit
        )));
    }

    let start = Instant::now();
    let count = request.urls.len();
    let engine = state.engine.clone();
    let results = tokio::task::spawn_blocking(move || engine.classify_batch(&request.urls))
        .await
        .map_err(|e| AppError::Internal(format!("batch worker failed: {}", e)))?;

    info!("Classified batch of {} URLs in {:.1}ms", count, start.elapsed().as_secs_f64() * 1000.0);
    Ok(Json(BatchResponse { results }))
}

async fn model_status(State(state): State<AppState>) -> Json<ModelStatus> {
    Json(state.engine.model_status())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn metrics_text(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{classifier::Classifier, config::Config};
    use axum::{body::Body, http::Request};
    use serde_json::Value;
    use tower::ServiceExt;

    fn router(config: &Config) -> Router {
        let engine = ThreatEngine::with_classifier(config, Classifier::unavailable("no artifact")).unwrap();
        build_router(AppState::new(Arc::new(engine), None))
    }

    async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_classify_endpoint() {
        let app = router(&Config::default());
        let (status, body) = post_json(app, "/classify", serde_json::json!({"url": "https://www.example.com/"})).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["category"], "safe");
        assert_eq!(body["risk_level"], "Low");
        assert_eq!(body["source"], "heuristics");
        assert!(body["probabilities"].is_null());
    }

    #[tokio::test]
    async fn test_classify_malformed_is_bad_request() {
        let app = router(&Config::default());
        let (status, body) = post_json(app, "/classify", serde_json::json!({"url": "http://"})).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], 400);
    }

    #[tokio::test]
    async fn test_batch_endpoint_keeps_order() {
        let app = router(&Config::default());
        let urls = serde_json::json!({"urls": ["http://10.0.0.5/secure-login.php", "", "https://github.com/"]});
        let (status, body) = post_json(app, "/classify/batch", urls).await;

        assert_eq!(status, StatusCode::OK);
        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0]["status"], "ok");
        assert_eq!(results[1]["status"], "error");
        assert_eq!(results[1]["error"]["kind"], "malformed_input");
        assert_eq!(results[2]["verdict"]["url"], "https://github.com/");
    }

    #[tokio::test]
    async fn test_oversized_batch_rejected() {
        let mut config = Config::default();
        config.server.max_batch_size = 2;
        let app = router(&config);
        let urls = serde_json::json!({"urls": ["https://a.com/", "https://b.com/", "https://c.com/"]});
        let (status, _) = post_json(app, "/classify/batch", urls).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_model_and_health_endpoints() {
        let app = router(&Config::default());
        let (status, body) = get_json(app.clone(), "/model").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["available"], false);
        assert_eq!(body["reason"], "no artifact");

        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }
}
