use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use cadence_scheduler::EngineHealth;
use serde_json::{json, Value};
use tokio::sync::watch;

/// Assemble the health router.
pub fn build_router(health: watch::Receiver<EngineHealth>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(health)
}

/// GET /health: 200 while the scheduler loop runs, 503 once it has halted.
pub async fn health_handler(
    State(health): State<watch::Receiver<EngineHealth>>,
) -> (StatusCode, Json<Value>) {
    let snapshot = health.borrow().clone();
    let code = if snapshot.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "status": if snapshot.healthy { "ok" } else { "failed" },
            "version": env!("CARGO_PKG_VERSION"),
            "engine": snapshot,
        })),
    )
}
