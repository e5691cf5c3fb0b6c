use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post, put},
};
use serde_json::{Value, json};
use stepwire_core::messaging::SubscriberStatus;
use tower_http::trace::TraceLayer;

use crate::handlers::resources::{connect_source_handler, resolve_delay_handler};
use crate::infra::app_state::AppState;

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/resources/sources/{source_id}", put(connect_source_handler))
        .route(
            "/resources/delays/{delay_id}/resolve",
            post(resolve_delay_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(
    State(state): State<AppState>,
) -> (StatusCode, Json<Value>) {
    let mut health_status = json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "checks": {}
    });

    let mut is_unhealthy = false;
    if let Some(workers) = state.workers.as_ref() {
        for (name, status) in workers.statuses().await {
            let ready = status == SubscriberStatus::Ready;
            is_unhealthy |= !ready;
            health_status["checks"][name] = json!({
                "status": if ready { "healthy" } else { "unhealthy" },
                "subscriber": format!("{status:?}"),
            });
        }
    }

    if is_unhealthy {
        health_status["status"] = json!("unhealthy");
        (StatusCode::SERVICE_UNAVAILABLE, Json(health_status))
    } else {
        (StatusCode::OK, Json(health_status))
    }
}
