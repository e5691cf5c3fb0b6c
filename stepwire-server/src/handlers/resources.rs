//! Trigger endpoints called by the upstream API.

use axum::{
    Form, Json,
    extract::{Path, State},
};
use serde::Deserialize;
use serde_json::{Value, json};
use stepwire_model::{ApiConnectionId, DelayId, ExternalSourceId};

use crate::errors::{AppError, AppResult};
use crate::infra::app_state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectSourceForm {
    pub connection_id: String,
}

/// `PUT /resources/sources/{source_id}`
pub async fn connect_source_handler(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
    Form(form): Form<ConnectSourceForm>,
) -> AppResult<Json<Value>> {
    let connection_id = form.connection_id.trim();
    if connection_id.is_empty() {
        return Err(AppError::bad_request("connectionId must not be empty"));
    }

    state
        .coordinator()
        .connect_external_source(
            &ExternalSourceId::new(source_id),
            &ApiConnectionId::new(connection_id),
        )
        .await?;

    Ok(Json(json!({ "success": true })))
}

/// `POST /resources/delays/{delay_id}/resolve`
pub async fn resolve_delay_handler(
    State(state): State<AppState>,
    Path(delay_id): Path<String>,
) -> AppResult<Json<Value>> {
    let record = state
        .coordinator()
        .resolve_delay(&DelayId::new(delay_id))
        .await?;

    Ok(Json(json!({
        "id": record.delay.id,
        "stepId": record.step.id,
        "runId": record.run.id,
        "resolvedAt": record.delay.resolved_at,
        "stepStatus": record.step.status.as_str(),
    })))
}
