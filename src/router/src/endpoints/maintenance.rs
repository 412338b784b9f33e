//! Admin-triggered maintenance runs
//!
//! Runs are serialised through the state's run lock and bounded by
//! `admin.run_timeout`. When the limit passes, the table in flight is rolled back,
//! the remaining tables are reported as timed out and the answer is a 504 carrying
//! the complete report.

use std::future::Future;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use compactor::{CompactableTable, MaintenanceOrchestrator, Relation, TableOutcome};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use super::ApiError;
use crate::AdminState;

pub fn router() -> Router<AdminState> {
    Router::new()
        .route("/compact-all", post(compact_all))
        .route("/tables/:table/compact", post(compact_table))
        .route("/tables/:table/sequence", post(repair_sequence))
        .route("/sequences", post(repair_all_sequences))
        .route("/metrics", get(metrics))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompactAllRequest {
    pub dry_run: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompactTableRequest {
    /// `table:foreign_key[:referenced_key]` specs; the registry entry is used when absent
    pub relations: Option<Vec<String>>,
    pub id_column: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepairSequenceRequest {
    pub id_column: Option<String>,
}

/// Parse an optional JSON body; an empty body means defaults.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            ApiError::new("invalid_request", format!("Invalid request body: {e}")),
        )
            .into_response()
    })
}

/// The shared orchestrator, bounded by `admin.run_timeout`.
fn bounded_orchestrator(state: &AdminState, dry_run: bool) -> MaintenanceOrchestrator {
    state
        .orchestrator()
        .clone()
        .with_dry_run(dry_run)
        .with_run_timeout(Some(state.run_timeout()))
}

/// Run `job` while holding the run lock.
async fn run_exclusive<T, F>(state: &AdminState, job: F) -> T
where
    F: Future<Output = T>,
{
    let _guard = state.run_lock().lock().await;
    job.await
}

/// 200 when everything succeeded, 504 when the run limit stopped a table and 500
/// otherwise, always with the complete report.
fn report_response<T: Serialize>(
    state: &AdminState,
    success: bool,
    timed_out: bool,
    report: T,
) -> Response {
    let status = if timed_out {
        log::warn!(
            "Maintenance run exceeded {:?}: the table in flight was rolled back, \
             completed tables stay committed",
            state.run_timeout()
        );
        StatusCode::GATEWAY_TIMEOUT
    } else if success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(report)).into_response()
}

async fn compact_all(State(state): State<AdminState>, body: Bytes) -> Response {
    let request: CompactAllRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let orchestrator = bounded_orchestrator(&state, request.dry_run);
    let report = run_exclusive(&state, orchestrator.compact_all(state.registry())).await;
    report_response(&state, report.success, report.timed_out(), report)
}

async fn compact_table(
    State(state): State<AdminState>,
    Path(table): Path<String>,
    body: Bytes,
) -> Response {
    let request: CompactTableRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let entry = state.registry().find(&table);
    let relations = match &request.relations {
        Some(specs) => {
            match specs
                .iter()
                .map(|spec| spec.parse::<Relation>())
                .collect::<Result<Vec<_>, _>>()
            {
                Ok(relations) => relations,
                Err(e) => {
                    return (
                        StatusCode::BAD_REQUEST,
                        ApiError::new("invalid_relation", e.to_string()),
                    )
                        .into_response();
                }
            }
        }
        None => entry.map(|entry| entry.relations.clone()).unwrap_or_default(),
    };

    let id_column = request
        .id_column
        .or_else(|| entry.map(|entry| entry.table.id_column.clone()))
        .unwrap_or_else(|| state.default_id_column().to_string());
    let target = CompactableTable::new(table).with_id_column(id_column);

    let orchestrator = bounded_orchestrator(&state, request.dry_run);
    let result = run_exclusive(&state, orchestrator.compact_table(&target, &relations)).await;
    report_response(&state, result.success, result.timed_out(), result)
}

async fn repair_sequence(
    State(state): State<AdminState>,
    Path(table): Path<String>,
    body: Bytes,
) -> Response {
    let request: RepairSequenceRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let id_column = request
        .id_column
        .unwrap_or_else(|| state.default_id_column().to_string());
    let orchestrator = bounded_orchestrator(&state, false);
    let result = run_exclusive(&state, orchestrator.repair_sequence(&table, &id_column)).await;
    report_response(&state, result.success, result.timed_out(), result)
}

async fn repair_all_sequences(State(state): State<AdminState>) -> Response {
    let orchestrator = bounded_orchestrator(&state, false);
    let report = run_exclusive(
        &state,
        orchestrator.repair_all_sequences(state.default_id_column()),
    )
    .await;
    report_response(&state, report.success, report.timed_out(), report)
}

async fn metrics(State(state): State<AdminState>) -> Response {
    Json(state.orchestrator().metrics().summary()).into_response()
}
