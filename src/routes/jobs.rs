use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::{self, Stream, StreamExt};
use garde::Validate;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::{JobConfig, JobEvent, JobScope, JobSnapshot, JobStatus, ResultRow};
use crate::services::jobs::ExportError;

#[derive(Debug, Deserialize, Validate)]
pub struct SubmitJobRequest {
    #[garde(skip)]
    #[serde(default)]
    pub scope: JobScope,

    #[garde(skip)]
    #[serde(default = "default_true")]
    pub dry_run: bool,

    #[garde(skip)]
    #[serde(default)]
    pub auto_draft: bool,

    #[garde(skip)]
    #[serde(default)]
    pub auto_archive: bool,

    #[garde(range(min = 1, max = 100))]
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[garde(range(min = 1000, max = 60000))]
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[garde(range(max = 10))]
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,

    #[garde(range(min = 1, max = 1000))]
    #[serde(default = "default_low_stock_threshold")]
    pub low_stock_threshold: u32,

    #[garde(skip)]
    pub resume_token: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_concurrency() -> usize {
    20
}
fn default_timeout_ms() -> u64 {
    8000
}
fn default_max_redirects() -> u32 {
    5
}
fn default_low_stock_threshold() -> u32 {
    2
}

#[derive(Serialize)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// POST /api/v1/jobs — submit a verification job.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), (StatusCode, String)> {
    request
        .validate()
        .map_err(|report| (StatusCode::UNPROCESSABLE_ENTITY, report.to_string()))?;

    let config = JobConfig {
        scope: request.scope,
        dry_run: request.dry_run,
        auto_draft: request.auto_draft,
        auto_archive: request.auto_archive,
        concurrency: request.concurrency,
        timeout_ms: request.timeout_ms,
        max_redirects: request.max_redirects,
        low_stock_threshold: request.low_stock_threshold,
        resume_token: request.resume_token,
    };

    let job_id = state.manager.submit(config);
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobResponse {
            job_id,
            status: JobStatus::Queued,
        }),
    ))
}

/// GET /api/v1/jobs/{job_id} — point-in-time snapshot.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobSnapshot>, StatusCode> {
    state
        .manager
        .snapshot(job_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// GET /api/v1/jobs/{job_id}/results — full result set once completed.
pub async fn get_results(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Vec<ResultRow>>, StatusCode> {
    match state.manager.export(job_id) {
        Ok(rows) => Ok(Json(rows)),
        Err(ExportError::NotFound) => Err(StatusCode::NOT_FOUND),
        Err(ExportError::NotCompleted) => Err(StatusCode::CONFLICT),
    }
}

fn sse_event(event: &JobEvent) -> Event {
    let builder = Event::default().event(event.name());
    match builder.json_data(event) {
        Ok(e) => e,
        Err(_) => Event::default().event("error"),
    }
}

/// GET /api/v1/jobs/{job_id}/events — SSE stream of job events.
///
/// Subscribers attached after a job reached a terminal state receive a
/// replayed terminal event rather than an empty stream.
pub async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let (receiver, snapshot) = state
        .manager
        .subscribe(job_id)
        .ok_or(StatusCode::NOT_FOUND)?;

    let replay = if snapshot.status.is_terminal() {
        Some(match snapshot.status {
            JobStatus::Error => JobEvent::Error {
                job_id,
                error: snapshot.error.unwrap_or_default(),
            },
            _ => JobEvent::Complete {
                job_id,
                stats: snapshot.stats,
                resume_token: snapshot.resume_token,
            },
        })
    } else {
        None
    };

    let stream = stream::unfold(
        (receiver, replay, false),
        move |(mut receiver, replay, done)| async move {
            if done {
                return None;
            }
            if let Some(event) = replay {
                let terminal = event.is_terminal();
                return Some((sse_event(&event), (receiver, None, terminal)));
            }
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let terminal = event.is_terminal();
                        return Some((sse_event(&event), (receiver, None, terminal)));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(job_id = %job_id, skipped, "event subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        },
    )
    .map(Ok);

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
