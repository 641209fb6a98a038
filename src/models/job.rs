use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::outcome::{Action, VerificationOutcome};
use super::product::{ProductStatus, StatusFilter};

/// Status of a link-check job in the in-process registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

/// Filter defining which products a job covers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobScope {
    #[serde(default)]
    pub status: StatusFilter,
    #[serde(default)]
    pub collection_ids: Vec<u64>,
    pub updated_since: Option<DateTime<Utc>>,
}

/// Full configuration snapshot a job runs under. Immutable for the job's
/// lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub scope: JobScope,
    pub dry_run: bool,
    pub auto_draft: bool,
    pub auto_archive: bool,
    pub concurrency: usize,
    pub timeout_ms: u64,
    pub max_redirects: u32,
    pub low_stock_threshold: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            scope: JobScope::default(),
            dry_run: true,
            auto_draft: false,
            auto_archive: false,
            concurrency: 20,
            timeout_ms: 8000,
            max_redirects: 5,
            low_stock_threshold: 2,
            resume_token: None,
        }
    }
}

/// Per-job aggregate counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStats {
    pub ok_count: u64,
    pub broken_count: u64,
    pub no_url_count: u64,
    pub out_of_stock_count: u64,
    pub low_stock_count: u64,
    pub drafted_count: u64,
    pub archived_count: u64,
    pub flagged_count: u64,
    pub action_error_count: u64,
}

/// One immutable row: candidate × outcome × decided action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRow {
    pub product_id: u64,
    pub product_title: String,
    pub product_status: ProductStatus,
    pub url: Option<String>,
    pub outcome: VerificationOutcome,
    pub action: Action,
    /// Upstream rejection of the mutation, recorded without failing the job.
    pub action_error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Opaque resume state: coverage encoded as the set of product IDs already
/// processed, bound to a hash of the scope that produced them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub scope_hash: String,
    pub seen_ids: Vec<u64>,
    pub processed: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("invalid base64 in resume token: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid checkpoint payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl Checkpoint {
    /// Hash of the job scope; a resume token only applies to an identical
    /// scope.
    pub fn scope_hash(scope: &JobScope) -> String {
        let mut ids = scope.collection_ids.clone();
        ids.sort_unstable();
        let canonical = serde_json::json!({
            "status": scope.status,
            "collection_ids": ids,
            "updated_since": scope.updated_since,
        });
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        hex::encode(digest)
    }

    pub fn encode(&self) -> String {
        let json = serde_json::to_string(self).expect("checkpoint serializes");
        base64::engine::general_purpose::STANDARD.encode(json)
    }

    pub fn decode(token: &str) -> Result<Self, CheckpointError> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(token)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Point-in-time view of a job, safe to hand to the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub total: u64,
    pub processed: u64,
    pub results_count: u64,
    pub stats: JobStats,
    pub dry_run: bool,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub resume_token: Option<String>,
}

/// Incremental event emitted as results are produced. The SSE route is an
/// adapter over the per-job broadcast channel carrying these.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobEvent {
    Start {
        job_id: Uuid,
        total: u64,
    },
    Progress {
        job_id: Uuid,
        processed: u64,
        total: u64,
    },
    IssueDetected {
        job_id: Uuid,
        row: ResultRow,
    },
    ActionTaken {
        job_id: Uuid,
        product_id: u64,
        action: Action,
    },
    Complete {
        job_id: Uuid,
        stats: JobStats,
        resume_token: Option<String>,
    },
    Error {
        job_id: Uuid,
        error: String,
    },
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Start { .. } => "start",
            JobEvent::Progress { .. } => "progress",
            JobEvent::IssueDetected { .. } => "issue-detected",
            JobEvent::ActionTaken { .. } => "action-taken",
            JobEvent::Complete { .. } => "complete",
            JobEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Complete { .. } | JobEvent::Error { .. })
    }
}
