//! Job State Machine
//!
//! In-process registry of verification jobs. Submission registers a queued
//! job and spawns its task; the task is the single writer for its entry
//! (`queued → running → completed | error`, no reversals), accumulating rows
//! from the scheduler over an mpsc channel and broadcasting incremental
//! events to any number of subscribers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::models::job::{
    Checkpoint, JobConfig, JobEvent, JobSnapshot, JobStats, JobStatus, ResultRow,
};
use crate::models::outcome::{Action, Classification, StockSignal};

use super::catalog::{CandidateFetcher, UrlField};
use super::checker::LinkChecker;
use super::gateway::CatalogApi;
use super::remediation::{ActionApplier, ActionPolicy};
use super::scheduler::Pipeline;

/// Terminal jobs are evicted after this long.
const JOB_RETENTION: Duration = Duration::from_secs(3600);
const EVENT_CHANNEL_CAPACITY: usize = 256;
const ROW_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("job not found")]
    NotFound,
    #[error("job is not completed")]
    NotCompleted,
}

struct JobEntry {
    status: JobStatus,
    config: JobConfig,
    total: u64,
    processed: u64,
    results: Vec<ResultRow>,
    stats: JobStats,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    seen_ids: Vec<u64>,
    resume_token: Option<String>,
    events: broadcast::Sender<JobEvent>,
    retired_at: Option<Instant>,
}

pub struct JobManager {
    jobs: DashMap<Uuid, JobEntry>,
    api: Arc<dyn CatalogApi>,
    url_field: UrlField,
}

impl JobManager {
    pub fn new(api: Arc<dyn CatalogApi>, url_field: UrlField) -> Self {
        Self {
            jobs: DashMap::new(),
            api,
            url_field,
        }
    }

    /// Register a job and spawn its task. Returns immediately with the id.
    pub fn submit(self: &Arc<Self>, config: JobConfig) -> Uuid {
        let job_id = Uuid::new_v4();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        self.jobs.insert(
            job_id,
            JobEntry {
                status: JobStatus::Queued,
                config: config.clone(),
                total: 0,
                processed: 0,
                results: Vec::new(),
                stats: JobStats::default(),
                error: None,
                started_at: None,
                finished_at: None,
                seen_ids: Vec::new(),
                resume_token: None,
                events,
                retired_at: None,
            },
        );

        metrics::counter!("linkcheck_jobs_submitted_total").increment(1);
        metrics::gauge!("linkcheck_jobs_active").increment(1.0);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_job(job_id, config).await;
            metrics::gauge!("linkcheck_jobs_active").decrement(1.0);
        });

        tracing::info!(job_id = %job_id, "job submitted");
        job_id
    }

    /// The spawned job task: the only writer for this entry.
    async fn run_job(self: Arc<Self>, job_id: Uuid, config: JobConfig) {
        // A resume token from a different scope is ignored, not fatal.
        let checkpoint = match config.resume_token.as_deref() {
            None => None,
            Some(token) => match Checkpoint::decode(token) {
                Ok(cp) if cp.scope_hash == Checkpoint::scope_hash(&config.scope) => Some(cp),
                Ok(_) => {
                    tracing::warn!(
                        job_id = %job_id,
                        "resume token scope mismatch, starting fresh"
                    );
                    None
                }
                Err(e) => {
                    self.fail(job_id, format!("invalid resume token: {e}"));
                    return;
                }
            },
        };

        if let Some(cp) = &checkpoint {
            if let Some(mut entry) = self.jobs.get_mut(&job_id) {
                entry.seen_ids = cp.seen_ids.clone();
            }
        }

        // The job stays queued until the candidate count is known; a fetch
        // failure transitions queued → error with no running state entered.
        let fetcher = CandidateFetcher::new(Arc::clone(&self.api), self.url_field.clone());
        let mut candidates = match fetcher.fetch(&config.scope).await {
            Ok(c) => c,
            Err(e) => {
                self.fail(job_id, e.to_string());
                return;
            }
        };

        if let Some(cp) = &checkpoint {
            candidates.retain(|c| !cp.seen_ids.contains(&c.product_id));
        }
        let total = candidates.len() as u64;

        if let Some(mut entry) = self.jobs.get_mut(&job_id) {
            entry.status = JobStatus::Running;
            entry.started_at = Some(Utc::now());
            entry.total = total;
        }
        self.emit(job_id, JobEvent::Start { job_id, total });
        tracing::info!(job_id = %job_id, total, dry_run = config.dry_run, "job running");

        let checker =
            match LinkChecker::new(Duration::from_millis(config.timeout_ms), config.max_redirects)
            {
                Ok(c) => c,
                Err(e) => {
                    self.fail(job_id, e.to_string());
                    return;
                }
            };
        let applier = ActionApplier::new(
            Arc::clone(&self.api),
            ActionPolicy {
                dry_run: config.dry_run,
                auto_draft: config.auto_draft,
                auto_archive: config.auto_archive,
            },
        );
        let pipeline = Pipeline::new(
            checker,
            applier,
            config.low_stock_threshold,
            config.concurrency,
        );

        let (tx, mut rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);
        let producer = async { pipeline.run(candidates, tx).await };

        let consumer = async {
            while let Some(row) = rx.recv().await {
                self.record_row(job_id, row);
            }
        };

        tokio::join!(producer, consumer);
        self.complete(job_id);
    }

    /// Append one row, bump counters, emit events. Called only by the job's
    /// own task.
    fn record_row(&self, job_id: Uuid, row: ResultRow) {
        metrics::counter!("linkcheck_rows_total").increment(1);

        let Some(mut entry) = self.jobs.get_mut(&job_id) else {
            return;
        };

        let stats = &mut entry.stats;
        match row.outcome.classification {
            Classification::Ok => stats.ok_count += 1,
            Classification::NoUrl => stats.no_url_count += 1,
            c if c.is_broken() => {
                stats.broken_count += 1;
                metrics::counter!("linkcheck_broken_links_total").increment(1);
            }
            _ => {}
        }
        match row.outcome.stock_signal {
            Some(StockSignal::OutOfStock) => stats.out_of_stock_count += 1,
            Some(StockSignal::LowStock { .. }) => stats.low_stock_count += 1,
            _ => {}
        }
        match row.action {
            Action::Flag => stats.flagged_count += 1,
            Action::Draft => stats.drafted_count += 1,
            Action::Archive => stats.archived_count += 1,
            _ => {}
        }
        if row.action_error.is_some() {
            stats.action_error_count += 1;
        }
        if matches!(row.action, Action::Draft | Action::Archive) && row.action_error.is_none() {
            metrics::counter!("linkcheck_mutations_total").increment(1);
        }

        entry.seen_ids.push(row.product_id);
        entry.processed += 1;
        let processed = entry.processed;
        let total = entry.total;

        let issue = row.outcome.classification != Classification::Ok
            || row.action != Action::Keep;
        let action_event = if matches!(row.action, Action::Draft | Action::Archive) {
            Some(JobEvent::ActionTaken {
                job_id,
                product_id: row.product_id,
                action: row.action,
            })
        } else {
            None
        };
        let issue_event = issue.then(|| JobEvent::IssueDetected {
            job_id,
            row: row.clone(),
        });

        entry.results.push(row);
        drop(entry);

        self.emit(
            job_id,
            JobEvent::Progress {
                job_id,
                processed,
                total,
            },
        );
        if let Some(event) = issue_event {
            self.emit(job_id, event);
        }
        if let Some(event) = action_event {
            self.emit(job_id, event);
        }
    }

    fn complete(&self, job_id: Uuid) {
        let Some(mut entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if entry.status.is_terminal() {
            return;
        }
        entry.status = JobStatus::Completed;
        entry.finished_at = Some(Utc::now());
        entry.retired_at = Some(Instant::now());

        let checkpoint = Checkpoint {
            scope_hash: Checkpoint::scope_hash(&entry.config.scope),
            seen_ids: entry.seen_ids.clone(),
            processed: entry.processed,
        };
        entry.resume_token = Some(checkpoint.encode());

        let stats = entry.stats.clone();
        let resume_token = entry.resume_token.clone();
        drop(entry);

        metrics::counter!("linkcheck_jobs_completed_total").increment(1);
        tracing::info!(job_id = %job_id, "job completed");
        self.emit(
            job_id,
            JobEvent::Complete {
                job_id,
                stats,
                resume_token,
            },
        );
    }

    fn fail(&self, job_id: Uuid, error: String) {
        if let Some(mut entry) = self.jobs.get_mut(&job_id) {
            entry.status = JobStatus::Error;
            entry.error = Some(error.clone());
            entry.finished_at = Some(Utc::now());
            entry.retired_at = Some(Instant::now());
            // Coverage achieved before the failure stays resumable.
            if !entry.seen_ids.is_empty() {
                let checkpoint = Checkpoint {
                    scope_hash: Checkpoint::scope_hash(&entry.config.scope),
                    seen_ids: entry.seen_ids.clone(),
                    processed: entry.processed,
                };
                entry.resume_token = Some(checkpoint.encode());
            }
        }
        metrics::counter!("linkcheck_jobs_failed_total").increment(1);
        tracing::error!(job_id = %job_id, error = %error, "job failed");
        self.emit(job_id, JobEvent::Error { job_id, error });
    }

    fn emit(&self, job_id: Uuid, event: JobEvent) {
        if let Some(entry) = self.jobs.get(&job_id) {
            // No subscribers is fine.
            let _ = entry.events.send(event);
        }
    }

    pub fn snapshot(&self, job_id: Uuid) -> Option<JobSnapshot> {
        let entry = self.jobs.get(&job_id)?;
        // In-flight jobs get a token derived from coverage so far, letting an
        // operator restart from the current position.
        let resume_token = entry.resume_token.clone().or_else(|| {
            (!entry.seen_ids.is_empty()).then(|| {
                Checkpoint {
                    scope_hash: Checkpoint::scope_hash(&entry.config.scope),
                    seen_ids: entry.seen_ids.clone(),
                    processed: entry.processed,
                }
                .encode()
            })
        });
        Some(JobSnapshot {
            job_id,
            status: entry.status,
            total: entry.total,
            processed: entry.processed,
            results_count: entry.results.len() as u64,
            stats: entry.stats.clone(),
            dry_run: entry.config.dry_run,
            error: entry.error.clone(),
            started_at: entry.started_at,
            finished_at: entry.finished_at,
            resume_token,
        })
    }

    /// Full result set; only available once the job has completed.
    pub fn export(&self, job_id: Uuid) -> Result<Vec<ResultRow>, ExportError> {
        let entry = self.jobs.get(&job_id).ok_or(ExportError::NotFound)?;
        if entry.status != JobStatus::Completed {
            return Err(ExportError::NotCompleted);
        }
        Ok(entry.results.clone())
    }

    /// Event subscription plus the current snapshot, so late subscribers to a
    /// terminal job can be served a replayed final event.
    pub fn subscribe(
        &self,
        job_id: Uuid,
    ) -> Option<(broadcast::Receiver<JobEvent>, JobSnapshot)> {
        let entry = self.jobs.get(&job_id)?;
        let receiver = entry.events.subscribe();
        drop(entry);
        let snapshot = self.snapshot(job_id)?;
        Some((receiver, snapshot))
    }

    pub fn active_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|e| !e.status.is_terminal())
            .count()
    }

    /// Evict terminal jobs past retention. Run periodically from main.
    pub fn cleanup_old_jobs(&self) {
        let before = self.jobs.len();
        self.jobs.retain(|_, entry| {
            entry
                .retired_at
                .map(|t| t.elapsed() < JOB_RETENTION)
                .unwrap_or(true)
        });
        let evicted = before - self.jobs.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted retired jobs");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::JobScope;
    use crate::models::product::{Candidate, ProductStatus, StatusFilter};
    use crate::services::gateway::GatewayError;
    use async_trait::async_trait;
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeApi {
        products: Vec<Candidate>,
        urls: HashMap<u64, String>,
        fail_listing: bool,
        fetch_delay_ms: u64,
        mutations: Mutex<Vec<(u64, ProductStatus)>>,
    }

    #[async_trait]
    impl CatalogApi for FakeApi {
        async fn list_products(
            &self,
            _: StatusFilter,
            _: Option<DateTime<Utc>>,
            _: Option<&str>,
        ) -> Result<(Vec<Candidate>, Option<String>), GatewayError> {
            if self.fetch_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.fetch_delay_ms)).await;
            }
            if self.fail_listing {
                return Err(GatewayError::Auth(401));
            }
            Ok((self.products.clone(), None))
        }
        async fn list_collection_members(
            &self,
            _: u64,
            _: Option<&str>,
        ) -> Result<(Vec<u64>, Option<String>), GatewayError> {
            Ok((Vec::new(), None))
        }
        async fn products_by_ids(&self, _: &[u64]) -> Result<Vec<Candidate>, GatewayError> {
            Ok(Vec::new())
        }
        async fn product_url_field(
            &self,
            product_id: u64,
            _: &str,
            _: &str,
        ) -> Result<Option<String>, GatewayError> {
            Ok(self.urls.get(&product_id).cloned())
        }
        async fn update_product_status(
            &self,
            product_id: u64,
            status: ProductStatus,
        ) -> Result<(), GatewayError> {
            self.mutations.lock().unwrap().push((product_id, status));
            Ok(())
        }
    }

    fn product(id: u64) -> Candidate {
        Candidate {
            product_id: id,
            title: format!("P{id}"),
            status: ProductStatus::Active,
            target_url: None,
            handle: None,
            image: None,
            updated_at: None,
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn wait_terminal(manager: &JobManager, job_id: Uuid) -> JobSnapshot {
        for _ in 0..200 {
            if let Some(snapshot) = manager.snapshot(job_id) {
                if snapshot.status.is_terminal() {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job did not reach a terminal state");
    }

    #[tokio::test]
    async fn test_job_completes_with_all_rows() {
        let router = Router::new().route("/ok", get(|| async { "add to cart" }));
        let base = serve(router).await;

        let api = Arc::new(FakeApi {
            products: vec![product(1), product(2)],
            urls: HashMap::from([(1, format!("{base}/ok")), (2, format!("{base}/gone"))]),
            ..FakeApi::default()
        });
        let manager = Arc::new(JobManager::new(api, UrlField::default()));

        let job_id = manager.submit(JobConfig::default());
        let snapshot = wait_terminal(&manager, job_id).await;

        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.stats.ok_count, 1);
        assert_eq!(snapshot.stats.broken_count, 1);
        assert!(snapshot.resume_token.is_some());

        let rows = manager.export(job_id).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_failure_errors_job_before_rows() {
        let api = Arc::new(FakeApi {
            fail_listing: true,
            ..FakeApi::default()
        });
        let manager = Arc::new(JobManager::new(api, UrlField::default()));

        let job_id = manager.submit(JobConfig::default());
        let snapshot = wait_terminal(&manager, job_id).await;

        assert_eq!(snapshot.status, JobStatus::Error);
        assert_eq!(snapshot.results_count, 0);
        // Straight queued → error; the job was never running.
        assert!(snapshot.started_at.is_none());
        assert!(snapshot.error.unwrap().contains("authentication"));
        assert!(matches!(
            manager.export(job_id),
            Err(ExportError::NotCompleted)
        ));
    }

    #[tokio::test]
    async fn test_job_stays_queued_until_candidates_known() {
        let api = Arc::new(FakeApi {
            products: vec![product(1)],
            fetch_delay_ms: 300,
            ..FakeApi::default()
        });
        let manager = Arc::new(JobManager::new(api, UrlField::default()));

        let job_id = manager.submit(JobConfig::default());
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Listing is still in flight.
        let snapshot = manager.snapshot(job_id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Queued);
        assert!(snapshot.started_at.is_none());

        let snapshot = wait_terminal(&manager, job_id).await;
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.total, 1);
    }

    #[tokio::test]
    async fn test_export_requires_completion() {
        let api = Arc::new(FakeApi::default());
        let manager = Arc::new(JobManager::new(api, UrlField::default()));
        assert!(matches!(
            manager.export(Uuid::new_v4()),
            Err(ExportError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_resume_token_skips_seen_products() {
        let api = Arc::new(FakeApi {
            products: vec![product(1), product(2), product(3)],
            ..FakeApi::default()
        });
        let manager = Arc::new(JobManager::new(api, UrlField::default()));

        let first = manager.submit(JobConfig::default());
        let snapshot = wait_terminal(&manager, first).await;
        let token = snapshot.resume_token.unwrap();

        let resumed = manager.submit(JobConfig {
            resume_token: Some(token),
            ..JobConfig::default()
        });
        let snapshot = wait_terminal(&manager, resumed).await;
        assert_eq!(snapshot.status, JobStatus::Completed);
        // Everything was seen on the first run.
        assert_eq!(snapshot.total, 0);
    }

    #[tokio::test]
    async fn test_resume_token_scope_mismatch_starts_fresh() {
        let api = Arc::new(FakeApi {
            products: vec![product(1)],
            ..FakeApi::default()
        });
        let manager = Arc::new(JobManager::new(api, UrlField::default()));

        // Token minted for a different scope; its seen-ID set must not apply.
        let other_scope = JobScope {
            status: StatusFilter::Draft,
            ..JobScope::default()
        };
        let checkpoint = Checkpoint {
            scope_hash: Checkpoint::scope_hash(&other_scope),
            seen_ids: vec![1],
            processed: 1,
        };
        let job_id = manager.submit(JobConfig {
            resume_token: Some(checkpoint.encode()),
            ..JobConfig::default()
        });
        let snapshot = wait_terminal(&manager, job_id).await;
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.processed, 1);
    }

    #[tokio::test]
    async fn test_invalid_resume_token_fails() {
        let api = Arc::new(FakeApi::default());
        let manager = Arc::new(JobManager::new(api, UrlField::default()));

        let job_id = manager.submit(JobConfig {
            resume_token: Some("!!not a token!!".to_string()),
            ..JobConfig::default()
        });
        let snapshot = wait_terminal(&manager, job_id).await;
        assert_eq!(snapshot.status, JobStatus::Error);
        assert!(snapshot.error.unwrap().contains("resume token"));
    }

    #[tokio::test]
    async fn test_failed_resumed_job_keeps_coverage_token() {
        let api = Arc::new(FakeApi {
            products: vec![product(1), product(2), product(3)],
            ..FakeApi::default()
        });
        let manager = Arc::new(JobManager::new(api, UrlField::default()));

        let first = manager.submit(JobConfig::default());
        let token = wait_terminal(&manager, first).await.resume_token.unwrap();

        // Same scope, upstream now failing: the error snapshot still carries
        // a token covering the first run's products.
        let failing = Arc::new(FakeApi {
            fail_listing: true,
            ..FakeApi::default()
        });
        let manager = Arc::new(JobManager::new(failing, UrlField::default()));
        let job_id = manager.submit(JobConfig {
            resume_token: Some(token),
            ..JobConfig::default()
        });
        let snapshot = wait_terminal(&manager, job_id).await;
        assert_eq!(snapshot.status, JobStatus::Error);

        let mut recovered = Checkpoint::decode(&snapshot.resume_token.unwrap())
            .unwrap()
            .seen_ids;
        recovered.sort_unstable();
        assert_eq!(recovered, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let api = Arc::new(FakeApi {
            products: vec![product(1)],
            // Give the subscriber time to attach before the first event.
            fetch_delay_ms: 100,
            ..FakeApi::default()
        });
        let manager = Arc::new(JobManager::new(api, UrlField::default()));

        let job_id = manager.submit(JobConfig::default());
        let (mut rx, _) = manager.subscribe(job_id).unwrap();

        let mut names = Vec::new();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    names.push(event.name());
                    if terminal {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        // No-URL candidate: start, progress, issue-detected, complete.
        assert_eq!(names.first(), Some(&"start"));
        assert_eq!(names.last(), Some(&"complete"));
        assert!(names.contains(&"progress"));
        assert!(names.contains(&"issue-detected"));
    }

    #[tokio::test]
    async fn test_cleanup_retains_active_jobs() {
        let api = Arc::new(FakeApi::default());
        let manager = Arc::new(JobManager::new(api, UrlField::default()));
        let job_id = manager.submit(JobConfig::default());
        wait_terminal(&manager, job_id).await;

        // Freshly retired jobs are inside the retention window.
        manager.cleanup_old_jobs();
        assert!(manager.snapshot(job_id).is_some());
    }
}
