//! Verification Scheduler
//!
//! Drives the per-candidate pipeline (verify → classify stock → decide →
//! apply) across the candidate set with bounded concurrency. Each candidate
//! yields exactly one `ResultRow` on the output channel; per-candidate
//! failures are encoded in the row, never propagated.

use std::time::Instant;

use chrono::Utc;
use futures::{stream, StreamExt};
use tokio::sync::mpsc;

use crate::models::job::ResultRow;
use crate::models::outcome::{Classification, VerificationOutcome};
use crate::models::product::Candidate;

use super::checker::LinkChecker;
use super::remediation::{decide, ActionApplier};
use super::stock::StockMatcher;

pub struct Pipeline {
    checker: LinkChecker,
    matcher: StockMatcher,
    applier: ActionApplier,
    low_stock_threshold: u32,
    concurrency: usize,
}

impl Pipeline {
    pub fn new(
        checker: LinkChecker,
        applier: ActionApplier,
        low_stock_threshold: u32,
        concurrency: usize,
    ) -> Self {
        Self {
            checker,
            matcher: StockMatcher::default(),
            applier,
            low_stock_threshold,
            concurrency: concurrency.max(1),
        }
    }

    /// Process every candidate, sending one row per candidate in completion
    /// order. Returns when all candidates are processed or the receiver is
    /// dropped.
    pub async fn run(&self, candidates: Vec<Candidate>, tx: mpsc::Sender<ResultRow>) {
        stream::iter(candidates)
            .map(|candidate| {
                let tx = tx.clone();
                async move {
                    let row = self.process(candidate).await;
                    // Receiver gone means the job was torn down; nothing to do.
                    let _ = tx.send(row).await;
                }
            })
            .buffer_unordered(self.concurrency)
            .collect::<()>()
            .await;
    }

    async fn process(&self, candidate: Candidate) -> ResultRow {
        let started = Instant::now();

        let outcome = match candidate.target_url.as_deref() {
            None => VerificationOutcome::no_url(),
            Some(url) => {
                let verified = self.checker.check(url).await;
                let mut outcome = verified.outcome;
                if outcome.classification == Classification::Ok {
                    if let Some(body) = verified.body.as_deref() {
                        outcome.stock_signal = Some(self.matcher.classify(body));
                    }
                }
                outcome
            }
        };

        metrics::histogram!("linkcheck_verify_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        let remediation = decide(&outcome, self.low_stock_threshold);
        let (action, action_error) = self.applier.apply(&candidate, remediation).await;

        ResultRow {
            product_id: candidate.product_id,
            product_title: candidate.title,
            product_status: candidate.status,
            url: candidate.target_url,
            outcome,
            action,
            action_error,
            checked_at: Utc::now(),
        }
    }
}
