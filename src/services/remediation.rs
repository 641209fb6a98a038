//! Remediation Decider and Applier
//!
//! The decider is a pure decision table from a verification outcome to a
//! remediation. The applier executes (or withholds, under dry-run/policy) the
//! decision through the gateway and records upstream rejections per-row.

use std::sync::Arc;

use crate::models::outcome::{Action, Classification, StockSignal, VerificationOutcome};
use crate::models::product::{Candidate, ProductStatus};

use super::gateway::CatalogApi;

/// What the decision table says should happen to a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remediation {
    Keep,
    Flag,
    Draft,
    Archive,
}

/// Decision table: outcome → remediation.
pub fn decide(outcome: &VerificationOutcome, low_stock_threshold: u32) -> Remediation {
    match outcome.classification {
        Classification::Ok => match outcome.stock_signal {
            Some(StockSignal::OutOfStock) => Remediation::Archive,
            Some(StockSignal::LowStock { count }) if count <= low_stock_threshold => {
                Remediation::Draft
            }
            _ => Remediation::Keep,
        },
        Classification::NotFound
        | Classification::ServerError
        | Classification::Unreachable
        | Classification::BrokenRedirectLoop => Remediation::Archive,
        Classification::ClientError => Remediation::Flag,
        // A missing URL is informational; the row's classification and the
        // no-url counter carry the signal, the product is left alone.
        Classification::NoUrl => Remediation::Keep,
    }
}

/// Mutation policy a job runs under.
#[derive(Debug, Clone, Copy)]
pub struct ActionPolicy {
    pub dry_run: bool,
    pub auto_draft: bool,
    pub auto_archive: bool,
}

pub struct ActionApplier {
    api: Arc<dyn CatalogApi>,
    policy: ActionPolicy,
}

impl ActionApplier {
    pub fn new(api: Arc<dyn CatalogApi>, policy: ActionPolicy) -> Self {
        Self { api, policy }
    }

    /// Execute a remediation for one candidate. Returns the recorded action
    /// and any per-row mutation error; never fails the job.
    pub async fn apply(
        &self,
        candidate: &Candidate,
        remediation: Remediation,
    ) -> (Action, Option<String>) {
        let (target, live, withheld) = match remediation {
            Remediation::Keep => return (Action::Keep, None),
            Remediation::Flag => return (Action::Flag, None),
            Remediation::Draft => (ProductStatus::Draft, Action::Draft, Action::WouldDraft),
            Remediation::Archive => {
                (ProductStatus::Archived, Action::Archive, Action::WouldArchive)
            }
        };

        let enabled = match remediation {
            Remediation::Draft => self.policy.auto_draft,
            Remediation::Archive => self.policy.auto_archive,
            _ => unreachable!(),
        };
        if self.policy.dry_run || !enabled {
            return (withheld, None);
        }

        // Already in the target status; nothing to mutate.
        if candidate.status == target {
            return (live, None);
        }

        match self
            .api
            .update_product_status(candidate.product_id, target)
            .await
        {
            Ok(()) => (live, None),
            Err(e) => {
                tracing::warn!(
                    product_id = candidate.product_id,
                    error = %e,
                    "status mutation rejected"
                );
                (withheld, Some(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::product::StatusFilter;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;

    fn outcome(classification: Classification, stock: Option<StockSignal>) -> VerificationOutcome {
        VerificationOutcome {
            classification,
            http_status: None,
            final_url: None,
            redirect_chain: Vec::new(),
            stock_signal: stock,
            error: None,
        }
    }

    fn candidate(status: ProductStatus) -> Candidate {
        Candidate {
            product_id: 7,
            title: "Widget".into(),
            status,
            target_url: Some("https://example.com/w".into()),
            handle: None,
            image: None,
            updated_at: None,
        }
    }

    #[derive(Default)]
    struct RecordingApi {
        mutations: Mutex<Vec<(u64, ProductStatus)>>,
        reject: bool,
    }

    #[async_trait]
    impl CatalogApi for RecordingApi {
        async fn list_products(
            &self,
            _: StatusFilter,
            _: Option<DateTime<Utc>>,
            _: Option<&str>,
        ) -> Result<(Vec<Candidate>, Option<String>), super::super::gateway::GatewayError>
        {
            Ok((Vec::new(), None))
        }

        async fn list_collection_members(
            &self,
            _: u64,
            _: Option<&str>,
        ) -> Result<(Vec<u64>, Option<String>), super::super::gateway::GatewayError> {
            Ok((Vec::new(), None))
        }

        async fn products_by_ids(
            &self,
            _: &[u64],
        ) -> Result<Vec<Candidate>, super::super::gateway::GatewayError> {
            Ok(Vec::new())
        }

        async fn product_url_field(
            &self,
            _: u64,
            _: &str,
            _: &str,
        ) -> Result<Option<String>, super::super::gateway::GatewayError> {
            Ok(None)
        }

        async fn update_product_status(
            &self,
            product_id: u64,
            status: ProductStatus,
        ) -> Result<(), super::super::gateway::GatewayError> {
            if self.reject {
                return Err(super::super::gateway::GatewayError::Upstream {
                    status: 422,
                    body: "cannot archive".into(),
                });
            }
            self.mutations.lock().unwrap().push((product_id, status));
            Ok(())
        }
    }

    #[test]
    fn test_decision_table() {
        assert_eq!(decide(&outcome(Classification::Ok, None), 2), Remediation::Keep);
        assert_eq!(
            decide(&outcome(Classification::Ok, Some(StockSignal::InStock)), 2),
            Remediation::Keep
        );
        assert_eq!(
            decide(&outcome(Classification::Ok, Some(StockSignal::OutOfStock)), 2),
            Remediation::Archive
        );
        assert_eq!(
            decide(
                &outcome(Classification::Ok, Some(StockSignal::LowStock { count: 1 })),
                2
            ),
            Remediation::Draft
        );
        // Above threshold keeps.
        assert_eq!(
            decide(
                &outcome(Classification::Ok, Some(StockSignal::LowStock { count: 3 })),
                2
            ),
            Remediation::Keep
        );
        assert_eq!(
            decide(&outcome(Classification::NotFound, None), 2),
            Remediation::Archive
        );
        assert_eq!(
            decide(&outcome(Classification::BrokenRedirectLoop, None), 2),
            Remediation::Archive
        );
        assert_eq!(
            decide(&outcome(Classification::ServerError, None), 2),
            Remediation::Archive
        );
        assert_eq!(
            decide(&outcome(Classification::Unreachable, None), 2),
            Remediation::Archive
        );
        assert_eq!(
            decide(&outcome(Classification::ClientError, None), 2),
            Remediation::Flag
        );
        assert_eq!(decide(&outcome(Classification::NoUrl, None), 2), Remediation::Keep);
    }

    #[tokio::test]
    async fn test_dry_run_withholds_mutation() {
        let api = Arc::new(RecordingApi::default());
        let applier = ActionApplier::new(
            api.clone(),
            ActionPolicy {
                dry_run: true,
                auto_draft: true,
                auto_archive: true,
            },
        );

        let (action, err) = applier
            .apply(&candidate(ProductStatus::Active), Remediation::Archive)
            .await;
        assert_eq!(action, Action::WouldArchive);
        assert!(err.is_none());
        assert!(api.mutations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_auto_flag_withholds() {
        let api = Arc::new(RecordingApi::default());
        let applier = ActionApplier::new(
            api.clone(),
            ActionPolicy {
                dry_run: false,
                auto_draft: false,
                auto_archive: true,
            },
        );

        let (action, _) = applier
            .apply(&candidate(ProductStatus::Active), Remediation::Draft)
            .await;
        assert_eq!(action, Action::WouldDraft);
        assert!(api.mutations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_live_mutation_applied() {
        let api = Arc::new(RecordingApi::default());
        let applier = ActionApplier::new(
            api.clone(),
            ActionPolicy {
                dry_run: false,
                auto_draft: true,
                auto_archive: true,
            },
        );

        let (action, err) = applier
            .apply(&candidate(ProductStatus::Active), Remediation::Archive)
            .await;
        assert_eq!(action, Action::Archive);
        assert!(err.is_none());
        assert_eq!(
            *api.mutations.lock().unwrap(),
            vec![(7, ProductStatus::Archived)]
        );
    }

    #[tokio::test]
    async fn test_already_in_target_status_skips_mutation() {
        let api = Arc::new(RecordingApi::default());
        let applier = ActionApplier::new(
            api.clone(),
            ActionPolicy {
                dry_run: false,
                auto_draft: true,
                auto_archive: true,
            },
        );

        let (action, err) = applier
            .apply(&candidate(ProductStatus::Archived), Remediation::Archive)
            .await;
        assert_eq!(action, Action::Archive);
        assert!(err.is_none());
        assert!(api.mutations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_mutation_recorded_per_row() {
        let api = Arc::new(RecordingApi {
            reject: true,
            ..RecordingApi::default()
        });
        let applier = ActionApplier::new(
            api,
            ActionPolicy {
                dry_run: false,
                auto_draft: true,
                auto_archive: true,
            },
        );

        let (action, err) = applier
            .apply(&candidate(ProductStatus::Active), Remediation::Archive)
            .await;
        assert_eq!(action, Action::WouldArchive);
        assert!(err.unwrap().contains("cannot archive"));
    }
}
