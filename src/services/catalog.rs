//! Paginated Candidate Fetcher
//!
//! Enumerates the products a job covers and resolves each one's target URL
//! from the configured metafield. Two modes: direct (cursor-forward product
//! listing) and collection (union of collection members, hydrated by ID).

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;

use crate::models::job::JobScope;
use crate::models::product::Candidate;

use super::gateway::{CatalogApi, GatewayError, PAGE_LIMIT};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Metafield coordinates holding the product's external URL.
#[derive(Debug, Clone)]
pub struct UrlField {
    pub namespace: String,
    pub key: String,
}

impl Default for UrlField {
    fn default() -> Self {
        Self {
            namespace: "custom".to_string(),
            key: "external_url".to_string(),
        }
    }
}

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"https?://[^\s"'<>]+"#).unwrap())
}

/// First URL found in a metafield value. The value may carry surrounding
/// text or HTML-encoded ampersands; trailing sentence punctuation is not
/// part of the URL.
pub fn extract_first_url(value: &str) -> Option<String> {
    let unescaped = value
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    let found = url_pattern().find(&unescaped)?;
    let trimmed = found
        .as_str()
        .trim_end_matches(['.', ',', ';', ':', '!', '?', ')']);
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Builds the deduplicated candidate set for a job scope.
pub struct CandidateFetcher {
    api: Arc<dyn CatalogApi>,
    url_field: UrlField,
}

impl CandidateFetcher {
    pub fn new(api: Arc<dyn CatalogApi>, url_field: UrlField) -> Self {
        Self { api, url_field }
    }

    /// Full candidate set for the scope: every in-scope product exactly once,
    /// each with its resolved target URL. Upstream failure here is fatal to
    /// the job; no partial set is returned.
    pub async fn fetch(&self, scope: &JobScope) -> Result<Vec<Candidate>, FetchError> {
        let mut candidates = if scope.collection_ids.is_empty() {
            self.fetch_direct(scope).await?
        } else {
            self.fetch_collections(scope).await?
        };

        for candidate in &mut candidates {
            candidate.target_url = self
                .api
                .product_url_field(
                    candidate.product_id,
                    &self.url_field.namespace,
                    &self.url_field.key,
                )
                .await?
                .and_then(|value| extract_first_url(&value));
        }

        tracing::info!(count = candidates.len(), "candidate set built");
        Ok(candidates)
    }

    async fn fetch_direct(&self, scope: &JobScope) -> Result<Vec<Candidate>, FetchError> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;

        loop {
            let (page, next) = self
                .api
                .list_products(scope.status, scope.updated_since, cursor.as_deref())
                .await?;
            for product in page {
                if seen.insert(product.product_id) {
                    out.push(product);
                }
            }
            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        Ok(out)
    }

    async fn fetch_collections(&self, scope: &JobScope) -> Result<Vec<Candidate>, FetchError> {
        let mut member_ids = HashSet::new();
        for &collection_id in &scope.collection_ids {
            let mut cursor: Option<String> = None;
            loop {
                let (ids, next) = self
                    .api
                    .list_collection_members(collection_id, cursor.as_deref())
                    .await?;
                member_ids.extend(ids);
                match next {
                    Some(c) => cursor = Some(c),
                    None => break,
                }
            }
        }

        // Deterministic hydration order.
        let mut sorted: Vec<u64> = member_ids.into_iter().collect();
        sorted.sort_unstable();

        let mut out = Vec::new();
        for chunk in sorted.chunks(PAGE_LIMIT) {
            let products = self.api.products_by_ids(chunk).await?;
            // Listing filters don't apply to ID hydration; filter client-side.
            out.extend(products.into_iter().filter(|p| {
                scope.status.matches(p.status)
                    && match (scope.updated_since, p.updated_at) {
                        (Some(since), Some(updated)) => updated >= since,
                        (Some(_), None) => false,
                        (None, _) => true,
                    }
            }));
        }
        Ok(out)
    }
}
