use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

/// Shopify product lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProductStatus {
    Active,
    Draft,
    Archived,
}

/// Status filter for scoping a job. `Any` disables status filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StatusFilter {
    #[default]
    Active,
    Draft,
    Archived,
    Any,
}

impl StatusFilter {
    pub fn matches(&self, status: ProductStatus) -> bool {
        match self {
            StatusFilter::Any => true,
            StatusFilter::Active => status == ProductStatus::Active,
            StatusFilter::Draft => status == ProductStatus::Draft,
            StatusFilter::Archived => status == ProductStatus::Archived,
        }
    }

    /// Query parameter value for the product listing endpoint, if any.
    pub fn as_query_param(&self) -> Option<&'static str> {
        match self {
            StatusFilter::Any => None,
            StatusFilter::Active => Some("active"),
            StatusFilter::Draft => Some("draft"),
            StatusFilter::Archived => Some("archived"),
        }
    }
}

/// One product/URL pair scheduled for verification.
///
/// `target_url` is `None` when the configured metafield is absent or holds no
/// URL — that is a classifiable state, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub product_id: u64,
    pub title: String,
    pub status: ProductStatus,
    pub target_url: Option<String>,
    pub handle: Option<String>,
    pub image: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}
