use serde::{Deserialize, Serialize};
use strum::Display;

/// Terminal classification of a single URL check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Classification {
    /// Final response was 2xx.
    Ok,
    /// Final response was 404.
    NotFound,
    /// Final response was a non-404 4xx.
    ClientError,
    /// Final response was 5xx.
    ServerError,
    /// DNS/TLS/connect failure or timeout; no usable response.
    Unreachable,
    /// Redirect depth budget exhausted before a terminal response.
    BrokenRedirectLoop,
    /// The candidate carried no URL; no network call was made.
    NoUrl,
}

impl Classification {
    pub fn is_broken(&self) -> bool {
        matches!(
            self,
            Classification::NotFound
                | Classification::ClientError
                | Classification::ServerError
                | Classification::Unreachable
                | Classification::BrokenRedirectLoop
        )
    }
}

/// Content-derived stock signal, evaluated only on `ok` pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum StockSignal {
    OutOfStock,
    LowStock { count: u32 },
    InStock,
    Unknown,
}

/// Result of checking one URL, including the full redirect trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub classification: Classification,
    pub http_status: Option<u16>,
    /// Resolved URL when it differs from the requested one.
    pub final_url: Option<String>,
    /// Each followed redirect target, in traversal order.
    #[serde(default)]
    pub redirect_chain: Vec<String>,
    pub stock_signal: Option<StockSignal>,
    pub error: Option<String>,
}

impl VerificationOutcome {
    /// Outcome for a candidate with no URL; short-circuits before any I/O.
    pub fn no_url() -> Self {
        Self {
            classification: Classification::NoUrl,
            http_status: None,
            final_url: None,
            redirect_chain: Vec::new(),
            stock_signal: None,
            error: None,
        }
    }
}

/// Remediation action recorded on a result row. `would_*` variants mark
/// actions computed but not applied (dry run, disabled auto flag, or an
/// upstream rejection recorded in `action_error`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Action {
    Keep,
    Flag,
    Draft,
    WouldDraft,
    Archive,
    WouldArchive,
}
