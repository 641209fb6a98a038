//! Link Verifier
//!
//! Checks a single URL with redirects followed manually so the full chain is
//! recorded and the depth budget is enforced exactly. Classification is a
//! pure function of the terminal condition; the 2xx body is captured for the
//! content classifier.

use std::time::Duration;

use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use url::Url;

use crate::models::outcome::{Classification, VerificationOutcome};

/// Map a terminal HTTP status to its classification.
pub fn classify_status(status: u16) -> Classification {
    match status {
        200..=299 => Classification::Ok,
        404 => Classification::NotFound,
        400..=499 => Classification::ClientError,
        500..=599 => Classification::ServerError,
        _ => Classification::Unreachable,
    }
}

/// Outcome plus the terminal page body when one was read.
#[derive(Debug)]
pub struct Verified {
    pub outcome: VerificationOutcome,
    pub body: Option<String>,
}

impl Verified {
    fn without_body(outcome: VerificationOutcome) -> Self {
        Self {
            outcome,
            body: None,
        }
    }
}

pub struct LinkChecker {
    http: reqwest::Client,
    max_redirects: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckerError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

impl LinkChecker {
    pub fn new(timeout: Duration, max_redirects: u32) -> Result<Self, CheckerError> {
        // Redirects handled by hand below; the client must not follow them.
        let http = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(timeout)
            .user_agent(concat!("shopify-linkcheck/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            max_redirects,
        })
    }

    /// Verify one URL. Never fails: every error condition maps to a
    /// classification on the returned outcome.
    pub async fn check(&self, raw_url: &str) -> Verified {
        let mut chain: Vec<String> = Vec::new();

        let mut current = match Url::parse(raw_url) {
            Ok(u) => u,
            Err(e) => {
                return Verified::without_body(VerificationOutcome {
                    classification: Classification::Unreachable,
                    http_status: None,
                    final_url: None,
                    redirect_chain: chain,
                    stock_signal: None,
                    error: Some(format!("invalid URL: {e}")),
                });
            }
        };

        loop {
            let response = match self.http.get(current.clone()).send().await {
                Ok(r) => r,
                Err(e) => {
                    let error = if e.is_timeout() {
                        "request timed out".to_string()
                    } else if e.is_connect() {
                        format!("connection failed: {e}")
                    } else {
                        e.to_string()
                    };
                    return Verified::without_body(VerificationOutcome {
                        classification: Classification::Unreachable,
                        http_status: None,
                        final_url: final_url(raw_url, &current),
                        redirect_chain: chain,
                        stock_signal: None,
                        error: Some(error),
                    });
                }
            };

            let status = response.status();

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);

                let Some(location) = location else {
                    return Verified::without_body(VerificationOutcome {
                        classification: Classification::Unreachable,
                        http_status: Some(status.as_u16()),
                        final_url: final_url(raw_url, &current),
                        redirect_chain: chain,
                        stock_signal: None,
                        error: Some("redirect response without Location header".to_string()),
                    });
                };

                if chain.len() as u32 >= self.max_redirects {
                    return Verified::without_body(VerificationOutcome {
                        classification: Classification::BrokenRedirectLoop,
                        http_status: Some(status.as_u16()),
                        final_url: final_url(raw_url, &current),
                        redirect_chain: chain,
                        stock_signal: None,
                        error: Some(format!(
                            "redirect limit of {} exceeded",
                            self.max_redirects
                        )),
                    });
                }

                // Location may be relative; resolve against the current URL.
                current = match current.join(&location) {
                    Ok(u) => u,
                    Err(e) => {
                        return Verified::without_body(VerificationOutcome {
                            classification: Classification::Unreachable,
                            http_status: Some(status.as_u16()),
                            final_url: final_url(raw_url, &current),
                            redirect_chain: chain,
                            stock_signal: None,
                            error: Some(format!("unresolvable redirect target: {e}")),
                        });
                    }
                };
                chain.push(current.to_string());
                continue;
            }

            let classification = classify_status(status.as_u16());
            let body = if classification == Classification::Ok {
                response.text().await.ok()
            } else {
                None
            };

            return Verified {
                outcome: VerificationOutcome {
                    classification,
                    http_status: Some(status.as_u16()),
                    final_url: final_url(raw_url, &current),
                    redirect_chain: chain,
                    stock_signal: None,
                    error: None,
                },
                body,
            };
        }
    }
}

fn final_url(requested: &str, current: &Url) -> Option<String> {
    let resolved = current.to_string();
    if resolved == requested {
        None
    } else {
        Some(resolved)
    }
}
