//! Rate-Limited Shopify Admin API Gateway
//!
//! Every outbound call to the upstream API goes through this module. A pacing
//! gate guarantees a minimum spacing between dispatches (FIFO, via the tokio
//! mutex wake order), and rate-limit signals from response headers widen the
//! spacing reactively. 429/5xx/transport failures retry with capped
//! exponential backoff and jitter before surfacing to the caller.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, LINK, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::models::product::{Candidate, ProductStatus, StatusFilter};

/// Shopify's maximum page size for listing endpoints.
pub const PAGE_LIMIT: usize = 250;

const RATE_LIMIT_HEADER: &str = "X-Shopify-Shop-Api-Call-Limit";
const THROTTLE_THRESHOLD: f64 = 0.8;
const THROTTLE_PENALTY: Duration = Duration::from_millis(500);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream authentication failed (HTTP {0})")]
    Auth(u16),

    #[error("rate limited after {0} retries")]
    RateLimited(u32),

    #[error("upstream error HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("unexpected response shape: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Upstream validation rejections (422) are row-level, not job-level.
    pub fn is_validation(&self) -> bool {
        matches!(self, GatewayError::Upstream { status: 422, .. })
    }
}

/// Capped exponential backoff with full jitter.
pub fn backoff_with_jitter(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE
        .checked_mul(2u32.saturating_pow(attempt))
        .unwrap_or(BACKOFF_CAP)
        .min(BACKOFF_CAP);
    exp.mul_f64(rand::thread_rng().gen::<f64>())
}

/// Parse the `Link` pagination header, returning the `page_info` cursor of
/// the `next` relation if present.
pub fn parse_next_page_info(header: &str) -> Option<String> {
    for part in header.split(',') {
        let part = part.trim();
        let (url_part, rel_part) = part.split_once(';')?;
        if !rel_part.contains("rel=\"next\"") {
            continue;
        }
        let url = url_part.trim().trim_start_matches('<').trim_end_matches('>');
        for pair in url.split('?').nth(1)?.split('&') {
            if let Some(value) = pair.strip_prefix("page_info=") {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Parse `X-Shopify-Shop-Api-Call-Limit: used/bucket`.
pub fn parse_call_limit(header: &str) -> Option<(u32, u32)> {
    let (used, bucket) = header.split_once('/')?;
    Some((used.trim().parse().ok()?, bucket.trim().parse().ok()?))
}

fn retry_after_seconds(headers: &HeaderMap) -> f64 {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(2.0)
}

/// Minimum inter-call spacing. Callers queue on the internal mutex (FIFO
/// wakeups), so no two dispatches happen closer together than the spacing,
/// and no caller jumps the queue.
pub struct RateBudget {
    min_spacing: Duration,
    next_slot: Mutex<Instant>,
}

impl RateBudget {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Wait for the next dispatch slot and reserve the one after it.
    pub async fn acquire(&self) {
        let mut slot = self.next_slot.lock().await;
        let now = Instant::now();
        if *slot > now {
            tokio::time::sleep(*slot - now).await;
        }
        *slot = Instant::now() + self.min_spacing;
    }

    /// Push the next slot further out in response to a rate-limit hint.
    pub async fn widen(&self, penalty: Duration) {
        let mut slot = self.next_slot.lock().await;
        let base = (*slot).max(Instant::now());
        *slot = base + penalty;
    }
}

/// Decoded upstream response: JSON body plus the next pagination cursor.
#[derive(Debug)]
pub struct ApiPage {
    pub body: Value,
    pub next_page_info: Option<String>,
}

/// Abstraction over the upstream catalog operations the pipeline needs.
/// Implemented by [`ShopifyGateway`] for production and by in-memory fakes in
/// tests.
#[async_trait]
pub trait CatalogApi: Send + Sync {
    /// Cursor-paginated product listing.
    async fn list_products(
        &self,
        status: StatusFilter,
        updated_since: Option<DateTime<Utc>>,
        page_info: Option<&str>,
    ) -> Result<(Vec<Candidate>, Option<String>), GatewayError>;

    /// Cursor-paginated collection membership (product IDs only).
    async fn list_collection_members(
        &self,
        collection_id: u64,
        page_info: Option<&str>,
    ) -> Result<(Vec<u64>, Option<String>), GatewayError>;

    /// Hydrate full product records for up to [`PAGE_LIMIT`] IDs.
    async fn products_by_ids(&self, ids: &[u64]) -> Result<Vec<Candidate>, GatewayError>;

    /// Value of the configured URL metafield for one product, if set.
    async fn product_url_field(
        &self,
        product_id: u64,
        namespace: &str,
        key: &str,
    ) -> Result<Option<String>, GatewayError>;

    /// Status mutation. A 422 surfaces as a validation error the caller
    /// records per-row.
    async fn update_product_status(
        &self,
        product_id: u64,
        status: ProductStatus,
    ) -> Result<(), GatewayError>;
}

/// Shopify Admin REST client. The single component issuing network calls to
/// the upstream API; everything else is a transformation over what it
/// returns.
pub struct ShopifyGateway {
    http: reqwest::Client,
    base_url: String,
    budget: RateBudget,
    max_retries: u32,
}

impl ShopifyGateway {
    pub fn new(
        shop: &str,
        token: &str,
        api_version: &str,
        min_spacing: Duration,
        max_retries: u32,
    ) -> Result<Self, GatewayError> {
        let shop = shop
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        let base_url = format!("https://{shop}/admin/api/{api_version}");
        Self::from_base_url(&base_url, token, min_spacing, max_retries)
    }

    /// Build against an explicit base URL. Tests point this at a local mock.
    pub fn from_base_url(
        base_url: &str,
        token: &str,
        min_spacing: Duration,
        max_retries: u32,
    ) -> Result<Self, GatewayError> {
        let mut headers = HeaderMap::new();
        let mut token_value =
            HeaderValue::from_str(token).map_err(|e| GatewayError::Decode(e.to_string()))?;
        token_value.set_sensitive(true);
        headers.insert("X-Shopify-Access-Token", token_value);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            budget: RateBudget::new(min_spacing),
            max_retries,
        })
    }

    /// Paced, retrying request. Every upstream call funnels through here.
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<ApiPage, GatewayError> {
        let url = format!("{}/{}", self.base_url, path);
        let mut attempt = 0u32;

        loop {
            self.budget.acquire().await;

            let mut req = self.http.request(method.clone(), &url);
            if !query.is_empty() {
                req = req.query(query);
            }
            if let Some(json) = body {
                req = req.json(json);
            }

            let response = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(GatewayError::Transport(e));
                    }
                    let delay = backoff_with_jitter(attempt);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transport error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
            };

            // Widen spacing when the call-limit bucket runs hot.
            if let Some(header) = response
                .headers()
                .get(RATE_LIMIT_HEADER)
                .and_then(|v| v.to_str().ok())
            {
                if let Some((used, bucket)) = parse_call_limit(header) {
                    if bucket > 0 && used as f64 / bucket as f64 >= THROTTLE_THRESHOLD {
                        tracing::debug!(used, bucket, "call limit running hot, widening spacing");
                        self.budget.widen(THROTTLE_PENALTY).await;
                    }
                }
            }

            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt >= self.max_retries {
                    return Err(GatewayError::RateLimited(self.max_retries));
                }
                let secs = retry_after_seconds(response.headers());
                tracing::warn!(retry_after_secs = secs, attempt, "rate limited (429), retrying");
                tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                attempt += 1;
                continue;
            }

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(GatewayError::Auth(status.as_u16()));
            }

            if status.is_server_error() {
                if attempt >= self.max_retries {
                    let body = response.text().await.unwrap_or_default();
                    return Err(GatewayError::Upstream {
                        status: status.as_u16(),
                        body,
                    });
                }
                let delay = backoff_with_jitter(attempt);
                tracing::warn!(
                    status = status.as_u16(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "server error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(GatewayError::Upstream {
                    status: status.as_u16(),
                    body,
                });
            }

            let next_page_info = response
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_next_page_info);

            let body: Value = response.json().await?;
            return Ok(ApiPage {
                body,
                next_page_info,
            });
        }
    }
}

fn parse_product(value: &Value) -> Option<Candidate> {
    let id = value.get("id")?.as_u64()?;
    let status = match value.get("status").and_then(Value::as_str) {
        Some("active") => ProductStatus::Active,
        Some("draft") => ProductStatus::Draft,
        Some("archived") => ProductStatus::Archived,
        _ => return None,
    };
    let updated_at = value
        .get("updated_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let image = value
        .pointer("/images/0/src")
        .and_then(Value::as_str)
        .map(str::to_string);

    Some(Candidate {
        product_id: id,
        title: value
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        status,
        target_url: None,
        handle: value
            .get("handle")
            .and_then(Value::as_str)
            .map(str::to_string),
        image,
        updated_at,
    })
}

fn parse_products(body: &Value) -> Result<Vec<Candidate>, GatewayError> {
    let items = body
        .get("products")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::Decode("missing products array".to_string()))?;
    Ok(items.iter().filter_map(parse_product).collect())
}

#[async_trait]
impl CatalogApi for ShopifyGateway {
    async fn list_products(
        &self,
        status: StatusFilter,
        updated_since: Option<DateTime<Utc>>,
        page_info: Option<&str>,
    ) -> Result<(Vec<Candidate>, Option<String>), GatewayError> {
        let mut query: Vec<(&str, String)> = vec![("limit", PAGE_LIMIT.to_string())];
        if let Some(value) = status.as_query_param() {
            query.push(("status", value.to_string()));
        }
        if let Some(since) = updated_since {
            query.push(("updated_at_min", since.to_rfc3339()));
        }
        if let Some(cursor) = page_info {
            query.push(("page_info", cursor.to_string()));
        }

        let page = self.request(Method::GET, "products.json", &query, None).await?;
        let products = parse_products(&page.body)?;
        tracing::debug!(count = products.len(), "fetched product page");
        Ok((products, page.next_page_info))
    }

    async fn list_collection_members(
        &self,
        collection_id: u64,
        page_info: Option<&str>,
    ) -> Result<(Vec<u64>, Option<String>), GatewayError> {
        let mut query: Vec<(&str, String)> = vec![
            ("collection_id", collection_id.to_string()),
            ("limit", PAGE_LIMIT.to_string()),
        ];
        if let Some(cursor) = page_info {
            query.push(("page_info", cursor.to_string()));
        }

        let page = self.request(Method::GET, "collects.json", &query, None).await?;
        let ids = page
            .body
            .get("collects")
            .and_then(Value::as_array)
            .ok_or_else(|| GatewayError::Decode("missing collects array".to_string()))?
            .iter()
            .filter_map(|c| c.get("product_id").and_then(Value::as_u64))
            .collect();
        Ok((ids, page.next_page_info))
    }

    async fn products_by_ids(&self, ids: &[u64]) -> Result<Vec<Candidate>, GatewayError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let joined = ids
            .iter()
            .take(PAGE_LIMIT)
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let query: Vec<(&str, String)> =
            vec![("ids", joined), ("limit", PAGE_LIMIT.to_string())];

        let page = self.request(Method::GET, "products.json", &query, None).await?;
        parse_products(&page.body)
    }

    async fn product_url_field(
        &self,
        product_id: u64,
        namespace: &str,
        key: &str,
    ) -> Result<Option<String>, GatewayError> {
        let query: Vec<(&str, String)> = vec![
            ("namespace", namespace.to_string()),
            ("key", key.to_string()),
        ];
        let path = format!("products/{product_id}/metafields.json");
        let page = self.request(Method::GET, &path, &query, None).await?;

        let value = page
            .body
            .get("metafields")
            .and_then(Value::as_array)
            .and_then(|fields| fields.first())
            .and_then(|f| f.get("value"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|v| !v.trim().is_empty());
        Ok(value)
    }

    async fn update_product_status(
        &self,
        product_id: u64,
        status: ProductStatus,
    ) -> Result<(), GatewayError> {
        let path = format!("products/{product_id}.json");
        let body = serde_json::json!({
            "product": { "id": product_id, "status": status }
        });
        self.request(Method::PUT, &path, &[], Some(&body)).await?;
        tracing::info!(product_id, status = %status, "updated product status");
        Ok(())
    }
}
