use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Shop domain, e.g. "my-store.myshopify.com"
    pub shop: String,

    /// Admin API access token
    pub admin_token: String,

    /// Admin API version
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Metafield namespace holding the external URL
    #[serde(default = "default_url_field_namespace")]
    pub url_field_namespace: String,

    /// Metafield key holding the external URL
    #[serde(default = "default_url_field_key")]
    pub url_field_key: String,

    /// Minimum spacing between upstream API calls, in milliseconds
    #[serde(default = "default_min_call_spacing_ms")]
    pub min_call_spacing_ms: u64,

    /// Retry budget for rate-limited/failed upstream calls
    #[serde(default = "default_max_api_retries")]
    pub max_api_retries: u32,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_api_version() -> String {
    "2024-10".to_string()
}

fn default_url_field_namespace() -> String {
    "custom".to_string()
}

fn default_url_field_key() -> String {
    "external_url".to_string()
}

fn default_min_call_spacing_ms() -> u64 {
    500
}

fn default_max_api_retries() -> u32 {
    5
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
