mod app_state;
mod config;
mod models;
mod routes;
mod services;

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use app_state::AppState;
use config::AppConfig;
use services::catalog::UrlField;
use services::gateway::ShopifyGateway;
use services::jobs::JobManager;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing shopify-linkcheck server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_histogram!(
        "linkcheck_verify_duration_seconds",
        "Time to verify a single product URL"
    );
    metrics::describe_counter!(
        "linkcheck_jobs_submitted_total",
        "Total verification jobs submitted"
    );
    metrics::describe_counter!(
        "linkcheck_jobs_completed_total",
        "Total verification jobs completed"
    );
    metrics::describe_counter!(
        "linkcheck_jobs_failed_total",
        "Total verification jobs that failed"
    );
    metrics::describe_counter!("linkcheck_rows_total", "Total result rows produced");
    metrics::describe_counter!(
        "linkcheck_broken_links_total",
        "Total links classified as broken"
    );
    metrics::describe_counter!(
        "linkcheck_mutations_total",
        "Total product status mutations applied"
    );
    metrics::describe_gauge!("linkcheck_jobs_active", "Jobs currently queued or running");

    // Initialize the Shopify Admin API gateway
    tracing::info!(shop = %config.shop, "Initializing Shopify gateway");
    let gateway = ShopifyGateway::new(
        &config.shop,
        &config.admin_token,
        &config.api_version,
        Duration::from_millis(config.min_call_spacing_ms),
        config.max_api_retries,
    )
    .expect("Failed to initialize Shopify gateway");

    let manager = Arc::new(JobManager::new(
        Arc::new(gateway),
        UrlField {
            namespace: config.url_field_namespace.clone(),
            key: config.url_field_key.clone(),
        },
    ));

    // Evict retired jobs periodically
    {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            loop {
                ticker.tick().await;
                manager.cleanup_old_jobs();
            }
        });
    }

    // Create shared application state
    let state = AppState::new(manager);

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/jobs", post(routes::jobs::submit_job))
        .route("/api/v1/jobs/{job_id}", get(routes::jobs::get_job))
        .route(
            "/api/v1/jobs/{job_id}/results",
            get(routes::jobs::get_results),
        )
        .route(
            "/api/v1/jobs/{job_id}/events",
            get(routes::jobs::job_events),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(1024 * 1024)); // 1 MB limit

    tracing::info!("Starting shopify-linkcheck on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Server error");
}
