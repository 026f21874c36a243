//! Maintenance Gate Service
//!
//! This is the main entry point for the maintenance gate service.
//! It initializes the application components and starts the web server.

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::{info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;
use redis::Client;
use std::sync::Arc;

use maintenance_gate_service::api::{self, ApiState};
use maintenance_gate_service::config;
use maintenance_gate_service::core::{Analytics, PolicyEvaluator, RedisStore, SettingsService};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting Maintenance Gate Service...");

    // Load configuration
    let config = config::load_config().context("Failed to load configuration")?;
    if config.gate.secret_key.is_empty() {
        warn!("gate.secret_key is empty; access cookies and analytics hashes are not secure");
    }

    // Initialize Redis-backed stores
    let redis_client =
        Client::open(config.redis.url.as_str()).context("Failed to create Redis client")?;
    let store = Arc::new(RedisStore::new(redis_client));

    // Install the Prometheus exporter
    PrometheusBuilder::new()
        .with_http_listener(([127, 0, 0, 1], config.server.metrics_port))
        .install()
        .context("Failed to install metrics exporter")?;

    // Create API state
    let state = web::Data::new(ApiState {
        evaluator: PolicyEvaluator::new(
            config.gate.secret_key.clone(),
            config.gate.enhanced_tier,
        ),
        settings: SettingsService::new(store.clone()),
        analytics: Analytics::new(store.clone(), store, config.gate.secret_key.clone()),
        analytics_enabled: config.analytics.enabled,
    });

    // Start HTTP server
    HttpServer::new(move || App::new().app_data(state.clone()).configure(api::config))
        .bind((config.server.host.as_str(), config.server.port))?
        .run()
        .await?;

    Ok(())
}
