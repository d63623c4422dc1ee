//! Abuse Shield
//!
//! This is the main entry point for the abuse shield. It initializes the
//! protection pipeline, starts the cleanup scheduler and runs a reverse
//! proxy that screens traffic before forwarding it upstream.

use std::sync::Arc;
use std::time::Duration;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::{info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;

use abuse_shield::api::{self, ApiState, ProxyState, ShieldMiddleware};
use abuse_shield::config;
use abuse_shield::core::{
    AuditSink, CleanupScheduler, LogAuditSink, RedisAuditSink, Shield, WebhookAuditSink,
};
use abuse_shield::models::{AuditConfig, AuditSinkKind};

fn audit_sink(config: &AuditConfig) -> anyhow::Result<Arc<dyn AuditSink>> {
    let sink: Arc<dyn AuditSink> = match config.sink {
        AuditSinkKind::Log => Arc::new(LogAuditSink),
        AuditSinkKind::Redis => {
            let client = redis::Client::open(config.redis_url.as_str())
                .context("Failed to create Redis client")?;
            Arc::new(RedisAuditSink::new(client, config.redis_key.clone(), config.max_entries))
        }
        AuditSinkKind::Webhook => {
            let url = config
                .webhook_url
                .clone()
                .context("audit.webhook_url is required for the webhook sink")?;
            Arc::new(WebhookAuditSink::new(url))
        }
    };
    Ok(sink)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting Abuse Shield...");

    // Load configuration
    let config = config::load_config().context("Failed to load configuration")?;

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Metrics recorder unavailable: {}", e);
            None
        }
    };

    let shield = Shield::new(config.shield.clone(), audit_sink(&config.audit)?)
        .context("Failed to compile detection patterns")?;
    let shield = Arc::new(shield);

    let cleanup = config.shield.cleanup.enabled.then(|| {
        CleanupScheduler::new(
            shield.clone(),
            Duration::from_secs(config.shield.cleanup.interval_secs),
        )
        .start()
    });

    let proxy = web::Data::new(ProxyState::new(&config.upstream).context("Invalid upstream")?);
    let state = web::Data::new(ApiState {
        shield: shield.clone(),
        metrics,
    });
    let body_limit = config.shield.size.max_content_length as usize;

    info!(
        "Listening on {}:{}, forwarding to {}",
        config.server.host, config.server.port, config.upstream.url
    );

    // Start HTTP server
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(proxy.clone())
            .app_data(web::PayloadConfig::new(body_limit))
            .configure(api::config)
            .service(
                web::scope("")
                    .wrap(ShieldMiddleware::new(shield.clone()))
                    .default_service(web::to(api::forward)),
            )
    })
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await?;

    if let Some(cleanup) = cleanup {
        cleanup.stop().await;
    }
    info!("Abuse Shield stopped");
    Ok(())
}
