//! API endpoints for the abuse shield.
//!
//! This module provides the administrative HTTP endpoints (health, metrics,
//! block management) along with the screening middleware and the upstream
//! proxy that together make up the protected surface.

pub mod middleware;
pub mod proxy;

use std::sync::Arc;
use actix_web::{web, HttpResponse, Responder};
use chrono::{TimeZone, Utc};
use log::info;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};

use crate::core::shield::Shield;

pub use middleware::ShieldMiddleware;
pub use proxy::{forward, ProxyState};

pub struct ApiState {
    pub shield: Arc<Shield>,
    /// Absent when no recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(web::resource("/metrics").route(web::get().to(render_metrics)))
            .service(web::resource("/stats").route(web::get().to(stats)))
            .service(web::resource("/blocks").route(web::post().to(create_block)))
            .service(
                web::resource("/blocks/{client_id}")
                    .route(web::get().to(block_status))
                    .route(web::delete().to(remove_block)),
            ),
    );
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Manual block request
#[derive(Debug, Serialize, Deserialize)]
pub struct BlockRequest {
    pub client_id: String,
    pub duration_secs: u64,
    #[serde(default = "default_block_reason")]
    pub reason: String,
}

fn default_block_reason() -> String {
    "manual".to_string()
}

/// Block status response
#[derive(Debug, Serialize, Deserialize)]
pub struct BlockStatusResponse {
    pub client_id: String,
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// RFC 3339 expiry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Prometheus exposition
async fn render_metrics(state: web::Data<ApiState>) -> impl Responder {
    match &state.metrics {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().finish(),
    }
}

async fn stats(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.shield.stats())
}

fn status_response(state: &ApiState, client_id: String) -> BlockStatusResponse {
    let now = state.shield.now();
    match state.shield.block_status(&client_id) {
        Some(entry) => BlockStatusResponse {
            blocked: true,
            expires_at: Utc
                .timestamp_millis_opt(entry.expires_at as i64)
                .single()
                .map(|t| t.to_rfc3339()),
            retry_after: Some(entry.retry_after_secs(now)),
            reason: Some(entry.reason),
            client_id,
        },
        None => BlockStatusResponse {
            client_id,
            blocked: false,
            reason: None,
            expires_at: None,
            retry_after: None,
        },
    }
}

/// Current block for a client
async fn block_status(state: web::Data<ApiState>, client_id: web::Path<String>) -> impl Responder {
    HttpResponse::Ok().json(status_response(&state, client_id.into_inner()))
}

/// Block a client manually
async fn create_block(state: web::Data<ApiState>, req: web::Json<BlockRequest>) -> impl Responder {
    let req = req.into_inner();
    if req.client_id.trim().is_empty() || req.duration_secs == 0 {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "VALIDATION_ERROR",
            "message": "client_id and a positive duration_secs are required",
        }));
    }
    info!("Manual block of {} for {}s ({})", req.client_id, req.duration_secs, req.reason);
    state
        .shield
        .block(&req.client_id, req.duration_secs.saturating_mul(1000), &req.reason);
    HttpResponse::Created().json(status_response(&state, req.client_id))
}

/// Lift a block; unknown clients are not an error
async fn remove_block(state: web::Data<ApiState>, client_id: web::Path<String>) -> impl Responder {
    if state.shield.unblock(&client_id) {
        info!("Manual unblock of {}", client_id);
    }
    HttpResponse::NoContent().finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use crate::core::audit::LogAuditSink;
    use crate::models::ShieldConfig;

    fn state() -> web::Data<ApiState> {
        let shield = Shield::new(ShieldConfig::default(), Arc::new(LogAuditSink)).unwrap();
        web::Data::new(ApiState {
            shield: Arc::new(shield),
            metrics: None,
        })
    }

    #[actix_web::test]
    async fn test_health_check() {
        let app = test::init_service(
            App::new()
                .app_data(state())
                .configure(config)
        ).await;

        let req = test::TestRequest::get().uri("/api/v1/health").to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn test_block_lifecycle() {
        let state = state();
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .configure(config)
        ).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/blocks")
            .set_json(BlockRequest {
                client_id: "10.0.0.9".to_string(),
                duration_secs: 120,
                reason: "abuse report".to_string(),
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let req = test::TestRequest::get().uri("/api/v1/blocks/10.0.0.9").to_request();
        let status: BlockStatusResponse = test::call_and_read_body_json(&app, req).await;
        assert!(status.blocked);
        assert_eq!(status.reason.as_deref(), Some("abuse report"));
        assert_eq!(status.retry_after, Some(120));
        assert!(status.expires_at.is_some());

        for _ in 0..2 {
            let req = test::TestRequest::delete().uri("/api/v1/blocks/10.0.0.9").to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        }
        assert!(state.shield.block_status("10.0.0.9").is_none());
    }

    #[actix_web::test]
    async fn test_invalid_block_request() {
        let app = test::init_service(
            App::new()
                .app_data(state())
                .configure(config)
        ).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/blocks")
            .set_json(serde_json::json!({"client_id": "x", "duration_secs": 0}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_stats_and_metrics_without_recorder() {
        let app = test::init_service(
            App::new()
                .app_data(state())
                .configure(config)
        ).await;

        let req = test::TestRequest::get().uri("/api/v1/stats").to_request();
        let stats: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(stats["active_blocks"], 0);

        let req = test::TestRequest::get().uri("/api/v1/metrics").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
