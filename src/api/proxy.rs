//! Forwarding of screened traffic to the protected upstream.

use std::time::Duration;
use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse, ResponseError};
use log::{debug, error};
use thiserror::Error;
use url::Url;
use crate::models::UpstreamConfig;

/// Headers that describe a single hop and are not forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
    "x-forwarded-for",
];

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("Unsupported method: {0}")]
    Method(String),
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Upstream(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": "UPSTREAM_UNAVAILABLE",
            "message": "Upstream service unavailable",
        }))
    }
}

pub struct ProxyState {
    client: reqwest::Client,
    upstream: Url,
}

impl ProxyState {
    pub fn new(config: &UpstreamConfig) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            upstream: Url::parse(&config.url)?,
        })
    }

    /// Upstream URL for a request path and query.
    pub fn target(&self, path_and_query: &str) -> Result<Url, ProxyError> {
        let base = self.upstream.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{}{}", base, path_and_query))?)
    }
}

/// Default service: forward the request upstream and relay the response.
pub async fn forward(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<ProxyState>,
) -> Result<HttpResponse, ProxyError> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target = state.target(path_and_query)?;
    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .map_err(|_| ProxyError::Method(req.method().to_string()))?;
    debug!("Forwarding {} {} to {}", req.method(), req.path(), target);

    let mut upstream_req = state.client.request(method, target);
    for (name, value) in req.headers() {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            upstream_req = upstream_req.header(name.as_str(), value.as_bytes());
        }
    }
    if let Some(peer) = req.peer_addr() {
        let forwarded = match req.headers().get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(chain) => format!("{}, {}", chain, peer.ip()),
            None => peer.ip().to_string(),
        };
        upstream_req = upstream_req.header("x-forwarded-for", forwarded);
    } else if let Some(chain) = req.headers().get("x-forwarded-for") {
        upstream_req = upstream_req.header("x-forwarded-for", chain.as_bytes());
    }

    let upstream_res = upstream_req.body(body).send().await.map_err(|e| {
        error!("Upstream request for {} failed: {}", req.path(), e);
        ProxyError::Upstream(e)
    })?;

    let status = StatusCode::from_u16(upstream_res.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = HttpResponse::build(status);
    for (name, value) in upstream_res.headers() {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            response.append_header((name.as_str(), value.as_bytes().to_vec()));
        }
    }
    Ok(response.body(upstream_res.bytes().await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_joins_path_and_query() {
        let state = ProxyState::new(&UpstreamConfig {
            url: "http://127.0.0.1:3000/".into(),
            timeout_ms: 1_000,
        })
        .unwrap();
        assert_eq!(
            state.target("/users?page=2").unwrap().as_str(),
            "http://127.0.0.1:3000/users?page=2"
        );
    }

    #[test]
    fn test_invalid_upstream_rejected() {
        let result = ProxyState::new(&UpstreamConfig {
            url: "not a url".into(),
            timeout_ms: 1_000,
        });
        assert!(matches!(result, Err(ProxyError::InvalidUrl(_))));
    }

    #[actix_web::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let state = web::Data::new(
            ProxyState::new(&UpstreamConfig {
                url: "http://127.0.0.1:9".into(),
                timeout_ms: 500,
            })
            .unwrap(),
        );
        let app = actix_web::test::init_service(
            actix_web::App::new()
                .app_data(state)
                .default_service(web::to(forward)),
        )
        .await;
        let req = actix_web::test::TestRequest::get().uri("/anything").to_request();
        let resp = actix_web::test::call_service(&app, req).await;
        assert!(resp.status().is_server_error());
    }
}
