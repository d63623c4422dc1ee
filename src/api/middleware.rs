//! Actix middleware that screens every request through a [`Shield`].
//!
//! The request body is buffered (up to the configured size limit plus one
//! byte) so the pipeline can inspect it. When the payload inspector strips
//! script content, the cleaned body and query string replace the originals
//! before the wrapped service sees the request.

use std::rc::Rc;
use std::sync::Arc;
use actix_web::body::{EitherBody, MessageBody};
use actix_web::dev::{forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{self, HeaderName, HeaderValue};
use actix_web::http::{StatusCode, Uri};
use actix_web::web::{Bytes, BytesMut};
use actix_web::error::PayloadError;
use actix_web::{Error, HttpMessage, HttpResponse, ResponseError};
use futures::future::{ready, LocalBoxFuture, Ready};
use futures::{stream, StreamExt};
use log::warn;
use serde_json::{Map, Value};
use crate::core::error::ShieldError;
use crate::core::request::RequestDescriptor;
use crate::core::shield::Shield;

impl ResponseError for ShieldError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.code().status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        let rejection = self.rejection();
        let mut builder = HttpResponse::build(self.status_code());
        if let Some(retry_after) = rejection.retry_after {
            builder.insert_header((header::RETRY_AFTER, retry_after.to_string()));
        }
        builder.json(rejection)
    }
}

/// Middleware factory
#[derive(Clone)]
pub struct ShieldMiddleware {
    shield: Arc<Shield>,
}

impl ShieldMiddleware {
    pub fn new(shield: Arc<Shield>) -> Self {
        Self { shield }
    }
}

impl<S, B> Transform<S, ServiceRequest> for ShieldMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = ShieldService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ShieldService {
            service: Rc::new(service),
            shield: self.shield.clone(),
        }))
    }
}

pub struct ShieldService<S> {
    service: Rc<S>,
    shield: Arc<Shield>,
}

impl<S, B> Service<ServiceRequest> for ShieldService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, mut req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let shield = self.shield.clone();

        Box::pin(async move {
            let outcome = match describe(&mut req, shield.config().size.max_content_length).await {
                Ok((mut descriptor, format)) => shield
                    .process(&mut descriptor)
                    .await
                    .map(|allowance| (allowance, descriptor, format)),
                Err(e) => Err(e),
            };

            let (allowance, descriptor, format) = match outcome {
                Ok(accepted) => accepted,
                Err(e) => {
                    if let ShieldError::Internal(detail) = &e {
                        warn!("Rejecting {} with internal error: {}", req.path(), detail);
                    }
                    let response = e.error_response();
                    return Ok(req.into_response(response).map_into_right_body());
                }
            };

            if allowance.sanitized {
                apply_sanitized(&mut req, &descriptor, format);
            }

            let mut res = service.call(req).await?;
            for (name, value) in allowance.response_headers() {
                if let (Ok(name), Ok(value)) =
                    (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value))
                {
                    res.headers_mut().insert(name, value);
                }
            }
            Ok(res.map_into_left_body())
        })
    }
}

/// How a buffered body was decoded, so a sanitized body is written back the same way
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFormat {
    Json,
    Form,
    Text,
}

/// Build a descriptor from the request, buffering its body.
///
/// The body is put back on the request so the wrapped service can read it.
/// Reading stops once `limit` is exceeded; the descriptor then carries the
/// observed length and no body, which the size guard rejects, and the bytes
/// read so far are put back in front of the unread remainder.
async fn describe(
    req: &mut ServiceRequest,
    limit: u64,
) -> Result<(RequestDescriptor, BodyFormat), ShieldError> {
    let mut descriptor = RequestDescriptor::new(req.method().as_str(), req.path());
    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            descriptor = descriptor.with_header(name.as_str(), value);
        }
    }
    descriptor.remote_addr = req.peer_addr().map(|addr| addr.to_string());
    descriptor.query = url::form_urlencoded::parse(req.query_string().as_bytes())
        .into_owned()
        .collect();

    let declared = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or_default();
    if declared > limit {
        descriptor.content_length = declared;
        return Ok((descriptor, BodyFormat::Text));
    }

    let mut payload = req.take_payload();
    let mut buffer = BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| ShieldError::Internal(format!("reading body: {}", e)))?;
        buffer.extend_from_slice(&chunk);
        if buffer.len() as u64 > limit {
            descriptor.content_length = buffer.len() as u64;
            let head = stream::once(ready(Ok::<_, PayloadError>(buffer.freeze())));
            req.set_payload(Payload::Stream {
                payload: Box::pin(head.chain(payload)),
            });
            return Ok((descriptor, BodyFormat::Text));
        }
    }

    let bytes = buffer.freeze();
    descriptor.content_length = bytes.len() as u64;
    let mut format = BodyFormat::Text;
    if !bytes.is_empty() {
        let (body, parsed_as) = parse_body(&bytes, is_form(req));
        descriptor.body = Some(body);
        format = parsed_as;
    }
    req.set_payload(Payload::from(bytes));
    Ok((descriptor, format))
}

fn is_form(req: &ServiceRequest) -> bool {
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

fn parse_body(bytes: &Bytes, form: bool) -> (Value, BodyFormat) {
    if form {
        return (decode_form(bytes), BodyFormat::Form);
    }
    match serde_json::from_slice(bytes) {
        Ok(value) => (value, BodyFormat::Json),
        Err(_) => (
            Value::String(String::from_utf8_lossy(bytes).into_owned()),
            BodyFormat::Text,
        ),
    }
}

/// Decode a form body into an object; a repeated field becomes an array.
fn decode_form(bytes: &[u8]) -> Value {
    let mut fields = Map::new();
    for (name, value) in url::form_urlencoded::parse(bytes).into_owned() {
        match fields.get_mut(&name) {
            Some(Value::Array(values)) => values.push(Value::String(value)),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
            None => {
                fields.insert(name, Value::String(value));
            }
        }
    }
    Value::Object(fields)
}

fn encode_form(fields: &Map<String, Value>) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in fields {
        let values = match value {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        for item in values {
            match item {
                Value::String(text) => serializer.append_pair(name, text),
                other => serializer.append_pair(name, &other.to_string()),
            };
        }
    }
    serializer.finish()
}

/// Replace the request's query string and body with their sanitized forms.
fn apply_sanitized(req: &mut ServiceRequest, descriptor: &RequestDescriptor, format: BodyFormat) {
    if !descriptor.query.is_empty() {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(descriptor.query.iter())
            .finish();
        match format!("{}?{}", req.path(), query).parse::<Uri>() {
            Ok(uri) => req.head_mut().uri = uri,
            Err(e) => warn!("Could not rewrite sanitized query for {}: {}", req.path(), e),
        }
    }

    let body = match &descriptor.body {
        Some(Value::Object(fields)) if format == BodyFormat::Form => Bytes::from(encode_form(fields)),
        Some(Value::String(text)) if format == BodyFormat::Text => Bytes::from(text.clone()),
        Some(value) => match serde_json::to_vec(value) {
            Ok(encoded) => Bytes::from(encoded),
            Err(e) => {
                warn!("Could not encode sanitized body for {}: {}", req.path(), e);
                return;
            }
        },
        None => return,
    };
    req.headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    req.set_payload(Payload::from(body));
}
