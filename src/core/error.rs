//! Rejection taxonomy for the request pipeline.

use serde::Serialize;
use thiserror::Error;

/// Every way the pipeline can refuse a request.
///
/// All variants except `Internal` are expected outcomes of a check. `Internal`
/// covers unexpected failures; its detail is logged but never rendered.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShieldError {
    #[error("Client is blocked: {reason}")]
    ClientBlocked { reason: String, retry_after: u64 },
    #[error("DDoS protection triggered")]
    DdosTriggered { retry_after: u64 },
    #[error("Automated client detected")]
    BotDetected,
    #[error("Suspicious request behavior")]
    SuspiciousBehavior { retry_after: u64 },
    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after: u64, limit: u32 },
    #[error("Injection attempt detected")]
    InjectionDetected,
    #[error("Request body of {size} bytes exceeds {max} bytes")]
    PayloadTooLarge { size: u64, max: u64 },
    #[error("Parameters too large: {0}")]
    ParametersTooLarge(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Machine-readable rejection code sent to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionCode {
    IpBlocked,
    DdosProtectionTriggered,
    BotDetected,
    SuspiciousBehavior,
    RateLimitExceeded,
    SqlInjectionDetected,
    RequestTooLarge,
    ParametersTooLarge,
    ValidationError,
    InternalError,
}

impl RejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IpBlocked => "IP_BLOCKED",
            Self::DdosProtectionTriggered => "DDOS_PROTECTION_TRIGGERED",
            Self::BotDetected => "BOT_DETECTED",
            Self::SuspiciousBehavior => "SUSPICIOUS_BEHAVIOR",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::SqlInjectionDetected => "SQL_INJECTION_DETECTED",
            Self::RequestTooLarge => "REQUEST_TOO_LARGE",
            Self::ParametersTooLarge => "PARAMETERS_TOO_LARGE",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::IpBlocked | Self::BotDetected | Self::SuspiciousBehavior => 403,
            Self::DdosProtectionTriggered | Self::RateLimitExceeded => 429,
            Self::SqlInjectionDetected | Self::ParametersTooLarge | Self::ValidationError => 400,
            Self::RequestTooLarge => 413,
            Self::InternalError => 500,
        }
    }
}

impl std::fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured rejection body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    #[serde(skip)]
    pub status: u16,
    #[serde(rename = "error")]
    pub code: RejectionCode,
    pub message: String,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ShieldError {
    pub fn code(&self) -> RejectionCode {
        match self {
            Self::ClientBlocked { .. } => RejectionCode::IpBlocked,
            Self::DdosTriggered { .. } => RejectionCode::DdosProtectionTriggered,
            Self::BotDetected => RejectionCode::BotDetected,
            Self::SuspiciousBehavior { .. } => RejectionCode::SuspiciousBehavior,
            Self::RateLimitExceeded { .. } => RejectionCode::RateLimitExceeded,
            Self::InjectionDetected => RejectionCode::SqlInjectionDetected,
            Self::PayloadTooLarge { .. } => RejectionCode::RequestTooLarge,
            Self::ParametersTooLarge(_) => RejectionCode::ParametersTooLarge,
            Self::ValidationError(_) => RejectionCode::ValidationError,
            Self::Internal(_) => RejectionCode::InternalError,
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::ClientBlocked { retry_after, .. }
            | Self::DdosTriggered { retry_after }
            | Self::SuspiciousBehavior { retry_after }
            | Self::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Caller-facing view of the error.
    pub fn rejection(&self) -> Rejection {
        let code = self.code();
        let message = match self {
            Self::ClientBlocked { .. } => "Access temporarily blocked".to_string(),
            Self::DdosTriggered { .. } => "Too many requests, slow down".to_string(),
            Self::BotDetected => "Automated traffic is not allowed".to_string(),
            Self::SuspiciousBehavior { .. } => "Suspicious activity detected".to_string(),
            Self::RateLimitExceeded { .. } => "Rate limit exceeded".to_string(),
            Self::InjectionDetected => "Malicious input detected".to_string(),
            Self::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };
        Rejection {
            status: code.status_code(),
            code,
            message,
            retry_after: self.retry_after(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ShieldError::BotDetected.rejection().status, 403);
        assert_eq!(ShieldError::DdosTriggered { retry_after: 60 }.rejection().status, 429);
        assert_eq!(ShieldError::InjectionDetected.rejection().status, 400);
        assert_eq!(
            ShieldError::PayloadTooLarge { size: 2, max: 1 }.rejection().status,
            413
        );
        assert_eq!(
            ShieldError::ParametersTooLarge("q".into()).rejection().code.as_str(),
            "PARAMETERS_TOO_LARGE"
        );
    }

    #[test]
    fn test_internal_error_hides_detail() {
        let rejection = ShieldError::Internal("header decode failed at byte 7".into()).rejection();
        assert_eq!(rejection.status, 500);
        assert_eq!(rejection.message, "Internal server error");
        assert!(rejection.retry_after.is_none());
    }

    #[test]
    fn test_rejection_body_shape() {
        let body = serde_json::to_value(
            ShieldError::RateLimitExceeded { retry_after: 12, limit: 100 }.rejection(),
        )
        .unwrap();
        assert_eq!(body["error"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["retryAfter"], 12);
        assert!(body.get("status").is_none());
    }
}
