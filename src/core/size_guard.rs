//! Request size limits.

use serde_json::Value;
use crate::core::error::ShieldError;
use crate::core::request::RequestDescriptor;
use crate::models::SizeConfig;

#[derive(Debug, Clone, Default)]
pub struct SizeGuard {
    config: SizeConfig,
}

impl SizeGuard {
    pub fn new(config: SizeConfig) -> Self {
        Self { config }
    }

    pub fn check(&self, req: &RequestDescriptor) -> Result<(), ShieldError> {
        if req.content_length > self.config.max_content_length {
            return Err(ShieldError::PayloadTooLarge {
                size: req.content_length,
                max: self.config.max_content_length,
            });
        }
        for (name, value) in &req.query {
            self.check_string(name, value)?;
        }
        match &req.body {
            Some(body) => self.check_value("body", body, 0),
            None => Ok(()),
        }
    }

    fn check_string(&self, name: &str, value: &str) -> Result<(), ShieldError> {
        let length = value.chars().count();
        if length > self.config.max_string_length {
            return Err(ShieldError::ParametersTooLarge(format!(
                "parameter {} has {} characters, limit is {}",
                name, length, self.config.max_string_length
            )));
        }
        Ok(())
    }

    fn check_value(&self, name: &str, value: &Value, depth: usize) -> Result<(), ShieldError> {
        if depth > self.config.max_depth {
            return Err(ShieldError::ValidationError(format!(
                "nesting deeper than {} levels",
                self.config.max_depth
            )));
        }
        match value {
            Value::String(s) => self.check_string(name, s),
            Value::Array(items) => {
                if items.len() > self.config.max_array_length {
                    return Err(ShieldError::ParametersTooLarge(format!(
                        "array {} has {} elements, limit is {}",
                        name,
                        items.len(),
                        self.config.max_array_length
                    )));
                }
                items
                    .iter()
                    .try_for_each(|item| self.check_value(name, item, depth + 1))
            }
            Value::Object(map) => map
                .iter()
                .try_for_each(|(key, item)| self.check_value(key, item, depth + 1)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn guard() -> SizeGuard {
        SizeGuard::new(SizeConfig::default())
    }

    #[test]
    fn test_long_parameter_rejected() {
        let req = RequestDescriptor::new("POST", "/").with_body(json!({ "q": "a".repeat(2000) }));
        let err = guard().check(&req).unwrap_err();
        assert_eq!(err.code().as_str(), "PARAMETERS_TOO_LARGE");
        assert_eq!(err.rejection().status, 400);
    }

    #[test]
    fn test_content_length_rejected() {
        let mut req = RequestDescriptor::new("POST", "/");
        req.content_length = 2 * 1024 * 1024;
        assert!(matches!(
            guard().check(&req),
            Err(ShieldError::PayloadTooLarge { max: 1_048_576, .. })
        ));
    }

    #[test]
    fn test_long_query_value_rejected() {
        let req = RequestDescriptor::new("GET", "/").with_query("q", &"x".repeat(1001));
        assert!(matches!(guard().check(&req), Err(ShieldError::ParametersTooLarge(_))));
    }

    #[test]
    fn test_every_value_of_repeated_key_checked() {
        let req = RequestDescriptor::new("GET", "/")
            .with_query("q", &"x".repeat(1001))
            .with_query("q", "short");
        assert!(matches!(guard().check(&req), Err(ShieldError::ParametersTooLarge(_))));
    }

    #[test]
    fn test_long_array_rejected() {
        let req = RequestDescriptor::new("POST", "/").with_body(json!({ "ids": vec![1; 101] }));
        assert!(matches!(guard().check(&req), Err(ShieldError::ParametersTooLarge(_))));
    }

    #[test]
    fn test_deep_nesting_is_a_validation_error() {
        let mut body = json!("leaf");
        for _ in 0..20 {
            body = json!({ "n": body });
        }
        let req = RequestDescriptor::new("POST", "/").with_body(body);
        assert!(matches!(guard().check(&req), Err(ShieldError::ValidationError(_))));
    }

    #[test]
    fn test_within_limits_passes() {
        let req = RequestDescriptor::new("POST", "/")
            .with_query("page", "2")
            .with_body(json!({ "name": "a".repeat(1000), "tags": vec!["x"; 100], "nested": { "a": [ { "b": 1 } ] } }));
        assert!(guard().check(&req).is_ok());
    }
}
