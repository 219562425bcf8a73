use crate::error::ThrottlerError;
use crate::rate_limit_config::RateLimitConfig;
use serde_json::Value;

/// Longest bucket key accepted on the admin API.
const MAX_KEY_LEN: usize = 256;

/// Request validation utilities
pub struct RequestValidator;

impl RequestValidator {
    /// Validates a bucket key supplied to the admin API: it must live under
    /// the configured prefix and contain only key characters.
    pub fn validate_bucket_key(key: &str, prefix: &str) -> Result<(), ThrottlerError> {
        let key = key.trim();

        if key.is_empty() {
            return Err(ThrottlerError::ValidationError(
                "Bucket key cannot be empty".to_string(),
            ));
        }

        if key.len() > MAX_KEY_LEN {
            return Err(ThrottlerError::ValidationError(format!(
                "Bucket key exceeds {} characters",
                MAX_KEY_LEN
            )));
        }

        if !key.starts_with(&format!("{}:", prefix)) {
            return Err(ThrottlerError::ValidationError(format!(
                "Bucket key must start with '{}:'",
                prefix
            )));
        }

        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_' | '.'))
        {
            return Err(ThrottlerError::ValidationError(
                "Bucket key can only contain alphanumeric characters, ':', '-', '_' and '.'"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Parses a configuration replacement body. Structural problems are
    /// validation errors; rule semantics are checked when it is compiled.
    pub fn validate_config_request(body: Value) -> Result<RateLimitConfig, ThrottlerError> {
        if !body.is_object() {
            return Err(ThrottlerError::ValidationError(
                "Configuration must be a JSON object".to_string(),
            ));
        }

        serde_json::from_value(body)
            .map_err(|e| ThrottlerError::ValidationError(format!("Invalid configuration: {}", e)))
    }
}
