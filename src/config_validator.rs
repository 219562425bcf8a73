use crate::error::ThrottlerError;
use std::time::Duration;

/// Longest store round trip worth waiting for before failing open.
const MAX_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Validates configuration objects for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a Redis URL
    pub fn validate_redis_url(url: &str) -> Result<(), ThrottlerError> {
        if url.is_empty() {
            return Err(ThrottlerError::ValidationError(
                "Redis URL cannot be empty".to_string(),
            ));
        }

        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(ThrottlerError::ValidationError(
                "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates the bucket key namespace
    pub fn validate_key_prefix(prefix: &str) -> Result<(), ThrottlerError> {
        if prefix.is_empty() {
            return Err(ThrottlerError::RuleConfig(
                "Key prefix cannot be empty".to_string(),
            ));
        }

        if prefix.ends_with(':') || prefix.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ThrottlerError::RuleConfig(format!(
                "Key prefix '{}' must not contain whitespace or end with ':'",
                prefix
            )));
        }

        Ok(())
    }

    /// Validates the counter store timeout
    pub fn validate_store_timeout(timeout: Duration) -> Result<(), ThrottlerError> {
        if timeout.is_zero() {
            return Err(ThrottlerError::RuleConfig(
                "Store timeout must be greater than 0".to_string(),
            ));
        }

        if timeout > MAX_STORE_TIMEOUT {
            return Err(ThrottlerError::RuleConfig(format!(
                "Store timeout must not exceed {:?}",
                MAX_STORE_TIMEOUT
            )));
        }

        Ok(())
    }
}
