use crate::error::ThrottlerResult;
use crate::rate_limit_config::RateLimitConfig;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Process settings, from the command line or the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "gatekeeper", version, about)]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL; empty keeps counters in process memory
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// JSON rules file; the built-in rules are used when absent
    #[arg(long, env = "RULES_FILE")]
    pub rules_file: Option<PathBuf>,

    /// Secret mixed into bucket key hashes
    #[arg(long, env = "KEY_HASH_SECRET", default_value = "", hide_env_values = true)]
    pub key_hash_secret: String,

    /// Bearer token for the /admin API; the admin API is refused when unset
    #[arg(long, env = "ADMIN_TOKEN", hide_env_values = true)]
    pub admin_token: Option<String>,

    /// In-memory bucket sweep interval in seconds
    #[arg(long = "cleanup-interval", env = "CLEANUP_INTERVAL", default_value_t = 300)]
    pub cleanup_interval_secs: u64,

    /// Log level for the gatekeeper target
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Load configuration from arguments and environment variables
    pub fn from_env() -> Result<Self, clap::Error> {
        Config::try_parse()
    }

    pub fn uses_redis(&self) -> bool {
        !self.redis_url.trim().is_empty()
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    /// The rules file if one is configured, otherwise the built-in rules.
    pub fn load_rules(&self) -> ThrottlerResult<RateLimitConfig> {
        match &self.rules_file {
            Some(path) => RateLimitConfig::from_file(path),
            None => Ok(RateLimitConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["gatekeeper"]).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:3000".parse().unwrap());
        assert_eq!(config.cleanup_interval(), Duration::from_secs(300));
        assert!(config.rules_file.is_none());
    }

    #[test]
    fn test_empty_redis_url_means_memory() {
        let config = Config::try_parse_from(["gatekeeper", "--redis-url", ""]).unwrap();
        assert!(!config.uses_redis());
        assert!(config.load_rules().is_ok());
    }

    #[test]
    fn test_missing_rules_file() {
        let config =
            Config::try_parse_from(["gatekeeper", "--rules-file", "/nonexistent/rules.json"]).unwrap();
        assert!(config.load_rules().is_err());
    }
}
