use crate::config_validator::ConfigValidator;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::rule_matcher::{CompiledRule, PathPattern};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use validator::Validate;

/// How the subject of a rule is derived from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    #[serde(rename = "ip")]
    IpAddress,
    #[serde(rename = "user")]
    UserId,
    #[serde(rename = "api_key")]
    ApiKey,
    #[serde(rename = "endpoint")]
    Endpoint,
    #[serde(rename = "global")]
    Global,
    #[serde(rename = "combined")]
    Combined,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::IpAddress => "ip",
            Strategy::UserId => "user",
            Strategy::ApiKey => "api_key",
            Strategy::Endpoint => "endpoint",
            Strategy::Global => "global",
            Strategy::Combined => "combined",
        }
    }
}

/// Length of the trailing window a rule counts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    Second,
    Minute,
    Hour,
    Day,
}

impl Window {
    pub fn as_secs(&self) -> u64 {
        match self {
            Window::Second => 1,
            Window::Minute => 60,
            Window::Hour => 3_600,
            Window::Day => 86_400,
        }
    }

    pub fn as_millis(&self) -> u64 {
        self.as_secs() * 1_000
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.as_secs())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Second => "second",
            Window::Minute => "minute",
            Window::Hour => "hour",
            Window::Day => "day",
        }
    }
}

/// Individual rate limiting rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RateLimitRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, max = 64))]
    pub name: Option<String>,
    pub strategy: Strategy,
    pub window: Window,
    #[validate(range(min = 1u64, max = 1_099_511_627_776u64))]
    pub max_requests: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    #[serde(default = "default_cost")]
    #[validate(range(min = 1u64, max = 1_099_511_627_776u64))]
    pub cost: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exempt_ips: Vec<IpAddr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exempt_user_ids: Vec<String>,
}

fn default_cost() -> u64 {
    1
}

impl RateLimitRule {
    /// Create a new rate limit rule that applies to every path and method
    pub fn new(strategy: Strategy, window: Window, max_requests: u64) -> Self {
        Self {
            name: None,
            strategy,
            window,
            max_requests,
            paths: Vec::new(),
            methods: Vec::new(),
            cost: default_cost(),
            exempt_ips: Vec::new(),
            exempt_user_ids: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_exempt_ips(mut self, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        self.exempt_ips = ips.into_iter().collect();
        self
    }

    pub fn with_exempt_user_ids<I, S>(mut self, user_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exempt_user_ids = user_ids.into_iter().map(Into::into).collect();
        self
    }

    /// Stable identity used to namespace the rule's buckets.
    ///
    /// Named rules keep their buckets across edits; unnamed rules are
    /// fingerprinted by everything that defines what they count.
    pub fn identity(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!(
                "{}|{}|{}|{}|{}|{}",
                self.strategy.as_str(),
                self.window.as_str(),
                self.max_requests,
                self.cost,
                self.paths.join(","),
                self.methods.join(",").to_ascii_uppercase(),
            ),
        }
    }
}

/// Identifiers that bypass rate limiting entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExemptionList {
    pub ips: HashSet<IpAddr>,
    pub user_ids: HashSet<String>,
}

impl ExemptionList {
    pub fn is_empty(&self) -> bool {
        self.ips.is_empty() && self.user_ids.is_empty()
    }

    pub fn covers(&self, client_ip: Option<IpAddr>, user_id: Option<&str>) -> bool {
        if let Some(ip) = client_ip {
            if self.ips.contains(&ip) {
                return true;
            }
        }
        user_id.is_some_and(|id| self.user_ids.contains(id))
    }
}

/// Configuration for rate limiting, as loaded from the rules file or the
/// admin API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    #[validate(length(min = 1, max = 64))]
    pub key_prefix: String,
    pub rules: Vec<RateLimitRule>,
    /// Evaluated when no rule matches the request.
    pub default_rule: Option<RateLimitRule>,
    pub exemptions: ExemptionList,
    pub exempt_paths: Vec<String>,
    pub trusted_proxies: Vec<IpAddr>,
    pub enable_headers: bool,
    #[serde(with = "humantime_serde")]
    pub store_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: "ratelimit".to_string(),
            rules: vec![
                RateLimitRule::new(Strategy::IpAddress, Window::Minute, 5)
                    .named("auth-per-ip")
                    .with_paths(["/api/v1/auth/login", "/api/v1/auth/register"]),
                RateLimitRule::new(Strategy::UserId, Window::Minute, 60).named("user-per-minute"),
                RateLimitRule::new(Strategy::UserId, Window::Hour, 1_000).named("user-per-hour"),
                RateLimitRule::new(Strategy::IpAddress, Window::Minute, 100).named("ip-per-minute"),
            ],
            default_rule: Some(
                RateLimitRule::new(Strategy::IpAddress, Window::Minute, 100).named("default"),
            ),
            exemptions: ExemptionList::default(),
            exempt_paths: vec![
                "/health".to_string(),
                "/healthz".to_string(),
                "/ready".to_string(),
                "/metrics".to_string(),
            ],
            trusted_proxies: Vec::new(),
            enable_headers: true,
            store_timeout: Duration::from_millis(50),
        }
    }
}

impl RateLimitConfig {
    /// An enabled configuration with the given rules and nothing else.
    pub fn with_rules(rules: Vec<RateLimitRule>) -> Self {
        Self {
            rules,
            default_rule: None,
            exempt_paths: Vec::new(),
            ..Self::default()
        }
    }

    /// Load a JSON rules file.
    pub fn from_file(path: &Path) -> ThrottlerResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ThrottlerError::RuleConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ThrottlerError::RuleConfig(format!("invalid rules file {}: {}", path.display(), e))
        })
    }

    /// Validate every rule and build the immutable snapshot used at request
    /// time. Any problem here is a `RuleConfig` error.
    pub fn compile(&self) -> ThrottlerResult<CompiledConfig> {
        self.validate()?;
        ConfigValidator::validate_key_prefix(&self.key_prefix)?;
        ConfigValidator::validate_store_timeout(self.store_timeout)?;

        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(self.rules.len());
        for (index, rule) in self.rules.iter().enumerate() {
            let compiled = CompiledRule::compile(rule).map_err(|e| {
                ThrottlerError::RuleConfig(format!("rule #{} ({}): {}", index, rule.identity(), e))
            })?;
            if !seen.insert(compiled.id.clone()) {
                return Err(ThrottlerError::RuleConfig(format!(
                    "rule #{} duplicates the identity '{}'; give it a distinct name",
                    index, compiled.id
                )));
            }
            rules.push(compiled);
        }

        let default_rule = self
            .default_rule
            .as_ref()
            .map(|rule| {
                CompiledRule::compile(rule).map_err(|e| {
                    ThrottlerError::RuleConfig(format!("default rule: {}", e))
                })
            })
            .transpose()?;

        let exempt_paths = self
            .exempt_paths
            .iter()
            .map(|raw| PathPattern::parse(raw))
            .collect::<ThrottlerResult<Vec<_>>>()?;

        Ok(CompiledConfig {
            enabled: self.enabled,
            key_prefix: self.key_prefix.clone(),
            rules,
            default_rule,
            exemptions: self.exemptions.clone(),
            exempt_paths,
            trusted_proxies: self.trusted_proxies.iter().copied().collect(),
            enable_headers: self.enable_headers,
            store_timeout: self.store_timeout,
            source: self.clone(),
        })
    }
}

/// Validated, read-only configuration snapshot.
#[derive(Debug)]
pub struct CompiledConfig {
    pub enabled: bool,
    pub key_prefix: String,
    pub rules: Vec<CompiledRule>,
    pub default_rule: Option<CompiledRule>,
    pub exemptions: ExemptionList,
    pub exempt_paths: Vec<PathPattern>,
    pub trusted_proxies: HashSet<IpAddr>,
    pub enable_headers: bool,
    pub store_timeout: Duration,
    /// The configuration this snapshot was compiled from.
    pub source: RateLimitConfig,
}

impl CompiledConfig {
    pub fn is_exempt_path(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|pattern| pattern.matches(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_compiles() {
        let compiled = RateLimitConfig::default().compile().unwrap();
        assert_eq!(compiled.rules.len(), 4);
        assert!(compiled.default_rule.is_some());
        assert!(compiled.is_exempt_path("/health"));
        assert!(!compiled.is_exempt_path("/api/v1/items"));
    }

    #[test]
    fn test_zero_max_requests_rejected() {
        let config = RateLimitConfig::with_rules(vec![RateLimitRule::new(
            Strategy::IpAddress,
            Window::Minute,
            0,
        )]);
        assert!(matches!(config.compile(), Err(ThrottlerError::RuleConfig(_))));
    }

    #[test]
    fn test_zero_cost_rejected() {
        let config = RateLimitConfig::with_rules(vec![
            RateLimitRule::new(Strategy::Global, Window::Second, 10).with_cost(0),
        ]);
        assert!(config.compile().is_err());
    }

    #[test]
    fn test_quantities_are_bounded() {
        let at_bound = RateLimitConfig::with_rules(vec![
            RateLimitRule::new(Strategy::Global, Window::Day, 1 << 40).with_cost(1 << 40),
        ]);
        assert!(at_bound.compile().is_ok());

        let too_many = RateLimitConfig::with_rules(vec![
            RateLimitRule::new(Strategy::Global, Window::Day, (1 << 40) + 1),
        ]);
        assert!(matches!(too_many.compile(), Err(ThrottlerError::RuleConfig(_))));

        let too_costly = RateLimitConfig::with_rules(vec![
            RateLimitRule::new(Strategy::Global, Window::Day, 10).with_cost(u64::MAX),
        ]);
        assert!(matches!(too_costly.compile(), Err(ThrottlerError::RuleConfig(_))));
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let rule = RateLimitRule::new(Strategy::UserId, Window::Minute, 60);
        let config = RateLimitConfig::with_rules(vec![rule.clone(), rule]);
        let err = config.compile().unwrap_err();
        assert!(err.to_string().contains("duplicates"));
    }

    #[test]
    fn test_same_strategy_different_limits_are_distinct() {
        let config = RateLimitConfig::with_rules(vec![
            RateLimitRule::new(Strategy::UserId, Window::Minute, 60),
            RateLimitRule::new(Strategy::UserId, Window::Minute, 100),
        ]);
        assert!(config.compile().is_ok());
    }

    #[test]
    fn test_parse_rules_json() {
        let raw = r#"{
            "key_prefix": "api",
            "store_timeout": "25ms",
            "rules": [
                {"strategy": "api_key", "window": "hour", "max_requests": 500, "cost": 5,
                 "paths": ["/v1/reports/*"], "methods": ["post"]}
            ],
            "exemptions": {"ips": ["10.0.0.1"], "user_ids": ["admin"]}
        }"#;
        let config: RateLimitConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.key_prefix, "api");
        assert_eq!(config.store_timeout, Duration::from_millis(25));
        assert_eq!(config.rules[0].strategy, Strategy::ApiKey);
        assert_eq!(config.rules[0].cost, 5);
        assert!(config.exemptions.user_ids.contains("admin"));
        assert!(config.enabled);
        assert!(config.compile().is_ok());
    }

    #[test]
    fn test_window_durations() {
        assert_eq!(Window::Second.as_secs(), 1);
        assert_eq!(Window::Minute.as_millis(), 60_000);
        assert_eq!(Window::Day.duration(), Duration::from_secs(86_400));
    }
}
