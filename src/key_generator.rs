//! Key generation utilities for rate limiting.

use crate::error::{ThrottlerError, ThrottlerResult};
use crate::rate_limit_config::Strategy;
use crate::rule_matcher::CompiledRule;
use axum::http::Method;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

type HmacSha256 = Hmac<Sha256>;

/// Hex characters kept from the subject digest (128 bits).
const SUBJECT_HASH_LEN: usize = 32;

/// The request facts the engine looks at.
#[derive(Debug, Clone)]
pub struct RequestAttributes {
    pub method: Method,
    pub path: String,
    /// Address of the socket peer
    pub peer_ip: Option<IpAddr>,
    /// Raw `X-Forwarded-For` value
    pub forwarded_for: Option<String>,
    pub user_id: Option<String>,
    pub api_key: Option<String>,
}

impl RequestAttributes {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            peer_ip: None,
            forwarded_for: None,
            user_id: None,
            api_key: None,
        }
    }

    pub fn with_peer_ip(mut self, ip: IpAddr) -> Self {
        self.peer_ip = Some(ip);
        self
    }

    pub fn with_forwarded_for(mut self, chain: impl Into<String>) -> Self {
        self.forwarded_for = Some(chain.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

/// A bucket key: `prefix:strategy:window:subject-hash`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitKey {
    pub value: String,
    /// A user rule keyed this anonymous request by IP instead.
    pub degraded_to_ip: bool,
}

impl RateLimitKey {
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Generates rate limiting keys based on request context
#[derive(Clone)]
pub struct KeyGenerator {
    secret: Vec<u8>,
}

impl fmt::Debug for KeyGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGenerator").finish_non_exhaustive()
    }
}

impl KeyGenerator {
    /// `secret` keys the subject digest so raw identifiers and API keys
    /// never reach the counter store.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Generate the bucket key for `rule` and the request.
    ///
    /// Returns `InvalidSubject` when the strategy has nothing to key on; the
    /// caller skips the rule for this request.
    pub fn generate_key(
        &self,
        prefix: &str,
        rule: &CompiledRule,
        attrs: &RequestAttributes,
        trusted_proxies: &HashSet<IpAddr>,
    ) -> ThrottlerResult<RateLimitKey> {
        let client_ip = Self::resolve_client_ip(attrs, trusted_proxies);
        let ip_subject = || {
            client_ip
                .map(|ip| format!("ip:{}", ip))
                .ok_or(ThrottlerError::InvalidSubject("client IP unknown"))
        };

        let mut degraded_to_ip = false;
        let subject = match rule.rule.strategy {
            Strategy::IpAddress => ip_subject()?,
            Strategy::UserId => match attrs.user_id.as_deref() {
                Some(user_id) => format!("user:{}", user_id),
                None => {
                    degraded_to_ip = true;
                    ip_subject()?
                }
            },
            Strategy::ApiKey => match attrs.api_key.as_deref() {
                Some(api_key) if !api_key.is_empty() => format!("api_key:{}", api_key),
                _ => return Err(ThrottlerError::InvalidSubject("no API key presented")),
            },
            Strategy::Endpoint => Self::endpoint_subject(&attrs.method, &attrs.path),
            Strategy::Global => "global".to_string(),
            Strategy::Combined => format!(
                "{}|user:{}|{}",
                ip_subject()?,
                attrs.user_id.as_deref().unwrap_or("anon"),
                Self::endpoint_subject(&attrs.method, &attrs.path),
            ),
        };

        Ok(RateLimitKey {
            value: format!(
                "{}:{}:{}:{}",
                prefix,
                rule.rule.strategy.as_str(),
                rule.rule.window.as_str(),
                self.subject_hash(&rule.id, &subject)?
            ),
            degraded_to_ip,
        })
    }

    /// Resolve the client address.
    ///
    /// Forwarding headers are only believed when the socket peer is a trusted
    /// proxy; the chain is then walked from the right and the first hop that
    /// is not a trusted proxy is the client.
    pub fn resolve_client_ip(
        attrs: &RequestAttributes,
        trusted_proxies: &HashSet<IpAddr>,
    ) -> Option<IpAddr> {
        let peer = attrs.peer_ip?;
        if !trusted_proxies.contains(&peer) {
            return Some(peer);
        }
        let Some(chain) = attrs.forwarded_for.as_deref() else {
            return Some(peer);
        };

        let mut client = peer;
        for hop in chain.rsplit(',') {
            let Ok(ip) = hop.trim().parse::<IpAddr>() else {
                break;
            };
            client = ip;
            if !trusted_proxies.contains(&ip) {
                break;
            }
        }
        Some(client)
    }

    /// Collapse a request path to its route shape: query dropped, empty
    /// segments removed, numeric and UUID segments replaced by `{id}`.
    pub fn normalize_path(path: &str) -> String {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let segments: Vec<&str> = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| {
                let numeric = segment.bytes().all(|b| b.is_ascii_digit());
                if numeric || uuid::Uuid::parse_str(segment).is_ok() {
                    "{id}"
                } else {
                    segment
                }
            })
            .collect();
        format!("/{}", segments.join("/"))
    }

    fn endpoint_subject(method: &Method, path: &str) -> String {
        format!("endpoint:{} {}", method, Self::normalize_path(path))
    }

    fn subject_hash(&self, rule_id: &str, subject: &str) -> ThrottlerResult<String> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| ThrottlerError::Internal(format!("HMAC key error: {}", e)))?;
        mac.update(rule_id.as_bytes());
        mac.update(b"\n");
        mac.update(subject.as_bytes());
        let mut digest = hex::encode(mac.finalize().into_bytes());
        digest.truncate(SUBJECT_HASH_LEN);
        Ok(digest)
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new(b"")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit_config::{RateLimitRule, Window};

    fn rule(strategy: Strategy) -> CompiledRule {
        CompiledRule::compile(&RateLimitRule::new(strategy, Window::Minute, 10).named("test")).unwrap()
    }

    fn attrs() -> RequestAttributes {
        RequestAttributes::new(Method::GET, "/api/test")
            .with_peer_ip("192.168.1.1".parse().unwrap())
    }

    fn no_proxies() -> HashSet<IpAddr> {
        HashSet::new()
    }

    #[test]
    fn test_key_layout() {
        let generator = KeyGenerator::new("secret");
        let key = generator
            .generate_key("ratelimit", &rule(Strategy::IpAddress), &attrs(), &no_proxies())
            .unwrap();
        let parts: Vec<&str> = key.as_str().split(':').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(&parts[..3], &["ratelimit", "ip", "minute"]);
        assert_eq!(parts[3].len(), SUBJECT_HASH_LEN);
        assert!(!key.as_str().contains("192.168.1.1"));
    }

    #[test]
    fn test_key_derivation_is_deterministic() {
        let generator = KeyGenerator::new("secret");
        let rule = rule(Strategy::Combined);
        let a = generator.generate_key("rl", &rule, &attrs(), &no_proxies()).unwrap();
        let b = generator.generate_key("rl", &rule, &attrs(), &no_proxies()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_subjects_get_distinct_keys() {
        let generator = KeyGenerator::new("secret");
        for strategy in [Strategy::IpAddress, Strategy::UserId, Strategy::ApiKey, Strategy::Combined] {
            let rule = rule(strategy);
            let first = attrs().with_user_id("alice").with_api_key("key-1");
            let second = RequestAttributes::new(Method::GET, "/api/test")
                .with_peer_ip("192.168.1.2".parse().unwrap())
                .with_user_id("bob")
                .with_api_key("key-2");
            let a = generator.generate_key("rl", &rule, &first, &no_proxies()).unwrap();
            let b = generator.generate_key("rl", &rule, &second, &no_proxies()).unwrap();
            assert_ne!(a, b, "strategy {:?}", strategy);
        }
    }

    #[test]
    fn test_rules_do_not_share_buckets() {
        let generator = KeyGenerator::default();
        let strict = CompiledRule::compile(
            &RateLimitRule::new(Strategy::IpAddress, Window::Minute, 5).named("strict"),
        )
        .unwrap();
        let loose = CompiledRule::compile(
            &RateLimitRule::new(Strategy::IpAddress, Window::Minute, 100).named("loose"),
        )
        .unwrap();
        let a = generator.generate_key("rl", &strict, &attrs(), &no_proxies()).unwrap();
        let b = generator.generate_key("rl", &loose, &attrs(), &no_proxies()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_user_falls_back_to_ip() {
        let generator = KeyGenerator::default();
        let key = generator
            .generate_key("rl", &rule(Strategy::UserId), &attrs(), &no_proxies())
            .unwrap();
        assert!(key.degraded_to_ip);

        let authenticated = generator
            .generate_key("rl", &rule(Strategy::UserId), &attrs().with_user_id("alice"), &no_proxies())
            .unwrap();
        assert!(!authenticated.degraded_to_ip);
        assert_ne!(key.value, authenticated.value);
    }

    #[test]
    fn test_api_key_required() {
        let generator = KeyGenerator::default();
        let result = generator.generate_key("rl", &rule(Strategy::ApiKey), &attrs(), &no_proxies());
        assert!(matches!(result, Err(ThrottlerError::InvalidSubject(_))));

        let key = generator
            .generate_key("rl", &rule(Strategy::ApiKey), &attrs().with_api_key("sk-live-123"), &no_proxies())
            .unwrap();
        assert!(!key.as_str().contains("sk-live-123"));
    }

    #[test]
    fn test_secret_changes_digest() {
        let a = KeyGenerator::new("one")
            .generate_key("rl", &rule(Strategy::ApiKey), &attrs().with_api_key("k"), &no_proxies())
            .unwrap();
        let b = KeyGenerator::new("two")
            .generate_key("rl", &rule(Strategy::ApiKey), &attrs().with_api_key("k"), &no_proxies())
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_global_ignores_request() {
        let generator = KeyGenerator::default();
        let rule = rule(Strategy::Global);
        let a = generator.generate_key("rl", &rule, &attrs(), &no_proxies()).unwrap();
        let b = generator
            .generate_key("rl", &rule, &RequestAttributes::new(Method::POST, "/other"), &no_proxies())
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_endpoint_uses_route_shape() {
        let generator = KeyGenerator::default();
        let rule = rule(Strategy::Endpoint);
        let a = generator
            .generate_key("rl", &rule, &RequestAttributes::new(Method::GET, "/users/1/orders"), &no_proxies())
            .unwrap();
        let b = generator
            .generate_key("rl", &rule, &RequestAttributes::new(Method::GET, "/users/2/orders/"), &no_proxies())
            .unwrap();
        let c = generator
            .generate_key("rl", &rule, &RequestAttributes::new(Method::POST, "/users/1/orders"), &no_proxies())
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_ip_required_for_ip_strategy() {
        let generator = KeyGenerator::default();
        let result = generator.generate_key(
            "rl",
            &rule(Strategy::IpAddress),
            &RequestAttributes::new(Method::GET, "/"),
            &no_proxies(),
        );
        assert!(matches!(result, Err(ThrottlerError::InvalidSubject(_))));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(KeyGenerator::normalize_path("/api//v1/items/42/?page=2"), "/api/v1/items/{id}");
        assert_eq!(
            KeyGenerator::normalize_path("/orders/67e55044-10b1-426f-9247-bb680e5fe0c8"),
            "/orders/{id}"
        );
        assert_eq!(KeyGenerator::normalize_path("/"), "/");
    }

    #[test]
    fn test_forwarded_header_ignored_from_untrusted_peer() {
        let attrs = attrs().with_forwarded_for("1.2.3.4");
        let ip = KeyGenerator::resolve_client_ip(&attrs, &no_proxies());
        assert_eq!(ip, Some("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_first_untrusted_hop_wins() {
        let trusted: HashSet<IpAddr> = ["10.0.0.1", "10.0.0.2"]
            .iter()
            .map(|ip| ip.parse().unwrap())
            .collect();
        let attrs = RequestAttributes::new(Method::GET, "/")
            .with_peer_ip("10.0.0.1".parse().unwrap())
            .with_forwarded_for("6.6.6.6, 203.0.113.7, 10.0.0.2");
        assert_eq!(
            KeyGenerator::resolve_client_ip(&attrs, &trusted),
            Some("203.0.113.7".parse().unwrap())
        );

        let no_header = RequestAttributes::new(Method::GET, "/").with_peer_ip("10.0.0.1".parse().unwrap());
        assert_eq!(
            KeyGenerator::resolve_client_ip(&no_header, &trusted),
            Some("10.0.0.1".parse().unwrap())
        );
    }

    #[test]
    fn test_malformed_hop_stops_the_walk() {
        let trusted: HashSet<IpAddr> = ["10.0.0.1".parse().unwrap()].into_iter().collect();
        let attrs = RequestAttributes::new(Method::GET, "/")
            .with_peer_ip("10.0.0.1".parse().unwrap())
            .with_forwarded_for("203.0.113.7, garbage");
        assert_eq!(
            KeyGenerator::resolve_client_ip(&attrs, &trusted),
            Some("10.0.0.1".parse().unwrap())
        );
    }
}
