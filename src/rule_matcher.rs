//! Rule selection and conflict resolution.
//!
//! Every rule whose filters match a request is evaluated; the outcome is
//! most-restrictive-wins.

use crate::algorithms::Decision;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::rate_limit_config::{CompiledConfig, RateLimitRule};
use axum::http::Method;
use regex::Regex;
use std::collections::HashSet;
use std::net::IpAddr;
use validator::Validate;

/// A path filter.
///
/// Plain patterns match by segment-aware prefix (`/api` matches `/api` and
/// `/api/users` but not `/apix`). Patterns containing `*` or `{name}` are
/// anchored templates: `*` matches any run of characters and `{name}` exactly
/// one path segment.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    template: Option<Regex>,
}

impl PathPattern {
    pub fn parse(raw: &str) -> ThrottlerResult<Self> {
        if !raw.starts_with('/') {
            return Err(ThrottlerError::RuleConfig(format!(
                "path pattern '{}' must start with '/'",
                raw
            )));
        }

        let template = if raw.contains('*') || raw.contains('{') {
            Some(Self::template_regex(raw)?)
        } else {
            None
        };

        Ok(Self {
            raw: raw.to_string(),
            template,
        })
    }

    fn template_regex(raw: &str) -> ThrottlerResult<Regex> {
        let mut pattern = String::from("^");
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            match c {
                '*' => pattern.push_str(".*"),
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed || name.is_empty() || name.contains('{') || name.contains('/') {
                        return Err(ThrottlerError::RuleConfig(format!(
                            "malformed placeholder in path pattern '{}'",
                            raw
                        )));
                    }
                    pattern.push_str("[^/]+");
                }
                '}' => {
                    return Err(ThrottlerError::RuleConfig(format!(
                        "unbalanced '}}' in path pattern '{}'",
                        raw
                    )))
                }
                other => pattern.push_str(&regex::escape(&other.to_string())),
            }
        }
        pattern.push('$');

        Regex::new(&pattern).map_err(|e| {
            ThrottlerError::RuleConfig(format!("invalid path pattern '{}': {}", raw, e))
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        match &self.template {
            Some(regex) => regex.is_match(path),
            None => {
                let prefix = self.raw.as_str();
                match path.strip_prefix(prefix) {
                    Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/'),
                    None => false,
                }
            }
        }
    }

    pub fn is_template(&self) -> bool {
        self.template.is_some()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// A validated rule with its filters parsed.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: String,
    pub rule: RateLimitRule,
    pub paths: Vec<PathPattern>,
    pub methods: Vec<Method>,
    pub exempt_ips: HashSet<IpAddr>,
    pub exempt_user_ids: HashSet<String>,
}

impl CompiledRule {
    pub fn compile(rule: &RateLimitRule) -> ThrottlerResult<Self> {
        rule.validate()?;

        let paths = rule
            .paths
            .iter()
            .map(|raw| PathPattern::parse(raw))
            .collect::<ThrottlerResult<Vec<_>>>()?;

        let methods = rule
            .methods
            .iter()
            .map(|raw| {
                Method::from_bytes(raw.trim().to_ascii_uppercase().as_bytes()).map_err(|_| {
                    ThrottlerError::RuleConfig(format!("invalid HTTP method '{}'", raw))
                })
            })
            .collect::<ThrottlerResult<Vec<_>>>()?;

        Ok(Self {
            id: rule.identity(),
            rule: rule.clone(),
            paths,
            methods,
            exempt_ips: rule.exempt_ips.iter().copied().collect(),
            exempt_user_ids: rule.exempt_user_ids.iter().cloned().collect(),
        })
    }

    /// Whether the rule's path and method filters accept the request.
    pub fn matches(&self, method: &Method, path: &str) -> bool {
        let path_ok = self.paths.is_empty() || self.paths.iter().any(|p| p.matches(path));
        let method_ok = self.methods.is_empty() || self.methods.contains(method);
        path_ok && method_ok
    }

    /// Rule-local exemptions skip this rule only.
    pub fn exempts(&self, client_ip: Option<IpAddr>, user_id: Option<&str>) -> bool {
        client_ip.is_some_and(|ip| self.exempt_ips.contains(&ip))
            || user_id.is_some_and(|id| self.exempt_user_ids.contains(id))
    }
}

/// The outcome of one rule for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDecision {
    pub rule_id: String,
    pub key: String,
    pub decision: Decision,
}

pub struct RuleMatcher;

impl RuleMatcher {
    /// Rules whose filters match, in declaration order. Falls back to the
    /// configured default rule when nothing matches.
    pub fn applicable_rules<'a>(
        config: &'a CompiledConfig,
        method: &Method,
        path: &str,
    ) -> Vec<&'a CompiledRule> {
        let matched: Vec<&CompiledRule> = config
            .rules
            .iter()
            .filter(|rule| rule.matches(method, path))
            .collect();

        if matched.is_empty() {
            config.default_rule.iter().collect()
        } else {
            matched
        }
    }

    /// Pick the decision to report for a request.
    ///
    /// Any denial denies the request; among denials the one with the longest
    /// `retry_after` is reported. When everything is allowed, the rule with
    /// the least `remaining` is reported. Ties go to the earliest rule.
    pub fn aggregate(decisions: &[RuleDecision]) -> Option<&RuleDecision> {
        let denying = decisions
            .iter()
            .filter(|d| !d.decision.allowed)
            .fold(None::<&RuleDecision>, |best, current| match best {
                Some(b) if b.decision.retry_after >= current.decision.retry_after => Some(b),
                _ => Some(current),
            });

        denying.or_else(|| {
            decisions.iter().fold(None, |best, current| match best {
                Some(b) if b.decision.remaining <= current.decision.remaining => Some(b),
                _ => Some(current),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit_config::{RateLimitConfig, Strategy, Window};

    fn decision(rule_id: &str, allowed: bool, remaining: u64, retry_after: Option<u64>) -> RuleDecision {
        RuleDecision {
            rule_id: rule_id.to_string(),
            key: format!("ratelimit:{}", rule_id),
            decision: Decision {
                allowed,
                limit: 10,
                remaining,
                reset_at: 1_000,
                retry_after,
                degraded: false,
            },
        }
    }

    #[test]
    fn test_prefix_pattern_is_segment_aware() {
        let pattern = PathPattern::parse("/api/v1/auth").unwrap();
        assert!(pattern.matches("/api/v1/auth"));
        assert!(pattern.matches("/api/v1/auth/login"));
        assert!(!pattern.matches("/api/v1/authz"));
        assert!(!pattern.matches("/api/v2/auth"));
    }

    #[test]
    fn test_template_patterns() {
        let pattern = PathPattern::parse("/users/{id}/orders").unwrap();
        assert!(pattern.is_template());
        assert!(pattern.matches("/users/42/orders"));
        assert!(!pattern.matches("/users/42/7/orders"));

        let wildcard = PathPattern::parse("/reports/*").unwrap();
        assert!(wildcard.matches("/reports/2024/q1.pdf"));
        assert!(!wildcard.matches("/report"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(PathPattern::parse("api").is_err());
        assert!(PathPattern::parse("/users/{}").is_err());
        assert!(PathPattern::parse("/users/id}").is_err());
        assert!(PathPattern::parse("/users/{id").is_err());
    }

    #[test]
    fn test_method_filter() {
        let rule = RateLimitRule::new(Strategy::UserId, Window::Hour, 100)
            .with_methods(["post", "DELETE"]);
        let compiled = CompiledRule::compile(&rule).unwrap();
        assert!(compiled.matches(&Method::POST, "/anything"));
        assert!(compiled.matches(&Method::DELETE, "/anything"));
        assert!(!compiled.matches(&Method::GET, "/anything"));
    }

    #[test]
    fn test_all_matching_rules_in_declaration_order() {
        let config = RateLimitConfig::with_rules(vec![
            RateLimitRule::new(Strategy::IpAddress, Window::Minute, 5)
                .named("login")
                .with_paths(["/login"]),
            RateLimitRule::new(Strategy::IpAddress, Window::Minute, 100).named("all"),
            RateLimitRule::new(Strategy::Global, Window::Second, 1000)
                .named("writes")
                .with_methods(["POST"]),
        ])
        .compile()
        .unwrap();

        let ids: Vec<&str> = RuleMatcher::applicable_rules(&config, &Method::POST, "/login")
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["login", "all", "writes"]);

        let ids: Vec<&str> = RuleMatcher::applicable_rules(&config, &Method::GET, "/items")
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["all"]);
    }

    #[test]
    fn test_default_rule_when_nothing_matches() {
        let mut config = RateLimitConfig::with_rules(vec![RateLimitRule::new(
            Strategy::IpAddress,
            Window::Minute,
            5,
        )
        .with_paths(["/login"])]);
        config.default_rule = Some(RateLimitRule::new(Strategy::IpAddress, Window::Minute, 50).named("fallback"));
        let compiled = config.compile().unwrap();

        let rules = RuleMatcher::applicable_rules(&compiled, &Method::GET, "/items");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "fallback");
    }

    #[test]
    fn test_rule_level_exemptions() {
        let rule = RateLimitRule::new(Strategy::IpAddress, Window::Minute, 5)
            .with_exempt_ips(["10.0.0.1".parse().unwrap()])
            .with_exempt_user_ids(["svc"]);
        let compiled = CompiledRule::compile(&rule).unwrap();
        assert!(compiled.exempts(Some("10.0.0.1".parse().unwrap()), None));
        assert!(compiled.exempts(None, Some("svc")));
        assert!(!compiled.exempts(Some("10.0.0.2".parse().unwrap()), Some("alice")));
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let decisions = vec![
            decision("loose", true, 90, None),
            decision("strict", false, 0, Some(30)),
        ];
        let reported = RuleMatcher::aggregate(&decisions).unwrap();
        assert_eq!(reported.rule_id, "strict");
        assert!(!reported.decision.allowed);
    }

    #[test]
    fn test_longest_retry_reported_among_denials() {
        let decisions = vec![
            decision("per-second", false, 0, Some(1)),
            decision("per-hour", false, 0, Some(1800)),
            decision("per-day", false, 0, Some(1800)),
        ];
        assert_eq!(RuleMatcher::aggregate(&decisions).unwrap().rule_id, "per-hour");
    }

    #[test]
    fn test_smallest_remaining_reported_among_allows() {
        let decisions = vec![
            decision("a", true, 7, None),
            decision("b", true, 2, None),
            decision("c", true, 2, None),
        ];
        assert_eq!(RuleMatcher::aggregate(&decisions).unwrap().rule_id, "b");
        assert!(RuleMatcher::aggregate(&[]).is_none());
    }
}
