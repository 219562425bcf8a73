use crate::algorithms::{Clock, Decision, RateLimitAlgorithm, SlidingWindowLimiter, SystemClock};
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::key_generator::{KeyGenerator, RequestAttributes};
use crate::metrics::MetricsCollector;
use crate::rate_limit_config::{CompiledConfig, RateLimitConfig, Window};
use crate::rule_matcher::{CompiledRule, RuleDecision, RuleMatcher};
use crate::store::CounterStore;
use arc_swap::ArcSwap;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a request was let through without consulting any rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    Disabled,
    ExemptPath,
    ExemptSubject,
    NoApplicableRules,
}

/// Outcome of admission control for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Bypassed(BypassReason),
    Evaluated {
        decision: Decision,
        rule_id: String,
        emit_headers: bool,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        match self {
            Admission::Bypassed(_) => true,
            Admission::Evaluated { decision, .. } => decision.allowed,
        }
    }

    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Admission::Bypassed(_) => None,
            Admission::Evaluated { decision, .. } => Some(decision),
        }
    }
}

/// Main throttler service: owns the configuration snapshot and runs
/// admission control for each request.
pub struct Throttler {
    config: ArcSwap<CompiledConfig>,
    limiter: SlidingWindowLimiter,
    keys: KeyGenerator,
    metrics: MetricsCollector,
    missing_peer_warned: AtomicBool,
}

impl Throttler {
    /// Create a new throttler instance. Fails only on invalid configuration.
    pub fn new(
        config: RateLimitConfig,
        store: Arc<dyn CounterStore>,
        key_secret: impl AsRef<[u8]>,
    ) -> ThrottlerResult<Self> {
        Self::with_clock(config, store, key_secret, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: RateLimitConfig,
        store: Arc<dyn CounterStore>,
        key_secret: impl AsRef<[u8]>,
        clock: Arc<dyn Clock>,
    ) -> ThrottlerResult<Self> {
        let compiled = config.compile()?;
        info!(
            target: "gatekeeper::throttler",
            rules = compiled.rules.len(),
            enabled = compiled.enabled,
            backend = store.backend(),
            "Rate limiting configured"
        );

        Ok(Self {
            config: ArcSwap::from_pointee(compiled),
            limiter: SlidingWindowLimiter::new(store, clock),
            keys: KeyGenerator::new(key_secret),
            metrics: MetricsCollector::new(),
            missing_peer_warned: AtomicBool::new(false),
        })
    }

    /// The snapshot currently in force.
    pub fn config(&self) -> Arc<CompiledConfig> {
        self.config.load_full()
    }

    /// Validate `config` and install it. On error the previous snapshot stays.
    pub fn reload(&self, config: RateLimitConfig) -> ThrottlerResult<()> {
        let compiled = config.compile()?;
        info!(
            target: "gatekeeper::throttler",
            rules = compiled.rules.len(),
            enabled = compiled.enabled,
            "Rate limit configuration reloaded"
        );
        self.config.store(Arc::new(compiled));
        Ok(())
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        self.limiter.store()
    }

    /// Decide whether a request may proceed.
    pub async fn check(&self, attrs: &RequestAttributes) -> Admission {
        let config = self.config.load_full();

        if !config.enabled {
            return Admission::Bypassed(BypassReason::Disabled);
        }
        if config.is_exempt_path(&attrs.path) {
            return Admission::Bypassed(BypassReason::ExemptPath);
        }

        let client_ip = KeyGenerator::resolve_client_ip(attrs, &config.trusted_proxies);
        let user_id = attrs.user_id.as_deref();
        if config.exemptions.covers(client_ip, user_id) {
            debug!(
                target: "gatekeeper::throttler",
                client_ip = ?client_ip,
                user_id = ?user_id,
                "Exempt subject, skipping rate limits"
            );
            self.metrics.record_exempt();
            return Admission::Bypassed(BypassReason::ExemptSubject);
        }

        let mut pending = Vec::new();
        for rule in RuleMatcher::applicable_rules(&config, &attrs.method, &attrs.path) {
            if rule.exempts(client_ip, user_id) {
                continue;
            }

            let key = match self.keys.generate_key(&config.key_prefix, rule, attrs, &config.trusted_proxies) {
                Ok(key) => key,
                Err(ThrottlerError::InvalidSubject(reason)) => {
                    if attrs.peer_ip.is_none() && !self.missing_peer_warned.swap(true, Ordering::Relaxed) {
                        warn!(
                            target: "gatekeeper::throttler",
                            rule = %rule.id,
                            "Request has no peer address; IP-based rules are skipped. \
                             Serve with into_make_service_with_connect_info::<SocketAddr>()"
                        );
                    }
                    debug!(
                        target: "gatekeeper::throttler",
                        rule = %rule.id,
                        reason,
                        "Rule skipped"
                    );
                    self.metrics.record_skipped_rule();
                    continue;
                }
                Err(err) => {
                    warn!(target: "gatekeeper::throttler", rule = %rule.id, error = %err, "Rule skipped");
                    self.metrics.record_skipped_rule();
                    continue;
                }
            };

            if key.degraded_to_ip {
                debug!(
                    target: "gatekeeper::throttler",
                    rule = %rule.id,
                    client_ip = ?client_ip,
                    "Unauthenticated request, user rule keyed by client IP"
                );
                self.metrics.record_user_fallback();
            }

            pending.push(self.evaluate_rule(rule, key.value, &config));
        }

        let decisions = join_all(pending).await;
        for outcome in decisions.iter().filter(|d| d.decision.degraded) {
            debug!(target: "gatekeeper::throttler", rule = %outcome.rule_id, "Rule failed open");
            self.metrics.record_store_failure();
        }

        let Some(reported) = RuleMatcher::aggregate(&decisions) else {
            return Admission::Bypassed(BypassReason::NoApplicableRules);
        };

        self.metrics.record_request(reported.decision.allowed);
        if !reported.decision.allowed {
            info!(
                target: "gatekeeper::throttler",
                rule = %reported.rule_id,
                key = %reported.key,
                method = %attrs.method,
                path = %attrs.path,
                retry_after = reported.decision.retry_after,
                "Rate limit exceeded"
            );
        }

        Admission::Evaluated {
            decision: reported.decision.clone(),
            rule_id: reported.rule_id.clone(),
            emit_headers: config.enable_headers,
        }
    }

    async fn evaluate_rule(&self, rule: &CompiledRule, key: String, config: &CompiledConfig) -> RuleDecision {
        let decision = self
            .limiter
            .evaluate(&key, &rule.rule, config.store_timeout)
            .await;
        RuleDecision {
            rule_id: rule.id.clone(),
            key,
            decision,
        }
    }

    /// Current usage of a bucket, for inspection.
    pub async fn bucket_usage(&self, key: &str, window: Window) -> ThrottlerResult<u64> {
        let timeout = self.config.load().store_timeout;
        self.limiter.usage(key, window, timeout).await
    }

    /// Clear a bucket.
    pub async fn reset_bucket(&self, key: &str) -> ThrottlerResult<bool> {
        let removed = self.limiter.reset(key).await?;
        info!(target: "gatekeeper::throttler", key = %key, removed, "Bucket reset");
        Ok(removed)
    }
}
