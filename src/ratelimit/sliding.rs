//! Sliding-window rate limiter backed by a sorted set per key.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use super::rules::LimitRules;
use crate::config::{default_key_prefix, RateLimitingConfig};
use crate::context::OpContext;
use crate::error::{LatchkeyError, Result};
use crate::store::KeyValueStore;

/// Window length and request budget for one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    pub window_size: Duration,
    pub max_requests: u64,
}

impl LimitConfig {
    pub fn new(window_size: Duration, max_requests: u64) -> Self {
        Self {
            window_size,
            max_requests,
        }
    }
}

/// Distributed sliding-window rate limiter.
///
/// Every admitted request is a member of the sorted set
/// `<prefix>sliding:<key>`, scored by its arrival time in milliseconds.
/// Rejected requests are removed again so they do not consume budget.
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    key_prefix: String,
    rules: RwLock<LimitRules>,
    compensation_timeout: Duration,
}

impl RateLimiter {
    /// Create a limiter. An empty prefix falls back to `"rate_limit:"`.
    pub fn new(store: Arc<dyn KeyValueStore>, key_prefix: impl Into<String>) -> Self {
        let mut key_prefix = key_prefix.into();
        if key_prefix.is_empty() {
            key_prefix = default_key_prefix();
        }
        Self {
            store,
            key_prefix,
            rules: RwLock::new(LimitRules::default()),
            compensation_timeout: Duration::from_secs(1),
        }
    }

    /// Create a limiter from configuration, loading the rules file if one is set.
    pub fn with_config(store: Arc<dyn KeyValueStore>, config: &RateLimitingConfig) -> Result<Self> {
        let mut limiter = Self::new(store, config.key_prefix.clone());
        limiter.compensation_timeout = config.compensation_timeout();
        if let Some(path) = &config.rules_path {
            limiter.set_rules(LimitRules::from_file(path)?);
        }
        Ok(limiter)
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Replace the per-action rules.
    pub fn set_rules(&self, rules: LimitRules) {
        debug!(actions = rules.actions.len(), "Updating rate limit rules");
        *self.rules.write() = rules;
    }

    fn window_key(&self, key: &str) -> String {
        format!("{}sliding:{}", self.key_prefix, key)
    }

    /// Record a request for `key` and report whether it fits the window.
    ///
    /// Add, trim, count and expiry run as one atomic pipeline. A request
    /// over budget is removed again before returning `false`.
    pub async fn sliding_window_allow(
        &self,
        ctx: &OpContext,
        key: &str,
        config: LimitConfig,
    ) -> Result<bool> {
        let window_key = self.window_key(key);
        let now = chrono::Utc::now().timestamp_millis();
        let member = format!("{}:{}", now, rand::random::<u64>() >> 1);
        let window_ms = i64::try_from(config.window_size.as_millis()).unwrap_or(i64::MAX);

        let count = ctx
            .call(
                "sliding_window_allow",
                &window_key,
                self.store.record_request(
                    &window_key,
                    &member,
                    now,
                    now.saturating_sub(window_ms),
                    config.window_size.saturating_mul(2),
                ),
            )
            .await?;

        trace!(key = %window_key, count, max = config.max_requests, "Window counted");

        if count > config.max_requests {
            self.compensate(&window_key, &member).await;
            debug!(key = %window_key, count, max = config.max_requests, "Request rate limited");
            return Ok(false);
        }
        Ok(true)
    }

    /// Remove a rejected request, independently of the caller's context.
    async fn compensate(&self, window_key: &str, member: &str) {
        let ctx = OpContext::with_timeout(self.compensation_timeout);
        if let Err(e) = ctx
            .call(
                "compensate",
                window_key,
                self.store.remove_member(window_key, member),
            )
            .await
        {
            warn!(key = %window_key, error = %e, "Failed to remove rejected request from window");
        }
    }

    /// Like [`sliding_window_allow`](Self::sliding_window_allow), with rejection as `RateLimited`.
    pub async fn allow(&self, ctx: &OpContext, key: &str, config: LimitConfig) -> Result<()> {
        if self.sliding_window_allow(ctx, key, config).await? {
            Ok(())
        } else {
            Err(LatchkeyError::RateLimited)
        }
    }

    /// Make up to `max_retries` attempts, sleeping `delay` between them.
    ///
    /// Only `RateLimited` is retried; any other error returns immediately.
    pub async fn allow_with_retry(
        &self,
        ctx: &OpContext,
        key: &str,
        config: LimitConfig,
        max_retries: u32,
        delay: Duration,
    ) -> Result<()> {
        for attempt in 0..max_retries {
            match self.allow(ctx, key, config).await {
                Err(LatchkeyError::RateLimited) => {}
                other => return other,
            }
            if attempt + 1 < max_retries {
                ctx.sleep(delay).await?;
            }
        }
        Err(LatchkeyError::RateLimited)
    }

    /// Requests currently recorded for `key`, including ones not yet trimmed.
    pub async fn current_count(&self, ctx: &OpContext, key: &str) -> Result<u64> {
        let window_key = self.window_key(key);
        ctx.call("current_count", &window_key, self.store.member_count(&window_key))
            .await
    }

    /// Check `subject` against the rule configured for `action`.
    pub async fn allow_action(&self, ctx: &OpContext, action: &str, subject: &str) -> Result<()> {
        let config = {
            let rules = self.rules.read();
            let rule = rules.find(action).ok_or_else(|| {
                LatchkeyError::Config(format!("No rate limit rule for action '{}'", action))
            })?;
            LimitConfig::from(rule)
        };
        self.allow(ctx, &format!("{}:{}", action, subject), config)
            .await
    }
}
