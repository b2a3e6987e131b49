//! Sliding-window rate limiting and per-action rules.

mod rules;
mod sliding;

pub use rules::{LimitRule, LimitRules, TimeUnit};
pub use sliding::{LimitConfig, RateLimiter};
