//! Latchkey - Distributed Locks and Rate Limiting
//!
//! Coordination primitives for horizontally scaled services sharing one
//! Redis-compatible store: a token-owned lease lock with retry and automatic
//! renewal, a manager that reuses lock instances per resource, and a
//! sliding-window rate limiter.

pub mod config;
pub mod context;
pub mod error;
pub mod lock;
pub mod ratelimit;
pub mod store;
