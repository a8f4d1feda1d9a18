//! Floodgate - Rate Limiting and Admission Control Engine
//!
//! This crate implements an embeddable admission-control core: fixed-window
//! rate limiting over a two-tier store (a fast in-process tier with a
//! transactional SQLite fallback), a manual block registry, and a PII-safe
//! audit event trail. The host application asks [`engine::RateLimitEngine`]
//! whether a request may proceed; everything else is plumbing behind it.

pub mod blocks;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod metrics;
pub mod rules;
pub mod store;

pub use blocks::{BlockFilter, ManualBlockParams, UserBlock};
pub use config::EngineSettings;
pub use engine::{CheckOptions, LimitDecision, RateLimitEngine};
pub use error::{FloodgateError, Result};
pub use rules::{LimitMode, RateLimitConfig};
pub use store::{DurableStore, HealthStatus, StateAction, StateFilter};
