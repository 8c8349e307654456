//! Resilient auto-enrollment agent for the supplementary course-election
//! site.
//!
//! The crate is built around one control loop ([`engine::ElectiveLoop`])
//! and its resilience substrate: generation-stamped session pools, a
//! pluggable captcha chain with an adaptive router, and a coordinated
//! circuit-breaker hierarchy (OFFLINE, operation-window backoff,
//! auth/HTML-parse streaks, captcha degrade). Everything shares one
//! explicit [`engine::Context`]; there is no module-level state.

pub mod captcha;
pub mod client;
pub mod config;
pub mod course;
pub mod engine;
pub mod error;
pub mod fixtures;
pub mod net;
pub mod notify;
pub mod parser;
pub mod preflight;
pub mod rate_limit;
pub mod rehearsal;

pub use captcha::{Captcha, Recognizer};
pub use client::{PoolManager, Session, SessionPool};
pub use config::Config;
pub use course::{Course, CourseId, GoalSet};
pub use engine::{Context, ElectiveLoop, RuntimeStats, run_agent};
pub use error::{ElectOutcome, ElectiveError, IgnoreReason, RecognizerError};
pub use notify::Notifier;
pub use preflight::{PreflightIssue, run_preflight};
pub use rate_limit::RateLimiter;
