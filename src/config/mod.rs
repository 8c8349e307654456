//! Configuration loading and types
//!
//! See [`types::Config`] for the full structure and [`ini`] for the file
//! format. The typed `Config` value is the contract between the loader and
//! the rest of the crate; everything downstream takes it by `Arc`.

pub mod ini;
pub mod types;

pub use ini::{ConfigError, from_ini_path, from_ini_str};
pub use types::{
    BackoffConfig, CaptchaConfig, ClientConfig, Config, NetConfig, NotifyConfig, RateLimitConfig,
    ResilienceConfig, RuntimeConfig, UserConfig,
};
