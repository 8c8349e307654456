//! Upstream HTTP plumbing: endpoints, referers and response classification.

pub mod classifier;
pub mod urls;

pub use classifier::{
    TIP_RULES, TipOutcome, check_html_state, check_status, classify_elect, classify_iaaa_login,
    parse_validate,
};
pub use urls::Endpoints;
