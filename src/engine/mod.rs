//! The control loops and their shared substrate
//!
//! Three long-lived tasks communicate only through the bounded pools and
//! the breaker/stat registries in [`context::Context`]: the elective loop
//! (single writer of the goal state), the login loop and the optional
//! captcha probe.

pub mod breakers;
pub mod context;
pub mod elective;
pub mod login;
pub mod probe;
pub mod stats;

use std::sync::Arc;

use anyhow::Context as _;

pub use breakers::{Breakers, OfflineAdvice, compute_backoff, jittered_interval};
pub use context::Context;
pub use elective::ElectiveLoop;
pub use stats::RuntimeStats;

/// Run the whole agent: spawn the login loop (and probe when enabled),
/// drive the elective loop to completion, then wait for the others to
/// drain. Returns once every goal is elected, ignored, or the round
/// budget is spent.
pub async fn run_agent(ctx: Arc<Context>) -> anyhow::Result<()> {
    let login = tokio::spawn(login::run_login_loop(Arc::clone(&ctx)));
    let probe = ctx
        .config
        .captcha
        .probe_enabled
        .then(|| tokio::spawn(probe::run_probe_loop(Arc::clone(&ctx))));

    let elective = ElectiveLoop::new(Arc::clone(&ctx))
        .map_err(|e| anyhow::anyhow!(e.to_string()))
        .context("elective loop setup failed")?;
    elective.run().await;

    login.await.context("login loop panicked")?;
    if let Some(probe) = probe {
        ctx.stop_probe();
        probe.await.context("probe loop panicked")?;
    }
    Ok(())
}
