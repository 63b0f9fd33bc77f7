//! Test helpers for benchq.
//!
//! - [`ScriptedTool`]: `sh` scripts standing in for the benchmarking tool.
//! - [`MetricPublisher`]: a PUB socket emitting `[topic$, json]` frames.
//! - [`RecordingStore`]: a [`benchq::RunStore`] that records every status
//!   transition and can inject failures.

mod publisher;
mod store;
mod tool;

pub use publisher::MetricPublisher;
pub use store::{RecordingStore, Transition};
pub use tool::ScriptedTool;

use std::future::Future;
use std::time::Duration;

/// Poll `check` every 10ms until it returns true or `limit` elapses.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Install a test tracing subscriber honouring `RUST_LOG`. Safe to call
/// from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("benchq=debug")),
        )
        .with_test_writer()
        .try_init();
}
