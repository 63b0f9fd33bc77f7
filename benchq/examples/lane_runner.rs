//! Submit benchmark runs to two lanes and follow them to completion.
//!
//! Configuration comes from `BENCHQ_*` environment variables; the target
//! server from `BENCHQ_EXAMPLE_URL` and `BENCHQ_EXAMPLE_MODEL`.
//!
//! ```sh
//! BENCHQ_EXAMPLE_URL=http://localhost:8000 BENCHQ_EXAMPLE_MODEL=llama \
//!     RUST_LOG=benchq=debug cargo run --example lane_runner
//! ```

use std::collections::HashSet;

use benchq::*;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("benchq=info")))
        .with(fmt::layer())
        .init();

    let url = std::env::var("BENCHQ_EXAMPLE_URL").unwrap_or_else(|_| "http://localhost:8000".into());
    let model = std::env::var("BENCHQ_EXAMPLE_MODEL").unwrap_or_else(|_| "llama".into());

    let controller = RunController::in_memory(OrchestratorConfig::from_env()?)?;
    let mut events = controller.subscribe_events();

    let mut pending = HashSet::new();
    for (lane, concurrency) in [("gpu-a", 1), ("gpu-a", 4), ("gpu-b", 8)] {
        let config = RunConfig::new(&model, &url, &model)
            .with_request_count(50)
            .with_concurrency(concurrency);
        let run = controller.submit(lane, config).await?;
        println!("submitted {} on {lane} (concurrency {concurrency})", run.id);
        pending.insert(run.id);
    }

    while !pending.is_empty() {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                println!("missed {skipped} events");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };

        match &event.payload {
            RunEventPayload::MetricsAttached { endpoint, .. } => {
                println!("[{}] {} metrics at {endpoint}", event.lane, event.run_id);
            }
            RunEventPayload::Started { pid } => {
                println!("[{}] {} started (pid {pid:?})", event.lane, event.run_id);
            }
            RunEventPayload::Finished { status, error } => {
                let summary = controller.metric_summary(event.run_id).await?;
                println!(
                    "[{}] {} {status}: {} metrics {:?}{}",
                    event.lane,
                    event.run_id,
                    summary.total_count,
                    summary.topics,
                    error.as_deref().map(|e| format!(" ({e})")).unwrap_or_default(),
                );
                pending.remove(&event.run_id);
            }
            _ => {}
        }
    }

    for lane in controller.lane_snapshot().await {
        println!("lane {}: depth {}", lane.lane, lane.depth);
    }
    controller.stop().await;
    Ok(())
}
