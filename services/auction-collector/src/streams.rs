//! Polling stream lifecycle
//!
//! Loads each configured stream's template, fills the pool before the first
//! poll, and runs one `poll_loop` task per stream until cancellation or the
//! stream's own circuit breaker stops it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use companion_pool::CredentialPool;
use companion_poll::{CYCLE_KEYS, LoopExit, LoopSummary, PollingOrchestrator, RequestTemplate};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::metrics;
use crate::sink::{AuctionSink, JsonlWriter};

/// A stream ready to poll.
#[derive(Debug, Clone)]
pub struct Stream {
    pub template: RequestTemplate,
    pub interval: Duration,
}

impl Stream {
    pub fn name(&self) -> &str {
        &self.template.name
    }
}

/// Load and check every stream's template.
///
/// A placeholder that is neither bound per cycle nor by the template or
/// stream context would fail every poll, so it fails start-up instead.
pub async fn load_streams(config: &Config) -> Result<Vec<Stream>> {
    let mut streams = Vec::with_capacity(config.streams.len());
    for stream in &config.streams {
        let template = RequestTemplate::load(&stream.template)
            .await
            .with_context(|| format!("stream {}: failed to load template", stream.name))?
            .with_name(stream.name.clone())
            .with_context(stream.context.clone());

        let unbound = unbound_keys(&template);
        if !unbound.is_empty() {
            anyhow::bail!(
                "stream {}: template {} uses unbound placeholders: {}",
                stream.name,
                stream.template.display(),
                unbound.into_iter().collect::<Vec<_>>().join(", ")
            );
        }

        info!(
            stream = %stream.name,
            template = %stream.template.display(),
            placeholders = template.required_keys().len(),
            "stream template loaded"
        );
        streams.push(Stream {
            interval: config.stream_interval(stream),
            template,
        });
    }
    Ok(streams)
}

fn unbound_keys(template: &RequestTemplate) -> BTreeSet<String> {
    template
        .required_keys()
        .into_iter()
        .filter(|k| !CYCLE_KEYS.contains(&k.as_str()) && !template.context.contains_key(k))
        .collect()
}

/// Mint inline until the pool holds `min_pool_size` healthy bundles.
///
/// Stops at the first mint failure; the maintenance task keeps trying after
/// start-up. Returns the healthy count reached.
pub async fn warm_up(pool: &CredentialPool) -> usize {
    let target = pool.settings().min_pool_size;
    let mut healthy = pool.healthy_count().await;
    let mut attempts = 0;
    while healthy < target && attempts < target {
        attempts += 1;
        match pool.repair_now().await {
            Ok(bundle_id) => info!(bundle_id, "warm-up bundle minted"),
            Err(e) => {
                warn!(error = %e, healthy, target, "warm-up mint failed");
                break;
            }
        }
        healthy = pool.healthy_count().await;
    }
    info!(healthy, target, "credential pool warm-up finished");
    healthy
}

fn exit_reason(exit: &LoopExit) -> &'static str {
    match exit {
        LoopExit::Cancelled => "cancelled",
        LoopExit::CircuitOpen { .. } => "circuit_open",
        LoopExit::Fatal { .. } => "fatal",
    }
}

/// Counts one running stream task. The count goes back down on drop, so a
/// panicking or aborted task is released too.
struct ActiveStream(Arc<AtomicUsize>);

impl ActiveStream {
    fn enter(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Spawn one polling task per stream. Each task resolves to its loop summary.
pub fn spawn_streams(
    orchestrator: Arc<PollingOrchestrator>,
    streams: Vec<Stream>,
    writer: Arc<JsonlWriter>,
    max_consecutive_failures: u32,
    cancel: CancellationToken,
    active: Arc<AtomicUsize>,
) -> JoinSet<LoopSummary> {
    let mut set = JoinSet::new();
    for stream in streams {
        let orchestrator = Arc::clone(&orchestrator);
        let sink = AuctionSink::new(stream.name(), Arc::clone(&writer));
        let cancel = cancel.clone();
        let running = ActiveStream::enter(Arc::clone(&active));

        set.spawn(async move {
            let _running = running;
            let summary = orchestrator
                .poll_loop(
                    &stream.template,
                    &sink,
                    stream.interval,
                    max_consecutive_failures,
                    &cancel,
                )
                .await;

            metrics::record_stream_exit(stream.name(), exit_reason(&summary.exit));
            summary
        });
    }
    set
}
