//! Republishes job state to external subscribers at a fixed cadence.
//!
//! Subscribers see the latest snapshot once per poll interval rather than
//! every event, so bursts collapse into one update. A stream ends cleanly
//! after delivering one terminal snapshot.

use std::time::Duration;

use futures::Stream;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use vigil_model::{JobId, JobSnapshot};

use crate::{error::Result, registry::JobRegistry, retry::RetryPolicy};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub poll_interval: Duration,
    /// Backoff for re-resolving a job from the store once it left the
    /// active set.
    pub reconnect: RetryPolicy,
    /// Reconnect delay suggested to clients.
    pub retry_hint: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            reconnect: RetryPolicy::default(),
            retry_hint: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventGateway {
    registry: JobRegistry,
    config: GatewayConfig,
}

impl EventGateway {
    pub fn new(registry: JobRegistry, config: GatewayConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Snapshot stream for `id`. Snapshots whose sequence is not newer than
    /// `last_seen` are skipped; the terminal snapshot is always delivered.
    ///
    /// Fails with `NotFound` up front for unknown ids.
    pub async fn snapshots(
        &self,
        id: JobId,
        last_seen: Option<u64>,
    ) -> Result<impl Stream<Item = JobSnapshot> + Send + 'static + use<>> {
        self.registry.snapshot(id).await?;

        let registry = self.registry.clone();
        let config = self.config.clone();
        Ok(async_stream::stream! {
            let mut last_sent = last_seen;
            loop {
                if let Some(mut rx) = registry.watch(id) {
                    let mut ticker = tokio::time::interval(config.poll_interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    loop {
                        ticker.tick().await;
                        let closed = rx.has_changed().is_err();
                        let (snapshot, terminal) = {
                            let live = rx.borrow_and_update();
                            (live.snapshot(), live.record.is_terminal())
                        };
                        if terminal {
                            yield snapshot;
                            return;
                        }
                        if last_sent.is_none_or(|seen| snapshot.sequence > seen) {
                            last_sent = Some(snapshot.sequence);
                            yield snapshot;
                        }
                        if closed {
                            debug!(job_id = %id, "live channel closed before a terminal snapshot");
                            break;
                        }
                    }
                }

                let resolved = config
                    .reconnect
                    .run("resolve job", || registry.get_status(id))
                    .await;
                match resolved {
                    Ok(record) if record.is_terminal() => {
                        let sequence = last_sent.map_or(1, |seen| seen + 1);
                        yield JobSnapshot::from_record(&record, sequence);
                        return;
                    }
                    Ok(record) if registry.is_active(id) => {
                        debug!(job_id = %id, status = %record.status, "job still active; resubscribing");
                    }
                    Ok(record) => {
                        // A row no orchestrator owns; report it and stop.
                        let sequence = last_sent.map_or(1, |seen| seen + 1);
                        yield JobSnapshot::from_record(&record, sequence);
                        return;
                    }
                    Err(err) => {
                        debug!(job_id = %id, error = %err, "job vanished while streaming");
                        return;
                    }
                }
            }
        })
    }
}
