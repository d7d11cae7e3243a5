// Preview reaper - periodic sweep over all session slots

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use atelier_common::SessionId;

use super::{exit_reason, PreviewOrchestrator, PreviewState};

/// What a single sweep reclaimed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapReport {
    /// Previews whose process exited on its own; marked failed, port released.
    pub failed: Vec<SessionId>,
    /// Previews stopped for exceeding the maximum lifetime.
    pub expired: Vec<SessionId>,
    /// Empty session slots dropped from the map.
    pub pruned: usize,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.failed.is_empty() && self.expired.is_empty() && self.pruned == 0
    }
}

impl PreviewOrchestrator {
    /// Starts the background reaper. The task runs until aborted.
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.reaper_loop(interval).await;
        })
    }

    async fn reaper_loop(self, interval: Duration) {
        debug!(?interval, "preview reaper started");
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let report = self.reap_once().await;
            if !report.is_empty() {
                debug!(
                    failed = report.failed.len(),
                    expired = report.expired.len(),
                    pruned = report.pruned,
                    "reaper sweep"
                );
            }
        }
    }

    /// One sweep. Slots busy with a start/stop are skipped until next time.
    pub async fn reap_once(&self) -> ReapReport {
        let mut report = ReapReport::default();
        let max_lifetime = self.inner.options.max_lifetime;

        for (session_id, slot) in self.all_slots() {
            let Ok(_op) = slot.ops.try_lock() else {
                continue;
            };

            let mut expired = false;
            {
                let mut guard = slot.instance.write().await;
                let Some(instance) = guard.as_mut() else {
                    continue;
                };
                if instance.failure.is_some() || !instance.state.is_live() {
                    continue;
                }

                if !instance.handle.is_alive() {
                    let reason = format!("dev server exited unexpectedly ({})", exit_reason(instance.handle.as_ref()));
                    warn!(session_id = %session_id, port = instance.port, "{reason}");
                    if let Err(err) = instance.handle.kill() {
                        warn!(session_id = %session_id, "kill of leftover process group failed: {err}");
                    }
                    self.inner.ports.release(instance.port);
                    instance.state = PreviewState::Failed;
                    instance.failure = Some(reason);
                    report.failed.push(session_id.clone());
                    continue;
                }

                if let Some(limit) = max_lifetime {
                    let age = Utc::now()
                        .signed_duration_since(instance.started_at)
                        .to_std()
                        .unwrap_or_default();
                    expired = instance.state == PreviewState::Running && age > limit;
                }
            }

            if expired {
                warn!(session_id = %session_id, "preview exceeded max lifetime, stopping");
                self.stop_locked(&slot, &session_id).await;
                report.expired.push(session_id);
            }
        }

        report.pruned = self.prune_idle_slots();
        report
    }

    fn prune_idle_slots(&self) -> usize {
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|_, slot| {
            let in_use = Arc::strong_count(slot) > 1;
            let empty = slot
                .instance
                .try_read()
                .map(|instance| instance.is_none())
                .unwrap_or(false);
            in_use || !empty
        });
        before - slots.len()
    }
}
