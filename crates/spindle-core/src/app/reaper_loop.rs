//! ReaperLoop - 失われた lease と滞留した restore 行の回収
//!
//! TaskManager の heartbeat 監視と、prep/pull の古い IN_PROGRESS 行の
//! 差し戻しを 1 本のループでまとめて行う。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

use super::Dispatcher;

/// ReaperLoop は `Dispatcher::reap` を一定間隔で呼ぶ
///
/// # フロー
/// 1. 各 division で monitor_lost_tasks（lease ごとに lost を 1 回だけ）
/// 2. PREP_IN_PROGRESS の古い行 → REGISTERED
/// 3. pull の古い IN_PROGRESS 行 → REGISTERED、その volume の lock を解除
pub struct ReaperLoop {
    dispatcher: Arc<Dispatcher>,
    every: Duration,
}

impl ReaperLoop {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let every = Duration::from_secs(dispatcher.settings().reaper_interval_secs.max(1));
        Self { dispatcher, every }
    }

    pub fn every(mut self, every: Duration) -> Self {
        self.every = every;
        self
    }

    /// Runs until `shutdown` flips to true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 起動直後の 1 回目は飛ばす。再起動直後の service はまだ heartbeat を送れていない
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    for (division, report) in self.dispatcher.reap().await {
                        if report.lost.leases.is_empty() && report.lost.services.is_empty() {
                            continue;
                        }
                        info!(%division, services = ?report.lost.services, leases = report.lost.leases.len(), "lost services reaped");
                    }
                }
            }
        }
        debug!("reaper loop stopped");
    }
}
