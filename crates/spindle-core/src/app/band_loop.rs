//! BandScheduleLoop - pull の追加優先度帯を時刻で開ける
//!
//! 毎時 0 分と 30 分に short 帯、20:00 に long 帯を全 division で有効にする。
//! 帯を閉じるのは PullQueue 側（backlog が空になった時点で自動的に閉じる）。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

use super::Dispatcher;
use crate::ports::Clock;
use crate::restore::Band;

/// Bands due at `now`, checked once per minute.
pub fn bands_due(now: DateTime<Utc>) -> Vec<Band> {
    let mut due = Vec::new();
    if now.minute() == 0 || now.minute() == 30 {
        due.push(Band::Short);
    }
    if now.hour() == 20 && now.minute() == 0 {
        due.push(Band::Long);
    }
    due
}

pub struct BandScheduleLoop {
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
}

impl BandScheduleLoop {
    pub fn new(dispatcher: Arc<Dispatcher>, clock: Arc<dyn Clock>) -> Self {
        Self { dispatcher, clock }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_minute: Option<i64> = None;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let now = self.clock.now();
                    let minute = now.timestamp() / 60;
                    // 同じ分に 2 回 tick しても 1 回だけ
                    if last_minute == Some(minute) {
                        continue;
                    }
                    last_minute = Some(minute);
                    for band in bands_due(now) {
                        info!(?band, "enabling pull band");
                        self.dispatcher.enable_band_everywhere(band).await;
                    }
                }
            }
        }
        debug!("band schedule loop stopped");
    }
}
