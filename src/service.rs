// Copyright 2024-2025 Tree xie.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::config::{AppConf, ConfLoader};
use crate::metrics::Stats;
use crate::reconcile::Reconciler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

pub static LOG_CATEGORY: &str = "service";

/// Reconciliation happens at least this often even without config changes,
/// so renewals keep moving when the file never changes.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(3600);

const PRINT_EXPORTER_INTERVAL: Duration = Duration::from_secs(60);

/// Forwards every successfully loaded config change into a channel the
/// scheduler consumes.
pub fn spawn_config_watcher(
    loader: Arc<ConfLoader>,
) -> mpsc::Receiver<Arc<AppConf>> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        loop {
            let conf = loader.watch().await;
            if tx.send(conf).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Emits reconciliation runs on a fixed ticker and on config changes,
/// processing them strictly sequentially. Runs once immediately at boot.
pub async fn run_scheduler(
    reconciler: Reconciler,
    initial: Arc<AppConf>,
    mut changes: mpsc::Receiver<Arc<AppConf>>,
) {
    info!(
        category = LOG_CATEGORY,
        interval = format!("{RECONCILE_INTERVAL:?}"),
        "reconciliation scheduler is running"
    );
    let mut conf = initial;
    reconciler.run(&conf).await;

    let mut ticker = interval(RECONCILE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately and the boot run already happened
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {},
            changed = changes.recv() => {
                match changed {
                    Some(new_conf) => conf = new_conf,
                    None => break,
                }
            },
        }
        reconciler.run(&conf).await;
    }
}

/// Dumps the metric registry to the log on a fixed cadence. Enabled through
/// the `USE_PRINT_EXPORTER` environment variable next to the primary
/// exporter.
pub fn spawn_print_exporter(stats: Arc<Stats>) {
    tokio::spawn(async move {
        let mut ticker = interval(PRINT_EXPORTER_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match stats.encode() {
                Ok(metrics) => {
                    info!(category = LOG_CATEGORY, metrics, "metrics dump");
                },
                Err(e) => {
                    error!(
                        category = LOG_CATEGORY,
                        error = e.to_string(),
                        "encode metrics fail"
                    );
                },
            }
        }
    });
}
