use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use log::{debug, warn};
use mac_address::MacAddress;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::allowlist;
use crate::config::PresenceConfig;
use crate::presence::{PresenceState, ReconcileReport};

/// Periodically syncs the tracked devices with the allow-list file and
/// expires devices that have not been seen recently.
pub struct Reconciler {
    allow_list: PathBuf,
    tracked_output: PathBuf,
    interval: Duration,
    state: Arc<PresenceState>,
}

impl Reconciler {
    pub fn new(config: &PresenceConfig, state: Arc<PresenceState>) -> Self {
        Reconciler {
            allow_list: config.allow_list(),
            tracked_output: config.tracked_output(),
            interval: config.reconcile_interval(),
            state,
        }
    }

    /// Returns `None` when the allow-list could not be read; the tracked set
    /// is left as it was.
    pub async fn tick(&self, now: Instant) -> Option<ReconcileReport> {
        let allow_list = match allowlist::load(&self.allow_list).await {
            Ok(allow_list) => allow_list,
            Err(err) => {
                warn!("Keeping tracked devices: {:#}", err);
                return None;
            }
        };

        let report = self.state.reconcile(&allow_list, now).await;
        report.log();
        debug!("Tracking {} device(s), {} live", report.tracked.len(), report.live);

        if let Err(err) = write_tracked(&self.tracked_output, &report.tracked).await {
            warn!("{:#}", err);
        }

        Some(report)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.tick(Instant::now()).await;

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        debug!("Reconciler stopped");
    }
}

pub async fn write_tracked(path: &Path, addresses: &[MacAddress]) -> anyhow::Result<()> {
    let contents: String = addresses.iter().map(|a| format!("{a}\n")).collect();
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("writing tracked devices to {}", path.display()))
}
