//! Shared presence state.
//!
//! The tracked-device set and the derived presence flag live behind a single
//! lock. The capture task, the reconciler and the control loop only ever see
//! the operations below, each of which holds the lock for its whole body.

use std::collections::HashSet;
use std::time::Duration;

use log::info;
use mac_address::MacAddress;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackedDevice {
    pub address: MacAddress,
    /// `None` until the device is observed, and again once it expires.
    pub last_seen: Option<Instant>,
}

/// Outcome of feeding one observed address into the state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sighting {
    /// Tracked device that was not live before this observation.
    Arrived,
    Refreshed,
    Untracked,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<MacAddress>,
    pub removed: Vec<MacAddress>,
    pub expired: Vec<MacAddress>,
    /// Tracked set after the call, in allow-list order.
    pub tracked: Vec<MacAddress>,
    pub live: usize,
    pub present: bool,
}

#[derive(Debug, Default)]
struct Inner {
    devices: Vec<TrackedDevice>,
    present: bool,
}

impl Inner {
    fn recompute(&mut self) -> bool {
        self.present = self.devices.iter().any(|d| d.last_seen.is_some());
        self.present
    }
}

#[derive(Debug)]
pub struct PresenceState {
    timeout: Duration,
    inner: Mutex<Inner>,
}

impl PresenceState {
    pub fn new(timeout: Duration) -> Self {
        PresenceState {
            timeout,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Start tracking `allow_list`, with no device live yet.
    pub fn with_devices(allow_list: &[MacAddress], timeout: Duration) -> Self {
        let devices = allow_list
            .iter()
            .map(|&address| TrackedDevice {
                address,
                last_seen: None,
            })
            .collect();
        PresenceState {
            timeout,
            inner: Mutex::new(Inner {
                devices,
                present: false,
            }),
        }
    }

    pub async fn record_seen(&self, address: MacAddress, now: Instant) -> Sighting {
        let mut inner = self.inner.lock().await;
        let Some(device) = inner.devices.iter_mut().find(|d| d.address == address) else {
            return Sighting::Untracked;
        };

        let sighting = match device.last_seen {
            None => Sighting::Arrived,
            Some(_) => Sighting::Refreshed,
        };
        device.last_seen = Some(now);
        inner.recompute();
        sighting
    }

    /// Bring the tracked set in line with `allow_list` and expire devices not
    /// seen for the liveness timeout. The recomputed flag replaces whatever
    /// the capture task set since the last call.
    pub async fn reconcile(&self, allow_list: &[MacAddress], now: Instant) -> ReconcileReport {
        let mut inner = self.inner.lock().await;
        let mut report = ReconcileReport::default();

        let wanted: HashSet<MacAddress> = allow_list.iter().copied().collect();
        let mut tracked: HashSet<MacAddress> = inner.devices.iter().map(|d| d.address).collect();

        inner.devices.retain(|d| {
            let keep = wanted.contains(&d.address);
            if !keep {
                report.removed.push(d.address);
            }
            keep
        });

        for &address in allow_list {
            if tracked.insert(address) {
                inner.devices.push(TrackedDevice {
                    address,
                    last_seen: None,
                });
                report.added.push(address);
            }
        }

        for device in inner.devices.iter_mut() {
            if let Some(last_seen) = device.last_seen {
                if now.saturating_duration_since(last_seen) >= self.timeout {
                    device.last_seen = None;
                    report.expired.push(device.address);
                }
            }
        }

        report.tracked = inner.devices.iter().map(|d| d.address).collect();
        report.live = inner.devices.iter().filter(|d| d.last_seen.is_some()).count();
        report.present = inner.recompute();
        report
    }

    pub async fn query(&self) -> bool {
        self.inner.lock().await.present
    }

    #[cfg(test)]
    pub async fn tracked_addresses(&self) -> Vec<MacAddress> {
        let inner = self.inner.lock().await;
        inner.devices.iter().map(|d| d.address).collect()
    }

    #[cfg(test)]
    pub async fn devices(&self) -> Vec<TrackedDevice> {
        self.inner.lock().await.devices.clone()
    }
}

impl ReconcileReport {
    pub fn log(&self) {
        for address in &self.added {
            info!("Tracking new device {}", address);
        }
        for address in &self.removed {
            info!("No longer tracking device {}", address);
        }
        for address in &self.expired {
            info!("Device is gone: {}", address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(15);

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last])
    }

    fn flag_matches_devices(devices: &[TrackedDevice], flag: bool) -> bool {
        flag == devices.iter().any(|d| d.last_seen.is_some())
    }

    #[tokio::test]
    async fn test_record_seen() {
        let state = PresenceState::with_devices(&[mac(1), mac(2)], TIMEOUT);
        let now = Instant::now();
        assert!(!state.query().await);

        assert_eq!(state.record_seen(mac(9), now).await, Sighting::Untracked);
        assert!(!state.query().await);

        assert_eq!(state.record_seen(mac(1), now).await, Sighting::Arrived);
        assert!(state.query().await);
        assert_eq!(
            state.record_seen(mac(1), now + Duration::from_secs(1)).await,
            Sighting::Refreshed
        );
        assert!(flag_matches_devices(&state.devices().await, state.query().await));
    }

    #[tokio::test]
    async fn test_reconcile_adds_and_removes() {
        let state = PresenceState::with_devices(&[mac(1), mac(2)], TIMEOUT);
        let report = state.reconcile(&[mac(2), mac(3)], Instant::now()).await;
        assert_eq!(report.added, vec![mac(3)]);
        assert_eq!(report.removed, vec![mac(1)]);
        assert!(report.expired.is_empty());
        assert_eq!(report.tracked, vec![mac(2), mac(3)]);
        assert_eq!(state.tracked_addresses().await, report.tracked);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let state = PresenceState::with_devices(&[mac(1), mac(2)], TIMEOUT);
        let seen = Instant::now();
        state.record_seen(mac(2), seen).await;

        let now = seen + Duration::from_secs(1);
        state.reconcile(&[mac(1), mac(2)], now).await;
        let first = state.devices().await;
        let report = state.reconcile(&[mac(1), mac(2)], now).await;
        assert_eq!(state.devices().await, first);
        assert_eq!(report.added.len() + report.removed.len() + report.expired.len(), 0);
        assert!(report.present);
    }

    #[tokio::test]
    async fn test_expiry_happens_at_timeout_and_not_before() {
        let state = PresenceState::with_devices(&[mac(1)], TIMEOUT);
        let seen = Instant::now();
        state.record_seen(mac(1), seen).await;

        let report = state
            .reconcile(&[mac(1)], seen + TIMEOUT - Duration::from_secs(1))
            .await;
        assert!(report.expired.is_empty());
        assert_eq!(report.live, 1);
        assert!(state.query().await);

        let report = state.reconcile(&[mac(1)], seen + TIMEOUT).await;
        assert_eq!(report.expired, vec![mac(1)]);
        assert_eq!(report.live, 0);
        assert!(!state.query().await);
        assert_eq!(state.devices().await[0].last_seen, None);
    }

    #[tokio::test]
    async fn test_removing_live_device_clears_flag() {
        let state = PresenceState::with_devices(&[mac(1), mac(2)], TIMEOUT);
        let now = Instant::now();
        state.record_seen(mac(1), now).await;
        assert!(state.query().await);

        let report = state.reconcile(&[mac(2)], now).await;
        assert_eq!(report.removed, vec![mac(1)]);
        assert!(!report.present);
        assert!(!state.query().await);
        assert_eq!(state.record_seen(mac(1), now).await, Sighting::Untracked);
    }

    #[tokio::test]
    async fn test_reconcile_overrides_flag_from_capture() {
        let state = PresenceState::with_devices(&[mac(1)], TIMEOUT);
        let seen = Instant::now();
        state.record_seen(mac(1), seen).await;
        state.reconcile(&[mac(1)], seen + TIMEOUT * 2).await;
        assert!(flag_matches_devices(&state.devices().await, state.query().await));
        assert!(!state.query().await);
    }

    #[tokio::test]
    async fn test_concurrent_writers_keep_flag_consistent() {
        let state = std::sync::Arc::new(PresenceState::with_devices(&[mac(1), mac(2)], TIMEOUT));
        let start = Instant::now();

        let writer = {
            let state = state.clone();
            tokio::spawn(async move {
                for i in 0..200u64 {
                    state
                        .record_seen(mac((i % 3) as u8), start + Duration::from_millis(i))
                        .await;
                }
            })
        };
        let reconciler = {
            let state = state.clone();
            tokio::spawn(async move {
                for i in 0..50u64 {
                    let list = if i % 2 == 0 { vec![mac(1)] } else { vec![mac(1), mac(2)] };
                    state.reconcile(&list, start + Duration::from_millis(i)).await;
                }
            })
        };
        writer.await.unwrap();
        reconciler.await.unwrap();

        assert!(flag_matches_devices(&state.devices().await, state.query().await));
    }
}
