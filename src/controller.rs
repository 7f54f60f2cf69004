//! The control loop: reads the sensors, decides whether the light should be
//! on, records a snapshot and switches the lamp only on a change.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use log::{debug, info, warn};
use serde_derive::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::ControllerConfig;
use crate::messages::{Daylight, DoorReading, LightState};
use crate::mqtt::MqttClient;
use crate::presence::PresenceState;
use crate::remote::SensorClient;

/// `None` means the reading is not good enough to decide on, so the current
/// state is kept.
pub fn desired_state(daylight: Daylight, presence: bool, door_triggered: bool) -> Option<LightState> {
    match daylight {
        Daylight::Unknown => None,
        Daylight::Bright => Some(LightState::Off),
        Daylight::Dark if presence || door_triggered => Some(LightState::On),
        Daylight::Dark => Some(LightState::Off),
    }
}

/// Everything sensed in one iteration plus the resulting light state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ControllerSnapshot {
    pub daylight: Daylight,
    pub presence: bool,
    pub door: DoorReading,
    pub door_triggered: bool,
    pub light: LightState,
}

fn title_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

/// Five `label: \tvalue` lines, parsed positionally by the status display.
impl fmt::Display for ControllerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Light outside: \t{}", self.daylight)?;
        writeln!(f, "Smart phone detection: \t{}", title_bool(self.presence))?;
        writeln!(f, "Door current action: \t{}", self.door)?;
        writeln!(f, "Door state: \t{}", title_bool(self.door_triggered))?;
        writeln!(f, "Light relays: \t{}", title_bool(self.light.is_on()))
    }
}

pub struct Controller<C> {
    client: C,
    presence: Arc<PresenceState>,
    interval: Duration,
    door_timeout: Duration,
    snapshot_output: PathBuf,
    mqtt: Option<MqttClient>,
    light: LightState,
    last_door_open: Option<Instant>,
}

impl<C: SensorClient> Controller<C> {
    pub fn new(config: &ControllerConfig, client: C, presence: Arc<PresenceState>) -> Self {
        Controller {
            client,
            presence,
            interval: config.interval(),
            door_timeout: config.door_timeout(),
            snapshot_output: config.snapshot_output(),
            mqtt: None,
            light: LightState::Off,
            last_door_open: None,
        }
    }

    pub fn with_mqtt(mut self, mqtt: Option<MqttClient>) -> Self {
        self.mqtt = mqtt;
        self
    }

    pub fn light(&self) -> LightState {
        self.light
    }

    /// One iteration of the loop at time `now`.
    pub async fn step(&mut self, now: Instant) -> ControllerSnapshot {
        let door = self.client.door().await;
        if door == DoorReading::Open {
            debug!("Door opened");
            self.last_door_open = Some(now);
        }

        let daylight = self.client.daylight().await;
        let presence = self.presence.query().await;
        let door_triggered = self
            .last_door_open
            .is_some_and(|opened| now.saturating_duration_since(opened) < self.door_timeout);
        debug!(
            "Daylight: {}, presence: {}, door: {}, door triggered: {}",
            daylight, presence, door, door_triggered
        );

        let desired = desired_state(daylight, presence, door_triggered);
        let snapshot = ControllerSnapshot {
            daylight,
            presence,
            door,
            door_triggered,
            light: desired.unwrap_or(self.light),
        };
        self.persist(&snapshot).await;

        if let Some(desired) = desired.filter(|&d| d != self.light) {
            self.light = desired;
            info!("Switching light {}", desired.payload());
            if !self.client.set_lamp(desired).await {
                warn!("Lamp did not acknowledge switching {}", desired.payload());
            }
        }

        snapshot
    }

    async fn persist(&self, snapshot: &ControllerSnapshot) {
        if let Err(err) = tokio::fs::write(&self.snapshot_output, snapshot.to_string())
            .await
            .with_context(|| format!("writing snapshot to {}", self.snapshot_output.display()))
        {
            warn!("{:#}", err);
        }

        if let Some(mqtt) = &self.mqtt {
            if let Err(err) = mqtt.publish_snapshot(snapshot).await {
                warn!("Failed to publish snapshot: {:?}", err);
            }
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.step(Instant::now()) => {}
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        debug!("Controller stopped");
    }
}
