use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde_derive::Deserialize;

#[derive(Deserialize, Debug, Default, Clone)]
pub struct AppConfig {
    pub presence: Option<PresenceConfig>,
    pub capture: Option<CaptureConfig>,
    pub controller: Option<ControllerConfig>,
    pub endpoints: Option<EndpointsConfig>,
    pub mqtt: Option<MqttConfig>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct PresenceConfig {
    pub allow_list: Option<PathBuf>,
    pub tracked_output: Option<PathBuf>,
    pub observed_output: Option<PathBuf>,
    pub timeout_seconds: Option<u64>,
    pub reconcile_interval_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct CaptureConfig {
    pub interface: Option<String>,
    pub command: Option<String>,
    /// Replaces the default tshark arguments entirely.
    pub args: Option<Vec<String>>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ControllerConfig {
    pub interval_seconds: Option<u64>,
    pub door_timeout_seconds: Option<u64>,
    pub snapshot_output: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct EndpointsConfig {
    pub light_sensor: Option<SocketAddr>,
    pub lamp: Option<SocketAddr>,
    pub door: Option<SocketAddr>,
    pub request_timeout_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

pub fn load(path: &Path) -> anyhow::Result<AppConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config = toml::de::from_str(&contents)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(config)
}

impl AppConfig {
    pub fn presence(&self) -> PresenceConfig {
        self.presence.clone().unwrap_or_default()
    }

    pub fn capture(&self) -> CaptureConfig {
        self.capture.clone().unwrap_or_default()
    }

    pub fn controller(&self) -> ControllerConfig {
        self.controller.clone().unwrap_or_default()
    }

    pub fn endpoints(&self) -> EndpointsConfig {
        self.endpoints.clone().unwrap_or_default()
    }
}

impl PresenceConfig {
    pub fn allow_list(&self) -> PathBuf {
        self.allow_list.clone().unwrap_or_else(|| "mac.conf".into())
    }

    pub fn tracked_output(&self) -> PathBuf {
        self.tracked_output
            .clone()
            .unwrap_or_else(|| "mac_tracked.txt".into())
    }

    pub fn observed_output(&self) -> PathBuf {
        self.observed_output
            .clone()
            .unwrap_or_else(|| "mac_available.txt".into())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(15))
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_seconds.unwrap_or(5))
    }
}

impl CaptureConfig {
    pub fn command(&self) -> String {
        self.command.clone().unwrap_or_else(|| "tshark".to_string())
    }

    /// Line-buffered tshark printing one source address per frame.
    pub fn args(&self) -> Vec<String> {
        if let Some(args) = &self.args {
            return args.clone();
        }
        let interface = self.interface.as_deref().unwrap_or("enp1s0");
        ["-l", "-i", interface, "-T", "fields", "-e", "eth.src"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

impl ControllerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.unwrap_or(5))
    }

    pub fn door_timeout(&self) -> Duration {
        Duration::from_secs(self.door_timeout_seconds.unwrap_or(15))
    }

    pub fn snapshot_output(&self) -> PathBuf {
        self.snapshot_output
            .clone()
            .unwrap_or_else(|| "controllerState.txt".into())
    }
}

impl EndpointsConfig {
    const COAP_PORT: u16 = 5683;

    fn default_addr(last: u16) -> SocketAddr {
        let ip = std::net::Ipv6Addr::new(0xfd11, 0x22, 0, 0, 0, 0, 0, last);
        SocketAddr::from((ip, Self::COAP_PORT))
    }

    pub fn light_sensor(&self) -> SocketAddr {
        self.light_sensor.unwrap_or_else(|| Self::default_addr(4))
    }

    pub fn lamp(&self) -> SocketAddr {
        self.lamp.unwrap_or_else(|| Self::default_addr(3))
    }

    pub fn door(&self) -> SocketAddr {
        self.door.unwrap_or_else(|| Self::default_addr(9))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds.unwrap_or(5))
    }
}
