use std::fmt;

use serde_derive::Serialize;

/// Daylight reading from the light sensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Daylight {
    Bright,
    Dark,
    /// The call failed or the sensor answered with something else.
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DoorReading {
    Open,
    Closed,
    Unknown,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LightState {
    #[default]
    Off,
    On,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ThresholdKind {
    Min,
    Max,
}

impl Daylight {
    pub fn from_payload(payload: Option<&str>) -> Self {
        match payload.map(str::trim) {
            Some("bright") => Daylight::Bright,
            Some("dark") => Daylight::Dark,
            _ => Daylight::Unknown,
        }
    }
}

impl DoorReading {
    pub fn from_payload(payload: Option<&str>) -> Self {
        match payload.map(str::trim) {
            Some("open") => DoorReading::Open,
            Some("closed") => DoorReading::Closed,
            _ => DoorReading::Unknown,
        }
    }
}

impl LightState {
    pub fn payload(&self) -> &'static str {
        match self {
            LightState::On => "on",
            LightState::Off => "off",
        }
    }

    pub fn is_on(&self) -> bool {
        *self == LightState::On
    }
}

impl ThresholdKind {
    pub fn resource(&self) -> &'static str {
        match self {
            ThresholdKind::Min => "lightsensor/threshold/min",
            ThresholdKind::Max => "lightsensor/threshold/max",
        }
    }
}

impl fmt::Display for Daylight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Daylight::Bright => "bright",
            Daylight::Dark => "dark",
            Daylight::Unknown => "unknown",
        })
    }
}

impl fmt::Display for DoorReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DoorReading::Open => "open",
            DoorReading::Closed => "closed",
            DoorReading::Unknown => "unknown",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daylight_from_payload() {
        assert_eq!(Daylight::from_payload(Some("bright")), Daylight::Bright);
        assert_eq!(Daylight::from_payload(Some("dark\n")), Daylight::Dark);
        assert_eq!(Daylight::from_payload(Some("dusk")), Daylight::Unknown);
        assert_eq!(Daylight::from_payload(None), Daylight::Unknown);
    }

    #[test]
    fn test_door_from_payload() {
        assert_eq!(DoorReading::from_payload(Some("open")), DoorReading::Open);
        assert_eq!(DoorReading::from_payload(Some("closed")), DoorReading::Closed);
        assert_eq!(DoorReading::from_payload(None), DoorReading::Unknown);
    }

    #[test]
    fn test_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&Daylight::Dark).unwrap(), "\"dark\"");
        assert_eq!(serde_json::to_string(&LightState::On).unwrap(), "\"on\"");
    }
}
