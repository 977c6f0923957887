//! Typed view of the open `additional_data` map carried by telemetry events.
//!
//! Producers attach fault and warning detail under well-known keys
//! (`fault_code`, `warning_code`, `description`) next to free-form readings
//! such as `vibration_level`. Those keys are lifted into [`Incident`] at
//! decode time so alert formatting never does dynamic lookups.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

const FAULT_CODE: &str = "fault_code";
const WARNING_CODE: &str = "warning_code";
const DESCRIPTION: &str = "description";

/// Structured auxiliary payload of a telemetry event.
#[derive(Debug, Clone, PartialEq)]
pub enum Details {
    /// Payload carrying a `fault_code`.
    Fault(Incident),
    /// Payload carrying a `warning_code`.
    Warning(Incident),
    /// Anything else, kept as-is.
    Other(Map<String, Value>),
}

/// Fault or warning detail plus the remaining auxiliary readings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Incident {
    pub code: String,
    pub description: Option<String>,
    pub readings: Map<String, Value>,
}

impl Details {
    /// Classifies a raw auxiliary map.
    pub fn from_map(mut map: Map<String, Value>) -> Self {
        if let Some(code) = take_string(&mut map, FAULT_CODE) {
            let description = take_string(&mut map, DESCRIPTION);
            return Self::Fault(Incident {
                code,
                description,
                readings: map,
            });
        }

        if let Some(code) = take_string(&mut map, WARNING_CODE) {
            let description = take_string(&mut map, DESCRIPTION);
            return Self::Warning(Incident {
                code,
                description,
                readings: map,
            });
        }

        Self::Other(map)
    }

    /// Human description attached by the producer, if any.
    pub fn description(&self) -> Option<&str> {
        match self {
            Self::Fault(incident) | Self::Warning(incident) => incident.description.as_deref(),
            Self::Other(map) => map.get(DESCRIPTION).and_then(Value::as_str),
        }
    }

    /// Rebuilds the wire representation.
    pub fn to_map(&self) -> Map<String, Value> {
        match self {
            Self::Fault(incident) => incident.to_map(FAULT_CODE),
            Self::Warning(incident) => incident.to_map(WARNING_CODE),
            Self::Other(map) => map.clone(),
        }
    }
}

impl Incident {
    fn to_map(&self, code_key: &str) -> Map<String, Value> {
        let mut map = self.readings.clone();
        map.insert(code_key.to_string(), Value::String(self.code.clone()));
        if let Some(description) = &self.description {
            map.insert(DESCRIPTION.to_string(), Value::String(description.clone()));
        }
        map
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key) {
        Some(Value::String(_)) => match map.remove(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        },
        _ => None,
    }
}

impl Serialize for Details {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_map().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Details {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Map::deserialize(deserializer).map(Self::from_map)
    }
}
