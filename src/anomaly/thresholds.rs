use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejected threshold update.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ThresholdError {
    #[error("{quantity}: max ({max}) must be greater than min ({min})")]
    Inverted {
        quantity: &'static str,
        min: f64,
        max: f64,
    },

    #[error("{quantity}: bounds must be finite")]
    NonFinite { quantity: &'static str },

    #[error("conveyor_speed: min ({0}) must not be negative")]
    NegativeSpeed(f64),
}

/// Business-rule bounds for the three physical quantities.
///
/// Readings strictly below `*_min` or strictly above `*_max` raise an alert.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyThresholds {
    pub conveyor_speed_min: f64,
    pub conveyor_speed_max: f64,
    pub temperature_min: f64,
    pub temperature_max: f64,
    pub robot_angle_min: f64,
    pub robot_angle_max: f64,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            conveyor_speed_min: 0.1,
            conveyor_speed_max: 3.5,
            temperature_min: 15.0,
            temperature_max: 85.0,
            robot_angle_min: 0.0,
            robot_angle_max: 180.0,
        }
    }
}

impl AnomalyThresholds {
    /// Checks `max > min` for every quantity.
    pub fn validate(&self) -> Result<(), ThresholdError> {
        check_pair(
            "conveyor_speed",
            self.conveyor_speed_min,
            self.conveyor_speed_max,
        )?;
        check_pair("temperature", self.temperature_min, self.temperature_max)?;
        check_pair("robot_angle", self.robot_angle_min, self.robot_angle_max)?;

        if self.conveyor_speed_min < 0.0 {
            return Err(ThresholdError::NegativeSpeed(self.conveyor_speed_min));
        }

        Ok(())
    }
}

fn check_pair(quantity: &'static str, min: f64, max: f64) -> Result<(), ThresholdError> {
    if !min.is_finite() || !max.is_finite() {
        return Err(ThresholdError::NonFinite { quantity });
    }
    if max <= min {
        return Err(ThresholdError::Inverted { quantity, min, max });
    }
    Ok(())
}
