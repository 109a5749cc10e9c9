//! Outbound device commands.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::Capability;
use crate::error::{Error, Result};

/// Lowest and highest accepted thermostat setpoint in °C.
pub const SETPOINT_RANGE_C: (f64, f64) = (5.0, 35.0);

/// A control request for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "params", rename_all = "snake_case")]
pub enum DeviceCommand {
    TurnOn,
    TurnOff,
    Toggle,
    /// Brightness in percent (0-100)
    SetBrightness { level: u8 },
    /// Color as `RRGGBB` hex
    SetColor { hex: String },
    /// Thermostat setpoint in °C
    SetSetpoint { celsius: f64 },
    /// Active power limit in watts
    SetPowerLimit { watts: f64 },
}

impl DeviceCommand {
    /// Capability the target device must advertise.
    pub fn required_capability(&self) -> Capability {
        match self {
            Self::TurnOn | Self::TurnOff | Self::Toggle => Capability::Switch,
            Self::SetBrightness { .. } => Capability::Dimmer,
            Self::SetColor { .. } => Capability::Color,
            Self::SetSetpoint { .. } => Capability::Setpoint,
            Self::SetPowerLimit { .. } => Capability::PowerLimit,
        }
    }

    pub fn action_name(&self) -> &'static str {
        match self {
            Self::TurnOn => "turn_on",
            Self::TurnOff => "turn_off",
            Self::Toggle => "toggle",
            Self::SetBrightness { .. } => "set_brightness",
            Self::SetColor { .. } => "set_color",
            Self::SetSetpoint { .. } => "set_setpoint",
            Self::SetPowerLimit { .. } => "set_power_limit",
        }
    }

    /// Check parameter bounds before anything reaches the wire.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::SetBrightness { level } if *level > 100 => Err(Error::CommandRejected(format!(
                "brightness {} outside 0-100",
                level
            ))),
            Self::SetColor { hex } => {
                let digits = hex.trim_start_matches('#');
                if digits.len() == 6 && digits.chars().all(|c| c.is_ascii_hexdigit()) {
                    Ok(())
                } else {
                    Err(Error::CommandRejected(format!("invalid color '{}'", hex)))
                }
            }
            Self::SetSetpoint { celsius } => {
                let (min, max) = SETPOINT_RANGE_C;
                if celsius.is_finite() && (min..=max).contains(celsius) {
                    Ok(())
                } else {
                    Err(Error::CommandRejected(format!(
                        "setpoint {} outside {}-{} °C",
                        celsius, min, max
                    )))
                }
            }
            Self::SetPowerLimit { watts } if !watts.is_finite() || *watts < 0.0 => Err(
                Error::CommandRejected(format!("power limit {} must be >= 0", watts)),
            ),
            _ => Ok(()),
        }
    }

    /// Build a command from an action name and a JSON parameter object.
    pub fn parse(action: &str, params: &Value) -> Result<Self> {
        let number = |key: &str| -> Result<f64> {
            params
                .get(key)
                .and_then(Value::as_f64)
                .ok_or_else(|| Error::CommandRejected(format!("{} requires numeric '{}'", action, key)))
        };

        let command = match action {
            "turn_on" | "on" => Self::TurnOn,
            "turn_off" | "off" => Self::TurnOff,
            "toggle" => Self::Toggle,
            "set_brightness" => {
                let level = number("level")?;
                if !(0.0..=255.0).contains(&level) {
                    return Err(Error::CommandRejected(format!(
                        "brightness {} outside 0-100",
                        level
                    )));
                }
                Self::SetBrightness {
                    level: level.round() as u8,
                }
            }
            "set_color" => Self::SetColor {
                hex: params
                    .get("hex")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::CommandRejected("set_color requires 'hex'".into()))?
                    .to_string(),
            },
            "set_setpoint" => Self::SetSetpoint {
                celsius: number("celsius")?,
            },
            "set_power_limit" => Self::SetPowerLimit {
                watts: number("watts")?,
            },
            other => {
                return Err(Error::CommandRejected(format!("unknown action '{}'", other)));
            }
        };

        command.validate()?;
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_bounds() {
        assert!(DeviceCommand::SetBrightness { level: 100 }.validate().is_ok());
        assert!(DeviceCommand::SetBrightness { level: 101 }.validate().is_err());
        assert!(DeviceCommand::SetColor { hex: "#FF8800".into() }.validate().is_ok());
        assert!(DeviceCommand::SetColor { hex: "orange".into() }.validate().is_err());
        assert!(DeviceCommand::SetSetpoint { celsius: 40.0 }.validate().is_err());
        assert!(DeviceCommand::SetPowerLimit { watts: -5.0 }.validate().is_err());
        assert!(DeviceCommand::SetPowerLimit { watts: 0.0 }.validate().is_ok());
    }

    #[test]
    fn test_parse_from_json() {
        let cmd = DeviceCommand::parse("set_brightness", &json!({"level": 40})).unwrap();
        assert_eq!(cmd, DeviceCommand::SetBrightness { level: 40 });
        assert_eq!(cmd.required_capability(), Capability::Dimmer);

        let cmd = DeviceCommand::parse("off", &Value::Null).unwrap();
        assert_eq!(cmd, DeviceCommand::TurnOff);

        assert!(DeviceCommand::parse("set_setpoint", &json!({})).is_err());
        assert!(DeviceCommand::parse("explode", &Value::Null).is_err());
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::to_value(DeviceCommand::SetPowerLimit { watts: 800.0 }).unwrap();
        assert_eq!(json, json!({"action": "set_power_limit", "params": {"watts": 800.0}}));
        let json = serde_json::to_value(DeviceCommand::TurnOn).unwrap();
        assert_eq!(json, json!({"action": "turn_on"}));
    }
}
