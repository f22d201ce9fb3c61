//! Per-pin state records and the ownership vocabulary shared by the registry,
//! the background tasks and the web layer.

use crate::error::PanelError;
use crate::pins::header::PinId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Direction of a GPIO line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PinMode {
    /// Level is sampled from the hardware
    #[serde(rename = "IN")]
    Input,
    /// Level is driven by the panel
    #[serde(rename = "OUT")]
    Output,
}

impl FromStr for PinMode {
    type Err = PanelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IN" | "INPUT" => Ok(Self::Input),
            "OUT" | "OUTPUT" => Ok(Self::Output),
            other => Err(PanelError::invalid_argument(format!(
                "unknown pin mode '{}', expected IN or OUT",
                other
            ))),
        }
    }
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "IN"),
            Self::Output => write!(f, "OUT"),
        }
    }
}

/// Electrical function that currently owns a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PeripheralMode {
    Gpio,
    I2c,
    Spi,
    Uart,
    Pwm,
}

impl FromStr for PeripheralMode {
    type Err = PanelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GPIO" => Ok(Self::Gpio),
            "I2C" => Ok(Self::I2c),
            "SPI" => Ok(Self::Spi),
            "UART" => Ok(Self::Uart),
            "PWM" => Ok(Self::Pwm),
            other => Err(PanelError::invalid_argument(format!(
                "unknown peripheral mode '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for PeripheralMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gpio => "GPIO",
            Self::I2c => "I2C",
            Self::Spi => "SPI",
            Self::Uart => "UART",
            Self::Pwm => "PWM",
        };
        f.write_str(name)
    }
}

/// Background task holding state-writing rights over a pin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Owner {
    /// A flash task toggling the pin every `period_ms`
    Flash { period_ms: u64 },
    /// The clock display driver
    Clock,
    /// An assigned component, by instance name
    Component { name: String },
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flash { .. } => write!(f, "flash"),
            Self::Clock => write!(f, "clock"),
            Self::Component { name } => write!(f, "component:{}", name),
        }
    }
}

/// Proof of ownership handed out by the registry.
///
/// A lease stays valid until it is released or the pin is claimed by someone
/// else; every owned write is checked against the current lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lease {
    pub(crate) pin: PinId,
    pub(crate) id: u64,
}

impl Lease {
    pub fn pin(&self) -> PinId {
        self.pin
    }
}

/// Point-in-time view of one pin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PinStateRecord {
    pub pin: PinId,
    pub bcm: u8,
    pub label: &'static str,
    pub mode: PinMode,
    /// Last commanded (OUTPUT) or sampled (INPUT) level
    pub state: bool,
    pub flashing: bool,
    /// Only present while `flashing`
    pub flash_period_ms: Option<u64>,
    pub peripheral_mode: PeripheralMode,
    pub available_modes: Vec<PeripheralMode>,
    pub owner: Option<Owner>,
    /// Whether the hardware line behind this pin has been configured
    pub initialized: bool,
}

/// Consistent copy of every pin record, taken under the registry lock.
#[derive(Debug, Clone, Serialize)]
pub struct PinSnapshot {
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    pub pins: BTreeMap<PinId, PinStateRecord>,
}

impl PinSnapshot {
    /// Record for `pin`. Every controllable pin is always present.
    pub fn get(&self, pin: PinId) -> Option<&PinStateRecord> {
        self.pins.get(&pin)
    }

    /// Pins currently owned by `owner`'s kind of task.
    pub fn owned_by(&self, predicate: impl Fn(&Owner) -> bool) -> Vec<PinId> {
        self.pins
            .values()
            .filter(|r| r.owner.as_ref().is_some_and(&predicate))
            .map(|r| r.pin)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("in".parse::<PinMode>().unwrap(), PinMode::Input);
        assert_eq!("OUTPUT".parse::<PinMode>().unwrap(), PinMode::Output);
        assert!("sideways".parse::<PinMode>().is_err());

        assert_eq!("i2c".parse::<PeripheralMode>().unwrap(), PeripheralMode::I2c);
        assert!("can".parse::<PeripheralMode>().is_err());
    }

    #[test]
    fn test_mode_serialization() {
        assert_eq!(serde_json::to_string(&PinMode::Input).unwrap(), "\"IN\"");
        assert_eq!(
            serde_json::to_string(&PeripheralMode::Uart).unwrap(),
            "\"UART\""
        );
    }

    #[test]
    fn test_owner_display() {
        assert_eq!(Owner::Flash { period_ms: 500 }.to_string(), "flash");
        assert_eq!(
            Owner::Component {
                name: "porch".to_string()
            }
            .to_string(),
            "component:porch"
        );
    }
}
