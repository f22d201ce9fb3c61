//! The 40-pin header: which physical positions are controllable, the BCM line
//! behind each one, and the alternate functions it can be switched into.

use crate::error::{PanelError, Result};
use crate::pins::state::PeripheralMode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One controllable position on the header.
#[derive(Debug, Clone, Copy)]
pub struct HeaderPin {
    /// Physical (board) pin number, 1-40
    pub physical: u8,
    /// BCM line number used by the hardware backend
    pub bcm: u8,
    /// Human readable label
    pub label: &'static str,
    /// Alternate function this pin can hand over to, if any
    pub alternate: Option<PeripheralMode>,
}

const fn pin(
    physical: u8,
    bcm: u8,
    label: &'static str,
    alternate: Option<PeripheralMode>,
) -> HeaderPin {
    HeaderPin {
        physical,
        bcm,
        label,
        alternate,
    }
}

/// Controllable pins sorted by physical position. Power and ground pins are
/// absent.
pub const HEADER: [HeaderPin; 26] = [
    pin(3, 2, "GPIO2 (SDA)", Some(PeripheralMode::I2c)),
    pin(5, 3, "GPIO3 (SCL)", Some(PeripheralMode::I2c)),
    pin(7, 4, "GPIO4", None),
    pin(8, 14, "GPIO14 (TXD)", Some(PeripheralMode::Uart)),
    pin(10, 15, "GPIO15 (RXD)", Some(PeripheralMode::Uart)),
    pin(11, 17, "GPIO17", None),
    pin(12, 18, "GPIO18 (PWM0)", Some(PeripheralMode::Pwm)),
    pin(13, 27, "GPIO27", None),
    pin(15, 22, "GPIO22", None),
    pin(16, 23, "GPIO23", None),
    pin(18, 24, "GPIO24", None),
    pin(19, 10, "GPIO10 (MOSI)", Some(PeripheralMode::Spi)),
    pin(21, 9, "GPIO9 (MISO)", Some(PeripheralMode::Spi)),
    pin(22, 25, "GPIO25", None),
    pin(23, 11, "GPIO11 (SCLK)", Some(PeripheralMode::Spi)),
    pin(24, 8, "GPIO8 (CE0)", Some(PeripheralMode::Spi)),
    pin(26, 7, "GPIO7 (CE1)", Some(PeripheralMode::Spi)),
    pin(29, 5, "GPIO5", None),
    pin(31, 6, "GPIO6", None),
    pin(32, 12, "GPIO12 (PWM0)", Some(PeripheralMode::Pwm)),
    pin(33, 13, "GPIO13 (PWM1)", Some(PeripheralMode::Pwm)),
    pin(35, 19, "GPIO19 (PWM1)", Some(PeripheralMode::Pwm)),
    pin(36, 16, "GPIO16", None),
    pin(37, 26, "GPIO26", None),
    pin(38, 20, "GPIO20", None),
    pin(40, 21, "GPIO21", None),
];

/// Identifier of a controllable header pin.
///
/// Only values present in [`HEADER`] can be constructed, so every `PinId`
/// maps to exactly one BCM line. Serializes as the physical pin number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PinId(u8);

impl PinId {
    /// Look up a physical pin number.
    pub fn new(physical: u8) -> Result<Self> {
        HEADER
            .iter()
            .position(|p| p.physical == physical)
            .map(|index| Self(index as u8))
            .ok_or(PanelError::InvalidPin(physical))
    }

    /// Iterate over every controllable pin in physical order.
    pub fn all() -> impl Iterator<Item = PinId> {
        (0..HEADER.len() as u8).map(PinId)
    }

    fn entry(self) -> &'static HeaderPin {
        &HEADER[self.0 as usize]
    }

    /// Physical (board) pin number.
    pub fn physical(self) -> u8 {
        self.entry().physical
    }

    /// BCM line number.
    pub fn bcm(self) -> u8 {
        self.entry().bcm
    }

    pub fn label(self) -> &'static str {
        self.entry().label
    }

    /// Peripheral modes this pin supports, always starting with GPIO.
    pub fn available_modes(self) -> Vec<PeripheralMode> {
        let mut modes = vec![PeripheralMode::Gpio];
        modes.extend(self.entry().alternate);
        modes
    }

    /// Whether `mode` is one of [`available_modes`](Self::available_modes).
    pub fn supports(self, mode: PeripheralMode) -> bool {
        mode == PeripheralMode::Gpio || self.entry().alternate == Some(mode)
    }
}

impl TryFrom<u8> for PinId {
    type Error = PanelError;

    fn try_from(physical: u8) -> Result<Self> {
        PinId::new(physical)
    }
}

impl From<PinId> for u8 {
    fn from(pin: PinId) -> u8 {
        pin.physical()
    }
}

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.physical())
    }
}

/// Pins that move together when `mode` is switched on `pin`.
///
/// I2C, SPI and UART are buses enabled as a whole, so every header pin wired
/// to the bus follows. PWM channels are switched one pin at a time.
pub fn peripheral_group(pin: PinId, mode: PeripheralMode) -> Vec<PinId> {
    match mode {
        PeripheralMode::Gpio => vec![pin],
        PeripheralMode::Pwm => vec![pin],
        bus => PinId::all()
            .filter(|p| p.entry().alternate == Some(bus))
            .collect(),
    }
}

/// Mapping of physical pin number to label, as served to the UI.
pub fn gpio_map() -> std::collections::BTreeMap<u8, &'static str> {
    HEADER.iter().map(|p| (p.physical, p.label)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_sorted_and_unique() {
        assert!(HEADER.windows(2).all(|w| w[0].physical < w[1].physical));
        let mut bcm: Vec<u8> = HEADER.iter().map(|p| p.bcm).collect();
        bcm.sort_unstable();
        bcm.dedup();
        assert_eq!(bcm.len(), HEADER.len());
    }

    #[test]
    fn test_pin_lookup() {
        let pin = PinId::new(12).unwrap();
        assert_eq!(pin.bcm(), 18);
        assert_eq!(pin.physical(), 12);
        assert!(pin.supports(PeripheralMode::Pwm));
        assert!(!pin.supports(PeripheralMode::I2c));

        assert!(matches!(PinId::new(1), Err(PanelError::InvalidPin(1))));
        assert!(matches!(PinId::new(41), Err(PanelError::InvalidPin(41))));
        assert_eq!(PinId::all().count(), 26);
    }

    #[test]
    fn test_peripheral_groups() {
        let sda = PinId::new(3).unwrap();
        let group: Vec<u8> = peripheral_group(sda, PeripheralMode::I2c)
            .into_iter()
            .map(u8::from)
            .collect();
        assert_eq!(group, vec![3, 5]);

        let spi: Vec<u8> = peripheral_group(PinId::new(24).unwrap(), PeripheralMode::Spi)
            .into_iter()
            .map(u8::from)
            .collect();
        assert_eq!(spi, vec![19, 21, 23, 24, 26]);

        let pwm = PinId::new(33).unwrap();
        assert_eq!(peripheral_group(pwm, PeripheralMode::Pwm), vec![pwm]);
    }

    #[test]
    fn test_pin_id_serializes_as_physical_number() {
        let pin = PinId::new(40).unwrap();
        assert_eq!(serde_json::to_string(&pin).unwrap(), "40");
        let parsed: PinId = serde_json::from_str("7").unwrap();
        assert_eq!(parsed.bcm(), 4);
        assert!(serde_json::from_str::<PinId>("2").is_err());
    }
}
