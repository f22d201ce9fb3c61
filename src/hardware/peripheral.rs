//! Switching pins between plain GPIO and their alternate functions.
//!
//! On a Pi this is done by external tools (`dtparam`, `pinctrl`) rather than
//! through the GPIO registers, so it sits behind its own capability.

use crate::error::{PanelError, Result};
use crate::pins::header::PinId;
use crate::pins::state::PeripheralMode;
use std::process::Command;
use tracing::{debug, info};

/// Enables or disables an alternate function for a pin.
pub trait PeripheralSwitch: Send + Sync {
    /// Move `pin` from peripheral mode `from` to `to`.
    fn apply(&self, pin: PinId, from: PeripheralMode, to: PeripheralMode) -> Result<()>;
}

/// Accepts every switch without touching the system.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSwitch;

impl PeripheralSwitch for NoopSwitch {
    fn apply(&self, pin: PinId, from: PeripheralMode, to: PeripheralMode) -> Result<()> {
        debug!("Simulated peripheral switch on pin {}: {} -> {}", pin, from, to);
        Ok(())
    }
}

/// Shells out to `dtparam` for buses and `pinctrl` for single-pin functions.
#[derive(Debug, Clone)]
pub struct DtparamSwitch {
    dtparam: String,
    pinctrl: String,
}

impl Default for DtparamSwitch {
    fn default() -> Self {
        Self {
            dtparam: "dtparam".to_string(),
            pinctrl: "pinctrl".to_string(),
        }
    }
}

/// Alternate function number selecting `mode` on a BCM line.
fn alt_function(bcm: u8, mode: PeripheralMode) -> Option<&'static str> {
    match (mode, bcm) {
        (PeripheralMode::Uart, 14 | 15) => Some("a0"),
        (PeripheralMode::Pwm, 12 | 13) => Some("a0"),
        (PeripheralMode::Pwm, 18 | 19) => Some("a5"),
        _ => None,
    }
}

impl DtparamSwitch {
    /// Use custom tool paths (e.g. `sudo`-wrapped scripts).
    pub fn new(dtparam: impl Into<String>, pinctrl: impl Into<String>) -> Self {
        Self {
            dtparam: dtparam.into(),
            pinctrl: pinctrl.into(),
        }
    }

    /// Program and arguments that perform the switch.
    pub fn command_for(
        &self,
        pin: PinId,
        from: PeripheralMode,
        to: PeripheralMode,
    ) -> Result<(String, Vec<String>)> {
        let (mode, enable) = match (from, to) {
            (PeripheralMode::Gpio, PeripheralMode::Gpio) => {
                return Err(PanelError::invalid_argument("pin is already GPIO"))
            }
            (PeripheralMode::Gpio, target) => (target, true),
            (current, _) => (current, false),
        };
        let state = if enable { "on" } else { "off" };

        let command = match mode {
            PeripheralMode::I2c => (self.dtparam.clone(), vec![format!("i2c_arm={}", state)]),
            PeripheralMode::Spi => (self.dtparam.clone(), vec![format!("spi={}", state)]),
            PeripheralMode::Uart | PeripheralMode::Pwm => {
                let function = if enable {
                    alt_function(pin.bcm(), mode).ok_or_else(|| {
                        PanelError::unsupported_mode(pin.physical(), format!("no {} function", mode))
                    })?
                } else {
                    "ip"
                };
                (
                    self.pinctrl.clone(),
                    vec!["set".to_string(), pin.bcm().to_string(), function.to_string()],
                )
            }
            PeripheralMode::Gpio => {
                return Err(PanelError::invalid_argument("GPIO is not a peripheral"))
            }
        };
        Ok(command)
    }
}

impl PeripheralSwitch for DtparamSwitch {
    fn apply(&self, pin: PinId, from: PeripheralMode, to: PeripheralMode) -> Result<()> {
        let (program, args) = self.command_for(pin, from, to)?;
        info!("Switching pin {} from {} to {}: {} {}", pin, from, to, program, args.join(" "));

        let output = Command::new(&program).args(&args).output().map_err(|e| {
            PanelError::hardware_failure(format!("Failed to run {}: {}", program, e))
        })?;

        if !output.status.success() {
            return Err(PanelError::hardware_failure(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}
