//! Raspberry Pi GPIO backend using rppal.

use crate::error::{PanelError, Result};
use crate::hardware::HardwareBackend;
use crate::pins::state::PinMode;
use rppal::gpio::{Gpio, IoPin, Level, Mode};
use std::collections::HashMap;

/// Hardware backend over `/dev/gpiomem`.
///
/// Each configured line is held as an rppal `IoPin`. Dropping an `IoPin`
/// restores the mode the line had before it was claimed, so releasing a line
/// (or dropping the whole backend) leaves the header as the system had it.
pub struct RppalHardware {
    gpio: Gpio,
    lines: HashMap<u8, IoPin>,
}

impl RppalHardware {
    /// Open the GPIO peripheral.
    pub fn new() -> Result<Self> {
        let gpio = Gpio::new().map_err(|e| {
            PanelError::hardware_failure(format!("Failed to initialize GPIO: {}", e))
        })?;

        Ok(Self {
            gpio,
            lines: HashMap::new(),
        })
    }

    fn line(&mut self, line: u8) -> Result<&mut IoPin> {
        self.lines.get_mut(&line).ok_or_else(|| {
            PanelError::hardware_failure(format!("line {} is not configured", line))
        })
    }
}

fn to_rppal(mode: PinMode) -> Mode {
    match mode {
        PinMode::Input => Mode::Input,
        PinMode::Output => Mode::Output,
    }
}

impl HardwareBackend for RppalHardware {
    fn name(&self) -> &'static str {
        "rppal"
    }

    fn configure_line(&mut self, line: u8, mode: PinMode) -> Result<()> {
        if let Some(pin) = self.lines.get_mut(&line) {
            pin.set_mode(to_rppal(mode));
            return Ok(());
        }

        let pin = self.gpio.get(line).map_err(|e| {
            PanelError::hardware_failure(format!("Failed to access line {}: {}", line, e))
        })?;
        self.lines.insert(line, pin.into_io(to_rppal(mode)));
        Ok(())
    }

    fn write_line(&mut self, line: u8, high: bool) -> Result<()> {
        let level = if high { Level::High } else { Level::Low };
        self.line(line)?.write(level);
        Ok(())
    }

    fn read_line(&mut self, line: u8) -> Result<bool> {
        Ok(self.line(line)?.read() == Level::High)
    }

    fn release_line(&mut self, line: u8) -> Result<()> {
        self.lines.remove(&line);
        Ok(())
    }
}
