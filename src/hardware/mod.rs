//! Hardware boundary for the GPIO header.
//!
//! The registry never talks to a GPIO library directly; it drives a
//! [`HardwareBackend`] and a [`PeripheralSwitch`]. The real backend is
//! feature-gated behind `gpio` so the panel builds and runs (simulated) on
//! machines without a Pi header.

pub mod peripheral;
pub mod sim;

#[cfg(feature = "gpio")]
pub mod rpi;

use crate::error::Result;
use crate::pins::state::PinMode;

pub use peripheral::{DtparamSwitch, NoopSwitch, PeripheralSwitch};
pub use sim::{SimProbe, SimulatedHardware};

#[cfg(feature = "gpio")]
pub use rpi::RppalHardware;

/// Line-level access to GPIO hardware, addressed by BCM line number.
///
/// Implementations are driven under the registry lock, so they only need to
/// be `Send`.
pub trait HardwareBackend: Send {
    /// Short name used in logs and `info` output.
    fn name(&self) -> &'static str;

    /// Claim the line if needed and set its direction.
    fn configure_line(&mut self, line: u8, mode: PinMode) -> Result<()>;

    /// Drive a configured line.
    fn write_line(&mut self, line: u8, high: bool) -> Result<()>;

    /// Sample a configured line.
    fn read_line(&mut self, line: u8) -> Result<bool>;

    /// Hand the line back to the system.
    fn release_line(&mut self, line: u8) -> Result<()>;
}

/// Acquire the hardware backend for this build.
///
/// With the `gpio` feature and `simulate == false` this opens the real GPIO
/// peripheral and fails if it is unavailable; otherwise the simulated backend
/// is returned.
pub fn acquire_backend(simulate: bool) -> Result<Box<dyn HardwareBackend>> {
    #[cfg(feature = "gpio")]
    {
        if !simulate {
            return Ok(Box::new(RppalHardware::new()?));
        }
    }

    #[cfg(not(feature = "gpio"))]
    {
        if !simulate {
            tracing::warn!("GPIO support not compiled in, using simulated hardware");
        }
    }

    Ok(Box::new(SimulatedHardware::new()))
}

/// Peripheral switch matching [`acquire_backend`].
pub fn peripheral_switch(simulate: bool) -> std::sync::Arc<dyn PeripheralSwitch> {
    if simulate || !cfg!(feature = "gpio") {
        std::sync::Arc::new(NoopSwitch)
    } else {
        std::sync::Arc::new(DtparamSwitch::default())
    }
}
