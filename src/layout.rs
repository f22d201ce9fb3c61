//! Saved panel layouts.
//!
//! A layout records what a user set up by hand (pin directions and levels,
//! flashing pins, peripheral modes), the assigned components and whether
//! the clock runs. Pins driven by the clock or a component are left out;
//! they come back when the clock or component is replayed.

use crate::components::ComponentSpec;
use crate::error::{PanelError, Result};
use crate::pins::{Owner, PeripheralMode, PinId, PinMode, PinSnapshot};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Current layout document version.
pub const LAYOUT_VERSION: u32 = 1;

/// Manually configured state of one pin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinLayout {
    pub pin: PinId,
    pub mode: PinMode,
    #[serde(default)]
    pub state: bool,
    #[serde(default)]
    pub flashing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flash_period_ms: Option<u64>,
    #[serde(default = "gpio")]
    pub peripheral: PeripheralMode,
}

fn gpio() -> PeripheralMode {
    PeripheralMode::Gpio
}

fn current_version() -> u32 {
    LAYOUT_VERSION
}

/// The persisted panel layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelLayout {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(default)]
    pub pins: Vec<PinLayout>,
    #[serde(default)]
    pub components: Vec<ComponentSpec>,
    #[serde(default)]
    pub clock_enabled: bool,
}

impl Default for PanelLayout {
    fn default() -> Self {
        Self {
            version: LAYOUT_VERSION,
            pins: Vec::new(),
            components: Vec::new(),
            clock_enabled: false,
        }
    }
}

impl PanelLayout {
    /// Build a layout from a snapshot plus the running components and clock.
    pub fn capture(snapshot: &PinSnapshot, components: Vec<ComponentSpec>, clock_enabled: bool) -> Self {
        let pins = snapshot
            .pins
            .values()
            .filter(|r| r.flashing || r.initialized || r.peripheral_mode != PeripheralMode::Gpio)
            .filter(|r| matches!(r.owner, None | Some(Owner::Flash { .. })))
            .map(|r| {
                let gpio = r.peripheral_mode == PeripheralMode::Gpio;
                PinLayout {
                    pin: r.pin,
                    mode: r.mode,
                    // Only steady output levels are restored.
                    state: gpio && !r.flashing && r.mode == PinMode::Output && r.state,
                    flashing: r.flashing,
                    flash_period_ms: r.flash_period_ms,
                    peripheral: r.peripheral_mode,
                }
            })
            .collect();

        Self {
            version: LAYOUT_VERSION,
            pins,
            components,
            clock_enabled,
        }
    }

    /// Pins that should leave GPIO, one entry per pin.
    pub fn peripheral_pins(&self) -> impl Iterator<Item = &PinLayout> {
        self.pins.iter().filter(|p| p.peripheral != PeripheralMode::Gpio)
    }

    /// GPIO pins to configure by hand.
    pub fn gpio_pins(&self) -> impl Iterator<Item = &PinLayout> {
        self.pins.iter().filter(|p| p.peripheral == PeripheralMode::Gpio)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let layout: Self = serde_json::from_str(text)?;
        if layout.version > LAYOUT_VERSION {
            return Err(PanelError::config_error(format!(
                "layout version {} is newer than supported version {}",
                layout.version, LAYOUT_VERSION
            )));
        }
        Ok(layout)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read a layout file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
            PanelError::config_error(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Write the layout, creating parent directories as needed.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.to_json()?).await?;
        Ok(())
    }
}

/// Outcome of replaying a layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadReport {
    pub pins: usize,
    pub components: usize,
    pub clock_enabled: bool,
    /// Entries that could not be applied; the rest of the layout still was
    pub errors: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}
