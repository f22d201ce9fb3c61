//! # pinboard - Raspberry Pi GPIO control panel
//!
//! A web control panel for the 40-pin GPIO header: view, toggle, flash and
//! peripheral-configure pins from a browser, and layer sensors and actuators
//! on top of raw pins.
//!
//! ## Features
//!
//! - **Pin registry**: one consistent record per controllable header pin,
//!   with lazy line initialization and lease-based ownership
//! - **Background tasks**: per-pin flashing and a BCD seconds clock
//! - **Components**: DHT11/DHT22 sensors polled in the background, LED
//!   actuators, and custom types registered on the factory
//! - **Web interface**: REST API, WebSocket snapshot push and a built-in page
//! - **Simulation**: runs without a Pi; real GPIO behind the `gpio` feature
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pinboard::{acquire_backend, peripheral_switch, start_web_server, Panel, PanelSettings, PinRegistry, WebConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = PinRegistry::new(acquire_backend(true)?, peripheral_switch(true));
//!     let panel = Arc::new(Panel::new(registry, PanelSettings::default()));
//!
//!     let shutdown = async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     };
//!     start_web_server(WebConfig::default(), Arc::clone(&panel), shutdown).await?;
//!     panel.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod components;
pub mod error;
pub mod hardware;
pub mod layout;
pub mod panel;
pub mod pins;
pub mod tasks;
pub mod web;

// Re-export public API
pub use components::{
    Category, ComponentFactory, ComponentMetadata, ComponentReading, ComponentSpec, Consumer,
    Driver, Producer, Readings,
};
pub use error::{PanelError, Result};
pub use hardware::{acquire_backend, peripheral_switch, HardwareBackend, PeripheralSwitch, SimulatedHardware};
pub use layout::{LoadReport, PanelLayout};
pub use panel::{Panel, PanelSettings};
pub use pins::{Owner, PeripheralMode, PinId, PinMode, PinRegistry, PinSnapshot, PinStateRecord};
pub use tasks::{LocalTime, TimeSource};
pub use web::{start_web_server, WebConfig};

/// The default web server port
pub const DEFAULT_WEB_PORT: u16 = 5000;

/// The default flash period in milliseconds
pub const DEFAULT_FLASH_PERIOD_MS: u64 = 500;

/// The default producer polling interval in seconds
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;

/// The default WebSocket snapshot interval in milliseconds
pub const DEFAULT_SNAPSHOT_INTERVAL_MS: u64 = 500;

/// The default layout file used by the save/load endpoints
pub const DEFAULT_LAYOUT_FILE: &str = "pinboard-layout.json";
