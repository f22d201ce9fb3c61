//! The panel: one handle over the registry, the flash and clock tasks and
//! the component runtime.
//!
//! Every control operation goes through here. Conflicts are settled by
//! "last writer evicts": claiming a pin that a task owns tears that task
//! down (a flash stops, the clock is disabled as a whole, a component is
//! removed) before the new owner takes over. Control operations are
//! serialized by a single async lock so an eviction and its teardown are
//! never interleaved with another request.

use crate::components::{
    ComponentFactory, ComponentMetadata, ComponentReading, ComponentRuntime, ComponentSpec,
    ComponentType,
};
use crate::error::{PanelError, Result};
use crate::layout::{LoadReport, PanelLayout};
use crate::pins::header::peripheral_group;
use crate::pins::{Lease, Owner, PeripheralMode, PinId, PinMode, PinRegistry, PinSnapshot};
use crate::tasks::clock::{self, CLOCK_TICK};
use crate::tasks::flash::MIN_FLASH_PERIOD;
use crate::tasks::{ClockDriver, FlashController, LocalTime, TimeSource};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Tunables for a [`Panel`].
#[derive(Debug, Clone)]
pub struct PanelSettings {
    /// Flash period used when a request does not name one
    pub default_flash_period: Duration,
    /// Producer polling interval used when a component does not set `polling`
    pub poll_interval: Duration,
    /// Drive outputs LOW before releasing lines on shutdown
    pub reset_on_shutdown: bool,
    /// Interval between clock frames
    pub clock_tick: Duration,
}

impl Default for PanelSettings {
    fn default() -> Self {
        Self {
            default_flash_period: Duration::from_millis(crate::DEFAULT_FLASH_PERIOD_MS),
            poll_interval: Duration::from_secs(crate::DEFAULT_POLL_INTERVAL_SECS),
            reset_on_shutdown: true,
            clock_tick: CLOCK_TICK,
        }
    }
}

impl PanelSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_flash_period(mut self, period: Duration) -> Self {
        self.default_flash_period = period;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_reset_on_shutdown(mut self, reset: bool) -> Self {
        self.reset_on_shutdown = reset;
        self
    }

    pub fn with_clock_tick(mut self, tick: Duration) -> Self {
        self.clock_tick = tick;
        self
    }
}

/// Shared control surface over the whole header.
#[derive(Debug)]
pub struct Panel {
    registry: PinRegistry,
    flash: FlashController,
    clock: ClockDriver,
    components: ComponentRuntime,
    settings: PanelSettings,
    control: Mutex<()>,
}

impl Panel {
    /// Panel with the built-in component types and the local wall clock.
    pub fn new(registry: PinRegistry, settings: PanelSettings) -> Self {
        Self::from_parts(
            registry,
            settings,
            ComponentFactory::with_builtins(),
            Arc::new(LocalTime),
        )
    }

    /// Panel with a custom component factory and clock time source.
    pub fn from_parts(
        registry: PinRegistry,
        settings: PanelSettings,
        factory: ComponentFactory,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            flash: FlashController::new(registry.clone()),
            clock: ClockDriver::new(registry.clone(), time).with_tick(settings.clock_tick),
            components: ComponentRuntime::new(registry.clone(), factory, settings.poll_interval),
            registry,
            settings,
            control: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &PinRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &PanelSettings {
        &self.settings
    }

    pub fn snapshot(&self) -> PinSnapshot {
        self.registry.snapshot()
    }

    /// Refresh unowned input pins, then take a snapshot.
    pub fn sample(&self) -> PinSnapshot {
        self.registry.sample_inputs();
        self.registry.snapshot()
    }

    pub fn read_pin(&self, pin: PinId) -> Result<bool> {
        self.registry.read_pin(pin)
    }

    /// Set a pin's direction, evicting whatever task owns it.
    pub async fn set_mode(&self, pin: PinId, mode: PinMode) -> Result<()> {
        let _guard = self.control.lock().await;
        self.direct(pin, mode).await
    }

    /// Drive a pin, evicting whatever task owns it.
    pub async fn set_state(&self, pin: PinId, high: bool) -> Result<()> {
        let _guard = self.control.lock().await;
        self.drive(pin, high).await
    }

    /// Switch a pin (and its bus) between GPIO and an alternate function.
    ///
    /// Owners of every pin in the group are evicted first. Returns the pins
    /// whose mode changed.
    pub async fn set_peripheral(&self, pin: PinId, mode: PeripheralMode) -> Result<Vec<PinId>> {
        let _guard = self.control.lock().await;
        self.switch_peripheral(pin, mode).await
    }

    /// Start flashing a pin, with the default period if none is given.
    pub async fn start_flash(&self, pin: PinId, period: Option<Duration>) -> Result<()> {
        let _guard = self.control.lock().await;
        self.flash_on(pin, period.unwrap_or(self.settings.default_flash_period))
            .await
    }

    /// Stop flashing a pin. Returns whether it was flashing.
    pub async fn stop_flash(&self, pin: PinId) -> bool {
        let _guard = self.control.lock().await;
        self.flash.stop(pin).await
    }

    pub async fn enable_clock(&self) -> Result<()> {
        let _guard = self.control.lock().await;
        self.clock_on().await
    }

    /// Returns whether the clock was running.
    pub async fn disable_clock(&self) -> bool {
        let _guard = self.control.lock().await;
        self.clock.disable().await
    }

    pub async fn clock_enabled(&self) -> bool {
        self.clock.is_enabled().await
    }

    /// Assign a component, replacing any component of the same name and
    /// evicting the current owners of its pins.
    pub async fn assign_component(&self, spec: ComponentSpec) -> Result<ComponentMetadata> {
        let _guard = self.control.lock().await;
        self.assign(spec).await
    }

    /// Remove a component and reset its pins to OUTPUT/LOW.
    pub async fn remove_component(&self, name: &str) -> Result<()> {
        let _guard = self.control.lock().await;
        self.unassign(name).await
    }

    pub async fn component_data(&self, name: &str) -> Result<ComponentReading> {
        self.components.data(name).await
    }

    pub async fn write_component(&self, name: &str, data: Value) -> Result<()> {
        self.components.write(name, data).await
    }

    pub async fn test_component(&self, name: &str) -> Result<bool> {
        self.components.test(name).await
    }

    pub async fn component(&self, name: &str) -> Result<ComponentMetadata> {
        self.components.metadata(name).await
    }

    pub async fn components(&self) -> Vec<ComponentMetadata> {
        self.components.list().await
    }

    /// Name of the component bound to `pin`, if any.
    pub async fn component_on(&self, pin: PinId) -> Option<String> {
        self.components.find_by_pin(pin).await
    }

    pub fn component_types(&self) -> Vec<ComponentType> {
        self.components.factory().types()
    }

    /// Stop every task and component and put every GPIO pin back to
    /// OUTPUT/LOW. Peripheral modes are kept.
    pub async fn reset_all(&self) -> Result<()> {
        let _guard = self.control.lock().await;
        self.reset_pins().await;
        info!("All pins reset");
        Ok(())
    }

    /// Current layout.
    pub async fn layout(&self) -> PanelLayout {
        let _guard = self.control.lock().await;
        PanelLayout::capture(
            &self.registry.snapshot(),
            self.components.specs().await,
            self.clock.is_enabled().await,
        )
    }

    /// Reset the panel and replay `layout` through the normal control
    /// operations. Entries that fail are reported and skipped.
    pub async fn apply_layout(&self, layout: &PanelLayout) -> LoadReport {
        let _guard = self.control.lock().await;
        let mut report = LoadReport::default();
        self.reset_pins().await;

        let wanted: Vec<PinId> = layout.peripheral_pins().map(|p| p.pin).collect();
        for pin in PinId::all() {
            let current = self.registry.record(pin).peripheral_mode;
            if current != PeripheralMode::Gpio && !wanted.contains(&pin) {
                if let Err(e) = self.switch_peripheral(pin, PeripheralMode::Gpio).await {
                    report.errors.push(format!("pin {}: {}", pin, e));
                }
            }
        }

        for entry in layout.peripheral_pins() {
            match self.switch_peripheral(entry.pin, entry.peripheral).await {
                Ok(_) => report.pins += 1,
                Err(e) => report.errors.push(format!("pin {}: {}", entry.pin, e)),
            }
        }

        for entry in layout.gpio_pins() {
            let applied = if entry.flashing {
                let period = entry
                    .flash_period_ms
                    .map(Duration::from_millis)
                    .unwrap_or(self.settings.default_flash_period);
                self.flash_on(entry.pin, period).await
            } else {
                match self.direct(entry.pin, entry.mode).await {
                    Ok(()) if entry.mode == PinMode::Output && entry.state => {
                        self.drive(entry.pin, true).await
                    }
                    other => other,
                }
            };
            match applied {
                Ok(()) => report.pins += 1,
                Err(e) => report.errors.push(format!("pin {}: {}", entry.pin, e)),
            }
        }

        for spec in &layout.components {
            match self.assign(spec.clone()).await {
                Ok(_) => report.components += 1,
                Err(e) => report.errors.push(format!("component '{}': {}", spec.name, e)),
            }
        }

        if layout.clock_enabled {
            match self.clock_on().await {
                Ok(()) => report.clock_enabled = true,
                Err(e) => report.errors.push(format!("clock: {}", e)),
            }
        }

        for error in &report.errors {
            warn!("Layout entry skipped: {}", error);
        }
        info!(
            "Layout applied: {} pins, {} components, clock {}",
            report.pins,
            report.components,
            if report.clock_enabled { "on" } else { "off" }
        );
        report
    }

    pub async fn save_layout(&self, path: impl AsRef<Path>) -> Result<PanelLayout> {
        let layout = self.layout().await;
        layout.save(path.as_ref()).await?;
        info!("Layout saved to {}", path.as_ref().display());
        Ok(layout)
    }

    pub async fn load_layout(&self, path: impl AsRef<Path>) -> Result<LoadReport> {
        let layout = PanelLayout::load(path.as_ref()).await?;
        info!("Loading layout from {}", path.as_ref().display());
        Ok(self.apply_layout(&layout).await)
    }

    /// Stop everything and hand every line back to the system.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        let _guard = self.control.lock().await;
        self.clock.disable().await;
        self.flash.stop_all().await;
        self.components.remove_all().await;
        self.registry.release_all(self.settings.reset_on_shutdown);
        info!("Panel shut down, all lines released");
    }

    // Everything below expects the control lock to be held.

    /// Tear down whatever task owns `pin` after its lease was taken away.
    async fn teardown(&self, pin: PinId, evicted: Owner) {
        debug!("Evicting {} from pin {}", evicted, pin);
        match evicted {
            Owner::Flash { .. } => {
                self.flash.stop(pin).await;
            }
            Owner::Clock => {
                if self.clock.disable().await {
                    info!("Clock disabled: pin {} was taken over", pin);
                }
            }
            Owner::Component { name } => match self.components.remove(&name).await {
                Ok(pins) => {
                    info!("Component '{}' removed: pin {} was taken over", name, pin);
                    self.reset_released(&pins);
                }
                // Already torn down by an earlier eviction in the same batch.
                Err(PanelError::ComponentNotFound(_)) => {}
                Err(e) => warn!("Failed to remove component '{}': {}", name, e),
            },
        }
    }

    /// Revoke and tear down the owner of `pin`, if any.
    async fn evict(&self, pin: PinId) {
        if let Some(owner) = self.registry.revoke(pin) {
            self.teardown(pin, owner).await;
        }
    }

    /// Reset pins handed back by a component, skipping any already reclaimed.
    fn reset_released(&self, pins: &[PinId]) {
        for pin in pins {
            if self.registry.owner(*pin).is_some() {
                continue;
            }
            if let Err(e) = self.registry.reset_pin(*pin) {
                warn!("Failed to reset pin {}: {}", pin, e);
            }
        }
    }

    fn ensure_gpio(&self, pin: PinId) -> Result<()> {
        let mode = self.registry.record(pin).peripheral_mode;
        if mode != PeripheralMode::Gpio {
            return Err(PanelError::unsupported_mode(
                pin.physical(),
                format!("pin is in {} mode", mode),
            ));
        }
        Ok(())
    }

    async fn direct(&self, pin: PinId, mode: PinMode) -> Result<()> {
        self.ensure_gpio(pin)?;
        self.evict(pin).await;
        self.registry.set_mode(pin, mode)
    }

    async fn drive(&self, pin: PinId, high: bool) -> Result<()> {
        self.ensure_gpio(pin)?;
        self.evict(pin).await;
        self.registry.set_state(pin, high)
    }

    async fn switch_peripheral(&self, pin: PinId, mode: PeripheralMode) -> Result<Vec<PinId>> {
        if !pin.supports(mode) {
            return Err(PanelError::unsupported_mode(
                pin.physical(),
                format!("{} is not available on this pin", mode),
            ));
        }
        let current = self.registry.record(pin).peripheral_mode;
        if current == mode {
            return Ok(Vec::new());
        }

        let group_mode = if mode == PeripheralMode::Gpio { current } else { mode };
        for member in peripheral_group(pin, group_mode) {
            self.evict(member).await;
        }
        let moved = self.registry.set_peripheral(pin, mode)?;
        info!(
            "Pin {} switched to {} ({} pins moved)",
            pin,
            mode,
            moved.len()
        );
        Ok(moved)
    }

    async fn flash_on(&self, pin: PinId, period: Duration) -> Result<()> {
        if period < MIN_FLASH_PERIOD {
            return Err(PanelError::invalid_argument(format!(
                "flash period must be at least {}ms",
                MIN_FLASH_PERIOD.as_millis()
            )));
        }
        self.ensure_gpio(pin)?;

        let owner = Owner::Flash {
            period_ms: period.as_millis() as u64,
        };
        let (lease, evicted) = self.registry.claim_evicting(pin, owner)?;
        if let Some(evicted @ (Owner::Clock | Owner::Component { .. })) = evicted {
            self.teardown(pin, evicted).await;
        }

        if let Err(e) = self.flash.start(lease, period).await {
            self.registry.release(lease);
            return Err(e);
        }
        Ok(())
    }

    async fn clock_on(&self) -> Result<()> {
        let reserved = clock::reserved_pins();
        for pin in &reserved {
            self.ensure_gpio(*pin)?;
        }
        if self.clock.is_enabled().await {
            return Ok(());
        }

        let mut leases = Vec::with_capacity(reserved.len());
        let mut evicted = Vec::new();
        for pin in &reserved {
            match self.registry.claim_evicting(*pin, Owner::Clock) {
                Ok((lease, previous)) => {
                    leases.push(lease);
                    evicted.extend(previous.map(|o| (*pin, o)));
                }
                Err(e) => {
                    self.release_leases(&leases);
                    return Err(e);
                }
            }
        }
        for (pin, owner) in evicted {
            self.teardown(pin, owner).await;
        }

        if let Err(e) = self.clock.enable(leases.clone()).await {
            self.release_leases(&leases);
            return Err(e);
        }
        Ok(())
    }

    async fn assign(&self, spec: ComponentSpec) -> Result<ComponentMetadata> {
        self.components.validate(&spec)?;
        for pin in spec.pins.values() {
            self.ensure_gpio(*pin)?;
        }
        if self.components.contains(&spec.name).await {
            let pins = self.components.remove(&spec.name).await?;
            self.reset_released(&pins);
        }

        let owner = Owner::Component {
            name: spec.name.clone(),
        };
        let mut leases = BTreeMap::new();
        let mut evicted = Vec::new();
        for (role, pin) in &spec.pins {
            match self.registry.claim_evicting(*pin, owner.clone()) {
                Ok((lease, previous)) => {
                    leases.insert(role.clone(), lease);
                    evicted.extend(previous.map(|o| (*pin, o)));
                }
                Err(e) => {
                    self.abandon(&leases);
                    return Err(e);
                }
            }
        }
        for (pin, previous) in evicted {
            self.teardown(pin, previous).await;
        }

        match self.components.start(spec, leases.clone()).await {
            Ok(metadata) => Ok(metadata),
            Err(e) => {
                self.abandon(&leases);
                Err(e)
            }
        }
    }

    /// Give back leases of a failed assignment and reset their pins.
    fn abandon(&self, leases: &BTreeMap<String, Lease>) {
        let leases: Vec<Lease> = leases.values().copied().collect();
        self.release_leases(&leases);
        let pins: Vec<PinId> = leases.iter().map(|l| l.pin()).collect();
        self.reset_released(&pins);
    }

    fn release_leases(&self, leases: &[Lease]) {
        for lease in leases {
            self.registry.release(*lease);
        }
    }

    async fn unassign(&self, name: &str) -> Result<()> {
        let pins = self.components.remove(name).await?;
        self.reset_released(&pins);
        Ok(())
    }

    async fn reset_pins(&self) {
        self.clock.disable().await;
        self.flash.stop_all().await;
        self.components.remove_all().await;
        for pin in PinId::all() {
            if let Err(e) = self.registry.reset_pin(pin) {
                warn!("Failed to reset pin {}: {}", pin, e);
            }
        }
    }
}
