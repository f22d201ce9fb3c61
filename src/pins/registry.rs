//! The pin state registry: the single source of truth for every header pin
//! and the only place hardware lines are touched.
//!
//! All state lives behind one mutex. Every mutating call holds it for the
//! hardware call plus the bookkeeping update, so two controllers can never
//! interleave partial writes on the same pin. The lock is a plain
//! `std::sync::Mutex` and is never held across an `.await`.
//!
//! Ownership is lease based: a task claims a pin and receives a [`Lease`];
//! its writes are rejected as soon as the lease is revoked or superseded.

use crate::error::{PanelError, Result};
use crate::hardware::{HardwareBackend, PeripheralSwitch};
use crate::pins::header::{peripheral_group, PinId};
use crate::pins::state::{
    Lease, Owner, PeripheralMode, PinMode, PinSnapshot, PinStateRecord,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Holder {
    owner: Owner,
    lease: u64,
}

#[derive(Debug, Clone)]
struct PinSlot {
    mode: PinMode,
    state: bool,
    peripheral: PeripheralMode,
    initialized: bool,
    holder: Option<Holder>,
}

impl Default for PinSlot {
    fn default() -> Self {
        Self {
            mode: PinMode::Output,
            state: false,
            peripheral: PeripheralMode::Gpio,
            initialized: false,
            holder: None,
        }
    }
}

impl PinSlot {
    fn ensure_gpio(&self, pin: PinId) -> Result<()> {
        if self.peripheral != PeripheralMode::Gpio {
            return Err(PanelError::unsupported_mode(
                pin.physical(),
                format!("pin is in {} mode", self.peripheral),
            ));
        }
        Ok(())
    }

    fn ensure_unowned(&self, pin: PinId) -> Result<()> {
        match &self.holder {
            Some(holder) => Err(PanelError::ownership_conflict(pin.physical(), &holder.owner)),
            None => Ok(()),
        }
    }

    fn ensure_lease(&self, lease: Lease) -> Result<()> {
        match &self.holder {
            Some(holder) if holder.lease == lease.id => Ok(()),
            Some(holder) => Err(PanelError::ownership_conflict(
                lease.pin.physical(),
                &holder.owner,
            )),
            None => Err(PanelError::ownership_conflict(lease.pin.physical(), "nobody")),
        }
    }

    fn ensure_output(&self, pin: PinId) -> Result<()> {
        if self.mode != PinMode::Output {
            return Err(PanelError::unsupported_mode(
                pin.physical(),
                "pin is configured as INPUT",
            ));
        }
        Ok(())
    }

    fn record(&self, pin: PinId) -> PinStateRecord {
        let flash_period_ms = match &self.holder {
            Some(Holder {
                owner: Owner::Flash { period_ms },
                ..
            }) => Some(*period_ms),
            _ => None,
        };

        PinStateRecord {
            pin,
            bcm: pin.bcm(),
            label: pin.label(),
            mode: self.mode,
            state: self.state,
            flashing: flash_period_ms.is_some(),
            flash_period_ms,
            peripheral_mode: self.peripheral,
            available_modes: pin.available_modes(),
            owner: self.holder.as_ref().map(|h| h.owner.clone()),
            initialized: self.initialized,
        }
    }
}

struct Inner {
    hardware: Box<dyn HardwareBackend>,
    peripherals: Arc<dyn PeripheralSwitch>,
    /// Slots are created on first use; absent pins read as the default.
    slots: BTreeMap<PinId, PinSlot>,
    next_lease: u64,
}

impl Inner {
    fn slot(&mut self, pin: PinId) -> &mut PinSlot {
        self.slots.entry(pin).or_default()
    }

    fn current(&mut self, pin: PinId) -> PinSlot {
        self.slot(pin).clone()
    }

    /// Configure the hardware line the first time a pin is used.
    fn bring_up(&mut self, pin: PinId, current: &PinSlot) -> Result<()> {
        if !current.initialized {
            debug!("Configuring line {} for pin {} as {}", pin.bcm(), pin, current.mode);
            self.hardware.configure_line(pin.bcm(), current.mode)?;
        }
        Ok(())
    }

    /// Put a line back the way `previous` describes after a failed change.
    ///
    /// The record is not touched unless the line could not be restored, in
    /// which case it is marked uninitialized so the next use configures it
    /// from scratch.
    fn restore(&mut self, pin: PinId, previous: &PinSlot) {
        let bcm = pin.bcm();
        let restored = if previous.initialized {
            self.hardware
                .configure_line(bcm, previous.mode)
                .and_then(|()| match previous.mode {
                    PinMode::Output => self.hardware.write_line(bcm, previous.state),
                    PinMode::Input => Ok(()),
                })
        } else {
            self.hardware.release_line(bcm)
        };

        match restored {
            Ok(()) => self.slot(pin).initialized = previous.initialized,
            Err(e) => {
                warn!("Failed to restore line for pin {}: {}", pin, e);
                self.slot(pin).initialized = false;
            }
        }
    }

    /// Switch a line's direction, then drive it or sample it.
    ///
    /// Output lines are driven to `level`. If the second step fails the
    /// line is put back as `previous` describes.
    fn reconfigure(&mut self, pin: PinId, previous: &PinSlot, mode: PinMode, level: bool) -> Result<bool> {
        let bcm = pin.bcm();
        self.hardware.configure_line(bcm, mode)?;
        let settled = match mode {
            PinMode::Output => self.hardware.write_line(bcm, level).map(|()| level),
            PinMode::Input => self.hardware.read_line(bcm),
        };
        if settled.is_err() {
            self.restore(pin, previous);
        }
        settled
    }

    fn issue(&mut self, pin: PinId, owner: Owner) -> Lease {
        self.next_lease += 1;
        let id = self.next_lease;
        self.slot(pin).holder = Some(Holder { owner, lease: id });
        Lease { pin, id }
    }

    fn write_checked(&mut self, lease: Lease, high: bool) -> Result<()> {
        let pin = lease.pin;
        let current = self.current(pin);
        current.ensure_lease(lease)?;
        current.ensure_gpio(pin)?;
        current.ensure_output(pin)?;

        self.bring_up(pin, &current)?;
        self.hardware.write_line(pin.bcm(), high)?;

        let slot = self.slot(pin);
        slot.state = high;
        slot.initialized = true;
        Ok(())
    }
}

/// Shared handle to the pin state registry.
///
/// Cloning is cheap; all clones refer to the same registry.
#[derive(Clone)]
pub struct PinRegistry {
    inner: Arc<Mutex<Inner>>,
    backend: &'static str,
}

impl PinRegistry {
    /// Create a registry over an acquired hardware backend.
    pub fn new(hardware: Box<dyn HardwareBackend>, peripherals: Arc<dyn PeripheralSwitch>) -> Self {
        let backend = hardware.name();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                hardware,
                peripherals,
                slots: BTreeMap::new(),
                next_lease: 0,
            })),
            backend,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Name of the hardware backend in use.
    pub fn backend_name(&self) -> &'static str {
        self.backend
    }

    /// Consistent copy of every pin record.
    pub fn snapshot(&self) -> PinSnapshot {
        let inner = self.lock();
        let pins = PinId::all()
            .map(|pin| {
                let record = match inner.slots.get(&pin) {
                    Some(slot) => slot.record(pin),
                    None => PinSlot::default().record(pin),
                };
                (pin, record)
            })
            .collect();

        PinSnapshot {
            timestamp: chrono::Utc::now().timestamp_millis(),
            pins,
        }
    }

    /// Copy of a single pin record.
    pub fn record(&self, pin: PinId) -> PinStateRecord {
        self.lock().current(pin).record(pin)
    }

    /// Current owner of `pin`, if any.
    pub fn owner(&self, pin: PinId) -> Option<Owner> {
        self.lock()
            .slots
            .get(&pin)
            .and_then(|slot| slot.holder.as_ref().map(|h| h.owner.clone()))
    }

    /// Set the direction of an unowned GPIO pin.
    ///
    /// Switching to OUTPUT drives the line LOW; switching to INPUT samples it.
    pub fn set_mode(&self, pin: PinId, mode: PinMode) -> Result<()> {
        let mut inner = self.lock();
        let current = inner.current(pin);
        current.ensure_gpio(pin)?;
        current.ensure_unowned(pin)?;

        let state = inner.reconfigure(pin, &current, mode, false)?;

        let slot = inner.slot(pin);
        slot.mode = mode;
        slot.state = state;
        slot.initialized = true;
        debug!("Pin {} mode set to {}", pin, mode);
        Ok(())
    }

    /// Drive an unowned OUTPUT pin.
    pub fn set_state(&self, pin: PinId, high: bool) -> Result<()> {
        let mut inner = self.lock();
        let current = inner.current(pin);
        current.ensure_gpio(pin)?;
        current.ensure_unowned(pin)?;
        current.ensure_output(pin)?;

        inner.bring_up(pin, &current)?;
        inner.hardware.write_line(pin.bcm(), high)?;

        let slot = inner.slot(pin);
        slot.state = high;
        slot.initialized = true;
        debug!("Pin {} set {}", pin, if high { "HIGH" } else { "LOW" });
        Ok(())
    }

    /// Sample an INPUT pin, or return the commanded level of an OUTPUT pin.
    pub fn read_pin(&self, pin: PinId) -> Result<bool> {
        let mut inner = self.lock();
        let current = inner.current(pin);
        current.ensure_gpio(pin)?;

        if current.mode == PinMode::Output {
            return Ok(current.state);
        }

        inner.bring_up(pin, &current)?;
        let level = inner.hardware.read_line(pin.bcm())?;

        let slot = inner.slot(pin);
        slot.state = level;
        slot.initialized = true;
        Ok(level)
    }

    /// Refresh the state of every configured, unowned INPUT pin.
    ///
    /// Pins owned by a task are left alone so a sample never lands in the
    /// middle of a component's own use of the line.
    pub fn sample_inputs(&self) {
        let mut inner = self.lock();
        let inputs: Vec<PinId> = inner
            .slots
            .iter()
            .filter(|(_, s)| {
                s.initialized
                    && s.mode == PinMode::Input
                    && s.peripheral == PeripheralMode::Gpio
                    && s.holder.is_none()
            })
            .map(|(pin, _)| *pin)
            .collect();

        for pin in inputs {
            match inner.hardware.read_line(pin.bcm()) {
                Ok(level) => inner.slot(pin).state = level,
                Err(e) => warn!("Failed to sample pin {}: {}", pin, e),
            }
        }
    }

    /// Switch `pin` (and the rest of its bus) between GPIO and an alternate
    /// function. Returns every pin whose peripheral mode changed.
    pub fn set_peripheral(&self, pin: PinId, target: PeripheralMode) -> Result<Vec<PinId>> {
        if !pin.supports(target) {
            return Err(PanelError::unsupported_mode(
                pin.physical(),
                format!("{} is not available on this pin", target),
            ));
        }

        let mut inner = self.lock();
        let current = inner.current(pin);
        if current.peripheral == target {
            return Ok(Vec::new());
        }

        let group_mode = if target == PeripheralMode::Gpio {
            current.peripheral
        } else {
            target
        };
        let group = peripheral_group(pin, group_mode);
        for member in &group {
            inner.current(*member).ensure_unowned(*member)?;
        }

        // Lines must be handed back before the alternate function takes
        // over, or releasing them later would clobber it.
        let mut released = Vec::new();
        if target != PeripheralMode::Gpio {
            for member in &group {
                let previous = inner.current(*member);
                if previous.initialized {
                    if let Err(e) = inner.hardware.release_line(member.bcm()) {
                        warn!("Failed to release line for pin {}: {}", member, e);
                    }
                    inner.slot(*member).initialized = false;
                    released.push((*member, previous));
                }
            }
        }

        let peripherals = Arc::clone(&inner.peripherals);
        if let Err(e) = peripherals.apply(pin, current.peripheral, target) {
            for (member, previous) in &released {
                inner.restore(*member, previous);
            }
            return Err(e);
        }

        for member in &group {
            let slot = inner.slot(*member);
            slot.peripheral = target;
            slot.initialized = false;
            if target == PeripheralMode::Gpio {
                slot.mode = PinMode::Output;
                slot.state = false;
            }
        }
        debug!("Pin {} peripheral mode set to {} ({} pins)", pin, target, group.len());
        Ok(group)
    }

    /// Put an unowned GPIO pin back to OUTPUT/LOW.
    ///
    /// Pins never touched stay unconfigured; pins in a peripheral mode are
    /// left to their peripheral.
    pub fn reset_pin(&self, pin: PinId) -> Result<()> {
        let mut inner = self.lock();
        let current = inner.current(pin);
        current.ensure_unowned(pin)?;
        if current.peripheral != PeripheralMode::Gpio {
            return Ok(());
        }

        if current.initialized {
            let bcm = pin.bcm();
            inner.hardware.configure_line(bcm, PinMode::Output)?;
            inner.hardware.write_line(bcm, false)?;
        }

        let slot = inner.slot(pin);
        slot.mode = PinMode::Output;
        slot.state = false;
        Ok(())
    }

    /// Grant `owner` write rights over an unowned GPIO pin.
    pub fn claim(&self, pin: PinId, owner: Owner) -> Result<Lease> {
        let mut inner = self.lock();
        let current = inner.current(pin);
        current.ensure_gpio(pin)?;
        current.ensure_unowned(pin)?;
        Ok(inner.issue(pin, owner))
    }

    /// Grant `owner` write rights, revoking whoever held the pin.
    ///
    /// The transfer is atomic: there is no instant at which both the old and
    /// the new owner may write. Returns the evicted owner.
    pub fn claim_evicting(&self, pin: PinId, owner: Owner) -> Result<(Lease, Option<Owner>)> {
        let mut inner = self.lock();
        let current = inner.current(pin);
        current.ensure_gpio(pin)?;
        let evicted = inner.slot(pin).holder.take().map(|h| h.owner);
        Ok((inner.issue(pin, owner), evicted))
    }

    /// Revoke whatever lease is held on `pin`. Returns the previous owner.
    pub fn revoke(&self, pin: PinId) -> Option<Owner> {
        self.lock().slot(pin).holder.take().map(|h| h.owner)
    }

    /// Give up a lease. Releasing a stale lease is a no-op.
    pub fn release(&self, lease: Lease) -> bool {
        let mut inner = self.lock();
        let slot = inner.slot(lease.pin);
        if slot.holder.as_ref().is_some_and(|h| h.lease == lease.id) {
            slot.holder = None;
            true
        } else {
            false
        }
    }

    /// Whether `lease` is still the active lease on its pin.
    pub fn holds(&self, lease: Lease) -> bool {
        self.lock().current(lease.pin).ensure_lease(lease).is_ok()
    }

    /// Set the direction of an owned pin.
    ///
    /// An OUTPUT switch keeps the commanded level of a pin that was already an
    /// output and drives LOW otherwise.
    pub fn configure_owned(&self, lease: Lease, mode: PinMode) -> Result<()> {
        let pin = lease.pin;
        let mut inner = self.lock();
        let current = inner.current(pin);
        current.ensure_lease(lease)?;
        current.ensure_gpio(pin)?;

        let level = current.mode == PinMode::Output && current.state;
        let state = inner.reconfigure(pin, &current, mode, level)?;

        let slot = inner.slot(pin);
        slot.mode = mode;
        slot.state = state;
        slot.initialized = true;
        Ok(())
    }

    /// Drive an owned OUTPUT pin.
    pub fn write_owned(&self, lease: Lease, high: bool) -> Result<()> {
        self.lock().write_checked(lease, high)
    }

    /// Flip an owned OUTPUT pin. Returns the new level.
    pub fn toggle_owned(&self, lease: Lease) -> Result<bool> {
        let mut inner = self.lock();
        let next = !inner.current(lease.pin).state;
        inner.write_checked(lease, next)?;
        Ok(next)
    }

    /// Drive several owned pins under a single lock acquisition.
    ///
    /// Every lease is checked before the first write.
    pub fn write_owned_batch(&self, writes: &[(Lease, bool)]) -> Result<()> {
        let mut inner = self.lock();
        for (lease, _) in writes {
            let current = inner.current(lease.pin);
            current.ensure_lease(*lease)?;
            current.ensure_gpio(lease.pin)?;
            current.ensure_output(lease.pin)?;
        }
        for (lease, high) in writes {
            inner.write_checked(*lease, *high)?;
        }
        Ok(())
    }

    /// Run a raw line transaction on an owned pin with the registry locked.
    ///
    /// Used by components that bit-bang a protocol; nothing else can touch
    /// the hardware until `f` returns. `f` receives the backend and the BCM
    /// line number, and must leave the line in the pin's recorded mode.
    pub fn with_line<R>(
        &self,
        lease: Lease,
        f: impl FnOnce(&mut dyn HardwareBackend, u8) -> Result<R>,
    ) -> Result<R> {
        let pin = lease.pin;
        let mut inner = self.lock();
        let current = inner.current(pin);
        current.ensure_lease(lease)?;
        current.ensure_gpio(pin)?;

        inner.bring_up(pin, &current)?;
        inner.slot(pin).initialized = true;
        f(inner.hardware.as_mut(), pin.bcm())
    }

    /// Revoke every lease and hand every line back to the system.
    ///
    /// With `drive_low`, OUTPUT lines are driven LOW first. Errors are logged
    /// and do not stop the sweep.
    pub fn release_all(&self, drive_low: bool) {
        let mut inner = self.lock();
        let pins: Vec<PinId> = inner.slots.keys().copied().collect();

        for pin in pins {
            let current = inner.current(pin);
            inner.slot(pin).holder = None;
            if !current.initialized || current.peripheral != PeripheralMode::Gpio {
                continue;
            }

            let bcm = pin.bcm();
            if drive_low && current.mode == PinMode::Output {
                if let Err(e) = inner.hardware.write_line(bcm, false) {
                    warn!("Failed to drive pin {} low: {}", pin, e);
                }
            }
            if let Err(e) = inner.hardware.release_line(bcm) {
                warn!("Failed to release pin {}: {}", pin, e);
            }

            let slot = inner.slot(pin);
            slot.initialized = false;
            if drive_low {
                slot.state = false;
            }
        }
    }
}

impl std::fmt::Debug for PinRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinRegistry")
            .field("backend", &self.backend)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{NoopSwitch, SimProbe, SimulatedHardware};

    fn registry() -> (PinRegistry, SimProbe) {
        let hw = SimulatedHardware::new();
        let probe = hw.probe();
        (PinRegistry::new(Box::new(hw), Arc::new(NoopSwitch)), probe)
    }

    fn pin(n: u8) -> PinId {
        PinId::new(n).unwrap()
    }

    struct RefusingSwitch;

    impl PeripheralSwitch for RefusingSwitch {
        fn apply(&self, _: PinId, _: PeripheralMode, _: PeripheralMode) -> Result<()> {
            Err(PanelError::hardware_failure("dtparam not found"))
        }
    }

    #[test]
    fn test_default_snapshot() {
        let (registry, probe) = registry();
        let snapshot = registry.snapshot();

        assert_eq!(snapshot.pins.len(), 26);
        for record in snapshot.pins.values() {
            assert_eq!(record.mode, PinMode::Output);
            assert!(!record.state);
            assert!(!record.flashing);
            assert_eq!(record.peripheral_mode, PeripheralMode::Gpio);
            assert!(!record.initialized);
            assert!(!probe.is_configured(record.bcm));
        }
    }

    #[test]
    fn test_lazy_line_initialization() {
        let (registry, probe) = registry();
        let led = pin(11);

        registry.set_state(led, true).unwrap();
        assert!(probe.is_configured(17));
        assert_eq!(probe.level(17), Some(true));
        assert!(registry.record(led).initialized);

        registry.set_state(led, false).unwrap();
        assert_eq!(probe.writes(17), 2);
    }

    #[test]
    fn test_set_mode_touches_only_mode_and_level() {
        let (registry, probe) = registry();

        for p in PinId::all() {
            registry.set_mode(p, PinMode::Input).unwrap();
            let record = registry.record(p);
            assert_eq!(record.mode, PinMode::Input);
            assert_eq!(record.peripheral_mode, PeripheralMode::Gpio);
            assert!(!record.flashing);
            assert!(record.owner.is_none());
        }

        probe.set_input(4, true);
        registry.set_mode(pin(7), PinMode::Input).unwrap();
        assert!(registry.record(pin(7)).state);

        registry.set_mode(pin(7), PinMode::Output).unwrap();
        let record = registry.record(pin(7));
        assert_eq!(record.mode, PinMode::Output);
        assert!(!record.state);
    }

    #[test]
    fn test_set_state_rejects_input_pins() {
        let (registry, _) = registry();
        registry.set_mode(pin(13), PinMode::Input).unwrap();
        assert!(matches!(
            registry.set_state(pin(13), true),
            Err(PanelError::UnsupportedMode { pin: 13, .. })
        ));
    }

    #[test]
    fn test_peripheral_pin_is_not_driven() {
        let (registry, probe) = registry();
        let sda = pin(3);
        registry.set_state(sda, true).unwrap();

        let moved = registry.set_peripheral(sda, PeripheralMode::I2c).unwrap();
        assert_eq!(moved, vec![pin(3), pin(5)]);
        assert_eq!(registry.record(pin(5)).peripheral_mode, PeripheralMode::I2c);
        assert!(!probe.is_configured(2));

        assert!(matches!(
            registry.set_state(sda, false),
            Err(PanelError::UnsupportedMode { pin: 3, .. })
        ));
        assert!(matches!(
            registry.set_mode(pin(5), PinMode::Input),
            Err(PanelError::UnsupportedMode { .. })
        ));
        assert!(!probe.is_configured(2));
        assert_eq!(probe.writes(2), 0);

        registry.set_peripheral(pin(5), PeripheralMode::Gpio).unwrap();
        assert_eq!(registry.record(sda).peripheral_mode, PeripheralMode::Gpio);
        registry.set_state(sda, true).unwrap();
    }

    #[test]
    fn test_unsupported_peripheral() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.set_peripheral(pin(7), PeripheralMode::Spi),
            Err(PanelError::UnsupportedMode { pin: 7, .. })
        ));
        assert!(registry.set_peripheral(pin(7), PeripheralMode::Gpio).unwrap().is_empty());
    }

    #[test]
    fn test_failed_peripheral_switch_keeps_mode() {
        let hw = SimulatedHardware::new();
        let registry = PinRegistry::new(Box::new(hw), Arc::new(RefusingSwitch));

        assert!(matches!(
            registry.set_peripheral(pin(8), PeripheralMode::Uart),
            Err(PanelError::HardwareFailure(_))
        ));
        assert_eq!(registry.record(pin(8)).peripheral_mode, PeripheralMode::Gpio);
    }

    #[test]
    fn test_failed_peripheral_switch_restores_driven_line() {
        let hw = SimulatedHardware::new();
        let probe = hw.probe();
        let registry = PinRegistry::new(Box::new(hw), Arc::new(RefusingSwitch));
        let sda = pin(3);
        registry.set_state(sda, true).unwrap();
        let before = (registry.record(sda), registry.record(pin(5)));

        assert!(matches!(
            registry.set_peripheral(sda, PeripheralMode::I2c),
            Err(PanelError::HardwareFailure(_))
        ));
        assert_eq!((registry.record(sda), registry.record(pin(5))), before);
        assert!(probe.is_configured(2));
        assert_eq!(probe.mode(2), Some(PinMode::Output));
        assert_eq!(probe.level(2), Some(true));
        assert!(!probe.is_configured(3));

        registry.set_state(sda, false).unwrap();
        assert_eq!(probe.level(2), Some(false));
    }

    #[test]
    fn test_failed_drive_restores_direction() {
        let (registry, probe) = registry();
        let p = pin(15);
        registry.set_mode(p, PinMode::Input).unwrap();
        let before = registry.record(p);

        probe.set_io_failing(22, true);
        assert!(matches!(
            registry.set_mode(p, PinMode::Output),
            Err(PanelError::HardwareFailure(_))
        ));
        assert_eq!(registry.record(p), before);
        assert_eq!(probe.mode(22), Some(PinMode::Input));

        let lease = registry.claim(p, Owner::Clock).unwrap();
        assert!(registry.configure_owned(lease, PinMode::Output).is_err());
        assert_eq!(registry.record(p).mode, PinMode::Input);
        assert_eq!(probe.mode(22), Some(PinMode::Input));

        // A line that was never configured is handed back again.
        probe.set_io_failing(4, true);
        assert!(registry.set_mode(pin(7), PinMode::Output).is_err());
        assert!(!probe.is_configured(4));
        assert!(!registry.record(pin(7)).initialized);
    }

    #[test]
    fn test_hardware_failure_leaves_record_unchanged() {
        let (registry, probe) = registry();
        let p = pin(15);
        registry.set_state(p, true).unwrap();

        probe.set_failing(22, true);
        assert!(matches!(
            registry.set_state(p, false),
            Err(PanelError::HardwareFailure(_))
        ));
        assert!(registry.record(p).state);
        assert!(registry.set_mode(p, PinMode::Input).is_err());
        assert_eq!(registry.record(p).mode, PinMode::Output);
    }

    #[test]
    fn test_leases() {
        let (registry, probe) = registry();
        let p = pin(16);

        let lease = registry.claim(p, Owner::Flash { period_ms: 100 }).unwrap();
        assert!(registry.holds(lease));
        assert!(registry.record(p).flashing);
        assert_eq!(registry.record(p).flash_period_ms, Some(100));

        assert!(matches!(
            registry.claim(p, Owner::Clock),
            Err(PanelError::OwnershipConflict { pin: 16, .. })
        ));
        assert!(matches!(
            registry.set_state(p, true),
            Err(PanelError::OwnershipConflict { .. })
        ));

        assert!(registry.toggle_owned(lease).unwrap());
        assert_eq!(probe.level(23), Some(true));

        let (clock, evicted) = registry.claim_evicting(p, Owner::Clock).unwrap();
        assert_eq!(evicted, Some(Owner::Flash { period_ms: 100 }));
        assert!(!registry.holds(lease));
        assert!(matches!(
            registry.write_owned(lease, false),
            Err(PanelError::OwnershipConflict { .. })
        ));
        assert_eq!(probe.level(23), Some(true));

        assert!(!registry.release(lease));
        assert!(registry.release(clock));
        assert!(registry.owner(p).is_none());
        registry.set_state(p, false).unwrap();
    }

    #[test]
    fn test_batch_writes_check_every_lease_first() {
        let (registry, probe) = registry();
        let a = registry.claim(pin(11), Owner::Clock).unwrap();
        let b = registry.claim(pin(13), Owner::Clock).unwrap();
        registry.revoke(pin(13));

        assert!(registry.write_owned_batch(&[(a, true), (b, true)]).is_err());
        assert_eq!(probe.writes(17), 0);
        assert!(!registry.record(pin(11)).state);
    }

    #[test]
    fn test_release_all() {
        let (registry, probe) = registry();
        registry.set_state(pin(37), true).unwrap();
        registry.claim(pin(38), Owner::Clock).unwrap();

        registry.release_all(true);
        assert!(!probe.is_configured(26));
        assert_eq!(probe.released(), vec![26]);
        let record = registry.record(pin(37));
        assert!(!record.state);
        assert!(!record.initialized);
        assert!(registry.owner(pin(38)).is_none());
    }
}
