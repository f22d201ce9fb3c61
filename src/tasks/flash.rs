//! Flash controller: one toggling task per flashing pin.

use crate::error::{PanelError, Result};
use crate::pins::{Lease, PinId, PinMode, PinRegistry};
use crate::tasks::TaskHandle;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Shortest period a pin may be flashed at.
pub const MIN_FLASH_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct FlashTask {
    lease: Lease,
    period: Duration,
    handle: TaskHandle,
}

/// Owns the flash tasks.
///
/// The controller never claims pins itself: callers hand it a lease obtained
/// from the registry, which is what lets ownership be transferred atomically.
#[derive(Debug)]
pub struct FlashController {
    registry: PinRegistry,
    tasks: Mutex<BTreeMap<PinId, FlashTask>>,
}

impl FlashController {
    pub fn new(registry: PinRegistry) -> Self {
        Self {
            registry,
            tasks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Start toggling the leased pin every `period`.
    ///
    /// The pin is switched to OUTPUT first. Any task already flashing the pin
    /// is stopped before the new one starts. The first toggle happens one
    /// period after this call.
    pub async fn start(&self, lease: Lease, period: Duration) -> Result<()> {
        if period < MIN_FLASH_PERIOD {
            return Err(PanelError::invalid_argument(format!(
                "flash period must be at least {}ms",
                MIN_FLASH_PERIOD.as_millis()
            )));
        }

        let pin = lease.pin();
        let mut tasks = self.tasks.lock().await;
        if let Some(previous) = tasks.remove(&pin) {
            self.registry.release(previous.lease);
            previous.handle.stop().await;
        }

        self.registry.configure_owned(lease, PinMode::Output)?;

        let registry = self.registry.clone();
        let handle = TaskHandle::spawn(format!("flash-{}", pin), move |stop| {
            run(registry, lease, period, stop)
        });
        tasks.insert(
            pin,
            FlashTask {
                lease,
                period,
                handle,
            },
        );

        info!("Flashing pin {} every {}ms", pin, period.as_millis());
        Ok(())
    }

    /// Stop flashing `pin`, leaving it at its last written level.
    ///
    /// Returns whether a task was running. No toggle lands after this
    /// returns.
    pub async fn stop(&self, pin: PinId) -> bool {
        let task = self.tasks.lock().await.remove(&pin);
        match task {
            Some(task) => {
                self.registry.release(task.lease);
                task.handle.stop().await;
                info!("Stopped flashing pin {}", pin);
                true
            }
            None => false,
        }
    }

    /// Stop every flash task.
    pub async fn stop_all(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for (pin, task) in tasks {
            self.registry.release(task.lease);
            task.handle.stop().await;
            debug!("Stopped flashing pin {}", pin);
        }
    }

    pub async fn is_flashing(&self, pin: PinId) -> bool {
        self.tasks
            .lock()
            .await
            .get(&pin)
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Pins currently flashing and their periods.
    pub async fn active(&self) -> Vec<(PinId, Duration)> {
        self.tasks
            .lock()
            .await
            .iter()
            .filter(|(_, t)| !t.handle.is_finished())
            .map(|(pin, t)| (*pin, t.period))
            .collect()
    }
}

async fn run(registry: PinRegistry, lease: Lease, period: Duration, mut stop: oneshot::Receiver<()>) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = ticker.tick() => {}
        }

        match registry.toggle_owned(lease) {
            Ok(_) => {}
            Err(PanelError::OwnershipConflict { .. }) => {
                debug!("Flash task on pin {} lost ownership", lease.pin());
                break;
            }
            Err(e) => warn!("Flash tick on pin {} failed: {}", lease.pin(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{NoopSwitch, SimulatedHardware};
    use crate::pins::Owner;
    use std::sync::Arc;

    fn registry() -> PinRegistry {
        PinRegistry::new(Box::new(SimulatedHardware::new()), Arc::new(NoopSwitch))
    }

    #[tokio::test]
    async fn test_rejects_short_periods() {
        let registry = registry();
        let flash = FlashController::new(registry.clone());
        let pin = PinId::new(7).unwrap();
        let lease = registry.claim(pin, Owner::Flash { period_ms: 1 }).unwrap();

        assert!(matches!(
            flash.start(lease, Duration::from_millis(1)).await,
            Err(PanelError::InvalidArgument(_))
        ));
        assert!(!flash.is_flashing(pin).await);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let registry = registry();
        let flash = FlashController::new(registry.clone());
        let pin = PinId::new(7).unwrap();
        let lease = registry.claim(pin, Owner::Flash { period_ms: 50 }).unwrap();

        flash.start(lease, Duration::from_millis(50)).await.unwrap();
        assert!(flash.is_flashing(pin).await);
        assert!(flash.stop(pin).await);
        assert!(!flash.stop(pin).await);
        assert!(registry.owner(pin).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_exits_when_lease_is_revoked() {
        let registry = registry();
        let flash = FlashController::new(registry.clone());
        let pin = PinId::new(7).unwrap();
        let lease = registry.claim(pin, Owner::Flash { period_ms: 20 }).unwrap();
        flash.start(lease, Duration::from_millis(20)).await.unwrap();

        registry.revoke(pin);
        time::sleep(Duration::from_millis(50)).await;
        assert!(!flash.is_flashing(pin).await);
    }
}
