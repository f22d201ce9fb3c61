//! Clock display driver: shows the current second of the minute in BCD on
//! seven reserved pins.
//!
//! The tens digit (0-5) uses three pins and the ones digit (0-9) four. Each
//! tick computes the level of every reserved pin and writes the whole frame
//! under a single registry lock, so a snapshot never sees half a frame.

use crate::error::{PanelError, Result};
use crate::pins::{Lease, PinId, PinMode, PinRegistry};
use crate::tasks::TaskHandle;
use chrono::Timelike;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Physical pins carrying the tens digit, least significant bit first.
pub const TENS_PINS: [u8; 3] = [11, 13, 15];

/// Physical pins carrying the ones digit, least significant bit first.
pub const ONES_PINS: [u8; 4] = [16, 18, 22, 37];

/// Active bits for each decimal digit, least significant bit first.
pub const DIGIT_PATTERNS: [[bool; 4]; 10] = [
    [false, false, false, false],
    [true, false, false, false],
    [false, true, false, false],
    [true, true, false, false],
    [false, false, true, false],
    [true, false, true, false],
    [false, true, true, false],
    [true, true, true, false],
    [false, false, false, true],
    [true, false, false, true],
];

/// Default interval between frames.
pub const CLOCK_TICK: Duration = Duration::from_secs(1);

/// Source of wall-clock seconds.
pub trait TimeSource: Send + Sync {
    /// Current second of the minute, 0-59.
    fn second_of_minute(&self) -> u32;
}

/// Local wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTime;

impl TimeSource for LocalTime {
    fn second_of_minute(&self) -> u32 {
        chrono::Local::now().second()
    }
}

/// Every pin reserved for the clock display.
pub fn reserved_pins() -> Vec<PinId> {
    TENS_PINS
        .iter()
        .chain(ONES_PINS.iter())
        .filter_map(|n| PinId::new(*n).ok())
        .collect()
}

/// Whether `pin` is one of the clock's reserved pins.
pub fn is_reserved(pin: PinId) -> bool {
    let n = pin.physical();
    TENS_PINS.contains(&n) || ONES_PINS.contains(&n)
}

/// Level of every reserved pin for `second`: all cleared, then the tens and
/// ones patterns switched on.
pub fn frame(second: u32) -> Vec<(u8, bool)> {
    let second = second % 60;
    let tens = &DIGIT_PATTERNS[(second / 10) as usize];
    let ones = &DIGIT_PATTERNS[(second % 10) as usize];

    let mut levels: Vec<(u8, bool)> = TENS_PINS
        .iter()
        .chain(ONES_PINS.iter())
        .map(|n| (*n, false))
        .collect();
    for (level, bit) in levels.iter_mut().zip(tens.iter().take(TENS_PINS.len())) {
        level.1 = *bit;
    }
    for (level, bit) in levels[TENS_PINS.len()..].iter_mut().zip(ones.iter()) {
        level.1 = *bit;
    }
    levels
}

fn render(registry: &PinRegistry, leases: &[Lease], second: u32) -> Result<()> {
    let writes: Vec<(Lease, bool)> = frame(second)
        .into_iter()
        .filter_map(|(physical, high)| {
            leases
                .iter()
                .find(|l| l.pin().physical() == physical)
                .map(|l| (*l, high))
        })
        .collect();
    registry.write_owned_batch(&writes)
}

#[derive(Debug)]
struct ClockTask {
    leases: Vec<Lease>,
    handle: TaskHandle,
}

/// Runs the clock display as a single unit.
pub struct ClockDriver {
    registry: PinRegistry,
    time: Arc<dyn TimeSource>,
    tick: Duration,
    task: Mutex<Option<ClockTask>>,
}

impl ClockDriver {
    pub fn new(registry: PinRegistry, time: Arc<dyn TimeSource>) -> Self {
        Self {
            registry,
            time,
            tick: CLOCK_TICK,
            task: Mutex::new(None),
        }
    }

    /// Override the frame interval.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Start the display on the leased reserved pins.
    ///
    /// `leases` must cover every reserved pin. The first frame is written
    /// before this returns. Enabling an already running clock replaces it.
    pub async fn enable(&self, leases: Vec<Lease>) -> Result<()> {
        let reserved = reserved_pins();
        if leases.len() != reserved.len()
            || !reserved.iter().all(|p| leases.iter().any(|l| l.pin() == *p))
        {
            return Err(PanelError::invalid_argument(
                "clock needs a lease on every reserved pin",
            ));
        }

        let mut slot = self.task.lock().await;
        if let Some(previous) = slot.take() {
            Self::teardown(&self.registry, previous).await;
        }

        for lease in &leases {
            self.registry.configure_owned(*lease, PinMode::Output)?;
        }
        render(&self.registry, &leases, self.time.second_of_minute())?;

        let registry = self.registry.clone();
        let time = Arc::clone(&self.time);
        let tick = self.tick;
        let task_leases = leases.clone();
        let handle = TaskHandle::spawn("clock", move |stop| {
            run(registry, time, task_leases, tick, stop)
        });
        *slot = Some(ClockTask { leases, handle });

        info!("Clock display enabled");
        Ok(())
    }

    /// Stop the display and release its pins. Pins keep their last frame.
    pub async fn disable(&self) -> bool {
        let task = self.task.lock().await.take();
        match task {
            Some(task) => {
                Self::teardown(&self.registry, task).await;
                info!("Clock display disabled");
                true
            }
            None => false,
        }
    }

    pub async fn is_enabled(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    async fn teardown(registry: &PinRegistry, task: ClockTask) {
        for lease in &task.leases {
            registry.release(*lease);
        }
        task.handle.stop().await;
    }
}

impl std::fmt::Debug for ClockDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockDriver").field("tick", &self.tick).finish()
    }
}

async fn run(
    registry: PinRegistry,
    time: Arc<dyn TimeSource>,
    leases: Vec<Lease>,
    tick: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    let mut ticker = time::interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = ticker.tick() => {}
        }

        let second = time.second_of_minute();
        match render(&registry, &leases, second) {
            Ok(()) => debug!("Clock frame for second {}", second),
            Err(PanelError::OwnershipConflict { .. }) => {
                debug!("Clock lost a reserved pin, stopping");
                break;
            }
            Err(e) => warn!("Clock frame failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(second: u32) -> Vec<u8> {
        frame(second)
            .into_iter()
            .filter(|(_, high)| *high)
            .map(|(pin, _)| pin)
            .collect()
    }

    #[test]
    fn test_frames() {
        assert!(active(0).is_empty());
        assert_eq!(active(1), vec![16]);
        assert_eq!(active(37), vec![11, 13, 16, 18, 22]);
        assert_eq!(active(59), vec![11, 15, 16, 37]);
        assert_eq!(frame(12).len(), 7);
    }

    #[test]
    fn test_reserved_pins() {
        let pins: Vec<u8> = reserved_pins().into_iter().map(u8::from).collect();
        assert_eq!(pins, vec![11, 13, 15, 16, 18, 22, 37]);
        assert!(is_reserved(PinId::new(37).unwrap()));
        assert!(!is_reserved(PinId::new(7).unwrap()));
    }
}
