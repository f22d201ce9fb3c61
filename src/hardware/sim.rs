//! Simulated GPIO lines for development machines and tests.

use crate::error::{PanelError, Result};
use crate::hardware::HardwareBackend;
use crate::pins::state::PinMode;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy)]
struct SimLine {
    mode: PinMode,
    level: bool,
    writes: usize,
}

#[derive(Debug, Default)]
struct SimState {
    lines: HashMap<u8, SimLine>,
    /// Levels presented to lines configured as input
    inputs: HashMap<u8, bool>,
    failing: HashSet<u8>,
    /// Lines whose reads and writes fail while configuration still works
    failing_io: HashSet<u8>,
    released: Vec<u8>,
}

/// In-memory hardware backend.
///
/// Writes and reads behave like a real header with nothing attached: input
/// lines read whatever was injected through [`SimProbe::set_input`] (LOW by
/// default).
#[derive(Debug, Default)]
pub struct SimulatedHardware {
    state: Arc<Mutex<SimState>>,
}

/// Handle for inspecting and steering a [`SimulatedHardware`] after it has
/// been handed to the registry.
#[derive(Debug, Clone)]
pub struct SimProbe {
    state: Arc<Mutex<SimState>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedHardware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a probe sharing this backend's state.
    pub fn probe(&self) -> SimProbe {
        SimProbe {
            state: Arc::clone(&self.state),
        }
    }

    fn check(state: &SimState, line: u8) -> Result<()> {
        if state.failing.contains(&line) {
            return Err(PanelError::hardware_failure(format!(
                "simulated fault on line {}",
                line
            )));
        }
        Ok(())
    }

    fn check_io(state: &SimState, line: u8) -> Result<()> {
        Self::check(state, line)?;
        if state.failing_io.contains(&line) {
            return Err(PanelError::hardware_failure(format!(
                "simulated I/O fault on line {}",
                line
            )));
        }
        Ok(())
    }
}

impl HardwareBackend for SimulatedHardware {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn configure_line(&mut self, line: u8, mode: PinMode) -> Result<()> {
        let mut state = lock(&self.state);
        Self::check(&state, line)?;
        let input = state.inputs.get(&line).copied().unwrap_or(false);
        let entry = state.lines.entry(line).or_insert(SimLine {
            mode,
            level: false,
            writes: 0,
        });
        entry.mode = mode;
        if mode == PinMode::Input {
            entry.level = input;
        }
        Ok(())
    }

    fn write_line(&mut self, line: u8, high: bool) -> Result<()> {
        let mut state = lock(&self.state);
        Self::check_io(&state, line)?;
        match state.lines.get_mut(&line) {
            Some(sim) if sim.mode == PinMode::Output => {
                sim.level = high;
                sim.writes += 1;
                Ok(())
            }
            Some(_) => Err(PanelError::hardware_failure(format!(
                "line {} is configured as input",
                line
            ))),
            None => Err(PanelError::hardware_failure(format!(
                "line {} is not configured",
                line
            ))),
        }
    }

    fn read_line(&mut self, line: u8) -> Result<bool> {
        let state = lock(&self.state);
        Self::check_io(&state, line)?;
        match state.lines.get(&line) {
            Some(sim) if sim.mode == PinMode::Input => {
                Ok(state.inputs.get(&line).copied().unwrap_or(false))
            }
            Some(sim) => Ok(sim.level),
            None => Err(PanelError::hardware_failure(format!(
                "line {} is not configured",
                line
            ))),
        }
    }

    fn release_line(&mut self, line: u8) -> Result<()> {
        let mut state = lock(&self.state);
        if state.lines.remove(&line).is_some() {
            state.released.push(line);
        }
        Ok(())
    }
}

impl SimProbe {
    /// Driven level of a configured output line.
    pub fn level(&self, line: u8) -> Option<bool> {
        lock(&self.state).lines.get(&line).map(|l| l.level)
    }

    /// Direction of a configured line.
    pub fn mode(&self, line: u8) -> Option<PinMode> {
        lock(&self.state).lines.get(&line).map(|l| l.mode)
    }

    /// Number of successful writes to a line since it was configured.
    pub fn writes(&self, line: u8) -> usize {
        lock(&self.state)
            .lines
            .get(&line)
            .map(|l| l.writes)
            .unwrap_or(0)
    }

    pub fn is_configured(&self, line: u8) -> bool {
        lock(&self.state).lines.contains_key(&line)
    }

    /// Lines handed back with `release_line`, in order.
    pub fn released(&self) -> Vec<u8> {
        lock(&self.state).released.clone()
    }

    /// Present `high` on the line whenever it is read as an input.
    pub fn set_input(&self, line: u8, high: bool) {
        lock(&self.state).inputs.insert(line, high);
    }

    /// Make every call touching `line` fail until cleared.
    pub fn set_failing(&self, line: u8, failing: bool) {
        let mut state = lock(&self.state);
        if failing {
            state.failing.insert(line);
        } else {
            state.failing.remove(&line);
        }
    }

    /// Make reads and writes on `line` fail while it can still be
    /// configured and released.
    pub fn set_io_failing(&self, line: u8, failing: bool) {
        let mut state = lock(&self.state);
        if failing {
            state.failing_io.insert(line);
        } else {
            state.failing_io.remove(&line);
        }
    }
}
