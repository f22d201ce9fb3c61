//! DHT11/DHT22 temperature and humidity sensors.
//!
//! The single-wire protocol is bit-banged over the hardware boundary: the
//! host pulls the line low to request a frame, then times the width of every
//! high pulse the sensor answers with. A bit is `1` when its high pulse is
//! longer than [`BIT_THRESHOLD`]. The whole transaction runs with the
//! registry locked so nothing else touches the header mid-frame.

use crate::components::{ComponentContext, Producer, Readings};
use crate::error::{PanelError, Result};
use crate::hardware::HardwareBackend;
use crate::pins::{Lease, PinMode, PinRegistry};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pin role the sensor's data line is bound to.
pub const DATA_ROLE: &str = "data";

/// High pulses longer than this encode a `1`.
pub const BIT_THRESHOLD: Duration = Duration::from_micros(50);

/// Longest a full frame may take to arrive.
const CAPTURE_WINDOW: Duration = Duration::from_millis(10);

/// Response preamble plus 40 data bits.
const MAX_PULSES: usize = 42;

const DEFAULT_RETRIES: u64 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Supported sensor models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhtModel {
    Dht11,
    Dht22,
}

impl DhtModel {
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Dht11 => "dht11",
            Self::Dht22 => "dht22",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Dht11 => "DHT11 temperature (0-50 °C) and humidity (20-80 %) sensor",
            Self::Dht22 => "DHT22 temperature (-40-80 °C) and humidity (0-100 %) sensor",
        }
    }

    /// How long the host holds the line low to request a frame.
    fn start_signal(self) -> Duration {
        match self {
            Self::Dht11 => Duration::from_millis(18),
            Self::Dht22 => Duration::from_micros(1100),
        }
    }

    fn temperature_range(self) -> (f64, f64) {
        match self {
            Self::Dht11 => (0.0, 50.0),
            Self::Dht22 => (-40.0, 80.0),
        }
    }

    fn humidity_range(self) -> (f64, f64) {
        match self {
            Self::Dht11 => (20.0, 80.0),
            Self::Dht22 => (0.0, 100.0),
        }
    }
}

/// A decoded measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Degrees Celsius
    pub temperature: f64,
    /// Relative humidity in percent
    pub humidity: f64,
}

/// Turn the captured high-pulse widths into the five frame bytes.
///
/// Only the last 40 pulses carry data; anything before them is the sensor's
/// response preamble.
pub fn decode_pulses(pulses: &[Duration]) -> Result<[u8; 5]> {
    if pulses.len() < 40 {
        return Err(PanelError::hardware_failure(format!(
            "sensor sent {} of 40 bits",
            pulses.len()
        )));
    }

    let mut bytes = [0u8; 5];
    for (i, width) in pulses[pulses.len() - 40..].iter().enumerate() {
        bytes[i / 8] <<= 1;
        if *width > BIT_THRESHOLD {
            bytes[i / 8] |= 1;
        }
    }
    Ok(bytes)
}

/// Check the checksum and scale the raw frame for `model`.
pub fn parse_frame(model: DhtModel, bytes: [u8; 5]) -> Result<Measurement> {
    let sum = bytes[..4].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != bytes[4] {
        return Err(PanelError::hardware_failure(format!(
            "checksum mismatch: expected {:#04x}, got {:#04x}",
            bytes[4], sum
        )));
    }

    let negative = bytes[2] & 0x80 != 0;
    let (humidity, magnitude) = match model {
        DhtModel::Dht22 => (
            f64::from(u16::from(bytes[0]) << 8 | u16::from(bytes[1])) / 10.0,
            f64::from(u16::from(bytes[2] & 0x7f) << 8 | u16::from(bytes[3])) / 10.0,
        ),
        DhtModel::Dht11 => (
            f64::from(bytes[0]) + f64::from(bytes[1]) / 10.0,
            f64::from(bytes[2] & 0x7f) + f64::from(bytes[3]) / 10.0,
        ),
    };

    Ok(Measurement {
        temperature: if negative { -magnitude } else { magnitude },
        humidity,
    })
}

fn spin(duration: Duration) {
    let until = Instant::now() + duration;
    while Instant::now() < until {
        std::hint::spin_loop();
    }
}

/// Width of every completed high pulse seen within the capture window.
fn measure(hw: &mut dyn HardwareBackend, line: u8) -> Result<Vec<Duration>> {
    let deadline = Instant::now() + CAPTURE_WINDOW;
    let mut pulses = Vec::with_capacity(MAX_PULSES);
    let mut level = hw.read_line(line)?;
    let mut edge = Instant::now();

    while pulses.len() < MAX_PULSES {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let current = hw.read_line(line)?;
        if current != level {
            if level {
                pulses.push(now - edge);
            }
            level = current;
            edge = now;
        }
    }
    Ok(pulses)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// A DHT sensor bound to one data pin.
#[derive(Debug)]
pub struct Dht {
    model: DhtModel,
    name: String,
    registry: PinRegistry,
    lease: Lease,
    retries: u64,
    retry_delay: Duration,
}

impl Dht {
    /// Build the driver and park the data line as an input.
    pub fn build(model: DhtModel, ctx: ComponentContext) -> Result<Self> {
        let lease = ctx.lease(DATA_ROLE)?;
        let retries = ctx.config_u64("retries", DEFAULT_RETRIES)?.max(1);
        let retry_delay = ctx.config_seconds("retry_delay", DEFAULT_RETRY_DELAY)?;

        ctx.registry.configure_owned(lease, PinMode::Input)?;
        info!(
            "{} '{}' initialized on pin {} (retries={})",
            model.type_name(),
            ctx.name,
            lease.pin(),
            retries
        );

        Ok(Self {
            model,
            name: ctx.name,
            registry: ctx.registry,
            lease,
            retries,
            retry_delay,
        })
    }

    fn capture(&self) -> Result<Measurement> {
        let start_signal = self.model.start_signal();
        let pulses = self.registry.with_line(self.lease, |hw, line| {
            hw.configure_line(line, PinMode::Output)?;
            hw.write_line(line, false)?;
            spin(start_signal);
            hw.configure_line(line, PinMode::Input)?;
            measure(hw, line)
        })?;
        parse_frame(self.model, decode_pulses(&pulses)?)
    }

    fn in_range(&self, m: &Measurement) -> bool {
        let (t_min, t_max) = self.model.temperature_range();
        let (h_min, h_max) = self.model.humidity_range();
        (t_min..=t_max).contains(&m.temperature) && (h_min..=h_max).contains(&m.humidity)
    }

    /// Capture with retries, sleeping between failed attempts.
    fn measure_with_retries(&self) -> Result<Measurement> {
        let started = Instant::now();
        let mut last_error = None;

        for attempt in 1..=self.retries {
            match self.capture() {
                Ok(m) => {
                    debug!(
                        "{} '{}': {:.1}°C {:.1}% (attempt {}/{}, {:?})",
                        self.model.type_name(),
                        self.name,
                        m.temperature,
                        m.humidity,
                        attempt,
                        self.retries,
                        started.elapsed()
                    );
                    return Ok(m);
                }
                // Lost the pin: retrying cannot help.
                Err(e @ PanelError::OwnershipConflict { .. }) => return Err(e),
                Err(e) => {
                    debug!("{} '{}' attempt {} failed: {}", self.model.type_name(), self.name, attempt, e);
                    last_error = Some(e);
                }
            }
            if attempt < self.retries {
                std::thread::sleep(self.retry_delay);
            }
        }

        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(PanelError::component_failure(
            &self.name,
            format!("no valid frame after {} attempts: {}", self.retries, reason),
        ))
    }
}

impl Producer for Dht {
    fn read(&self) -> Result<Readings> {
        let m = self.measure_with_retries()?;
        if !self.in_range(&m) {
            return Err(PanelError::component_failure(
                &self.name,
                format!("reading out of range: {:.1}°C {:.1}%", m.temperature, m.humidity),
            ));
        }

        let mut readings = Readings::new();
        readings.insert("temperature".into(), json!(round1(m.temperature)));
        readings.insert("humidity".into(), json!(round1(m.humidity)));
        Ok(readings)
    }

    fn test(&self) -> Result<bool> {
        match self.read() {
            Ok(_) => {
                info!("{} '{}': test passed", self.model.type_name(), self.name);
                Ok(true)
            }
            Err(e @ PanelError::OwnershipConflict { .. }) => Err(e),
            Err(e) => {
                warn!("{} '{}': test failed: {}", self.model.type_name(), self.name, e);
                Ok(false)
            }
        }
    }

    fn schema(&self) -> Value {
        let (t_min, t_max) = self.model.temperature_range();
        let (h_min, h_max) = self.model.humidity_range();
        json!({
            "outputs": {
                "temperature": {"type": "float", "unit": "°C", "range": [t_min, t_max]},
                "humidity": {"type": "float", "unit": "%", "range": [h_min, h_max]},
            },
            "config": {
                "polling": {"type": "float", "unit": "s", "default": 2},
                "retries": {"type": "int", "default": DEFAULT_RETRIES},
                "retry_delay": {"type": "float", "unit": "s", "default": DEFAULT_RETRY_DELAY.as_secs_f64()},
            },
        })
    }
}
