//! Single LED actuator.

use crate::components::{ComponentContext, Consumer};
use crate::error::{PanelError, Result};
use crate::pins::{Lease, PinMode, PinRegistry};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

/// Pin role the LED is wired to.
pub const PIN_ROLE: &str = "pin";

const BLINK: Duration = Duration::from_millis(200);

/// An LED on one output pin.
///
/// With `active_low` set in the config the LED is lit by driving the pin LOW.
#[derive(Debug)]
pub struct Led {
    name: String,
    registry: PinRegistry,
    lease: Lease,
    active_low: bool,
}

impl Led {
    /// Build the driver and switch the LED off.
    pub fn build(ctx: ComponentContext) -> Result<Self> {
        let lease = ctx.lease(PIN_ROLE)?;
        let active_low = ctx.config_bool("active_low", false)?;

        ctx.registry.configure_owned(lease, PinMode::Output)?;
        let led = Self {
            name: ctx.name,
            registry: ctx.registry,
            lease,
            active_low,
        };
        led.set(false)?;
        info!("LED '{}' initialized on pin {}", led.name, lease.pin());
        Ok(led)
    }

    fn set(&self, on: bool) -> Result<()> {
        self.registry.write_owned(self.lease, on != self.active_low)
    }

    fn parse_state(&self, data: &Value) -> Result<bool> {
        match data.get("state") {
            Some(Value::Bool(on)) => Ok(*on),
            Some(Value::Number(n)) => match n.as_u64() {
                Some(0) => Ok(false),
                Some(1) => Ok(true),
                _ => Err(PanelError::invalid_argument("state must be 0 or 1")),
            },
            _ => Err(PanelError::invalid_argument(format!(
                "LED '{}' expects {{\"state\": bool}}",
                self.name
            ))),
        }
    }
}

impl Consumer for Led {
    fn write(&self, data: &Value) -> Result<()> {
        let on = self.parse_state(data)?;
        self.set(on)
    }

    fn test(&self) -> Result<bool> {
        self.set(true)?;
        std::thread::sleep(BLINK);
        self.set(false)?;
        Ok(true)
    }

    fn cleanup(&self) -> Result<()> {
        self.set(false)
    }

    fn schema(&self) -> Value {
        json!({
            "inputs": {
                "state": {"type": "bool"},
            },
            "config": {
                "active_low": {"type": "bool", "default": false},
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{NoopSwitch, SimulatedHardware};
    use crate::pins::{Owner, PinId};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn led(config: Value) -> (Led, PinRegistry, crate::hardware::SimProbe) {
        let hw = SimulatedHardware::new();
        let probe = hw.probe();
        let registry = PinRegistry::new(Box::new(hw), Arc::new(NoopSwitch));
        let pin = PinId::new(11).unwrap();
        let lease = registry
            .claim(pin, Owner::Component { name: "status".into() })
            .unwrap();

        let ctx = ComponentContext {
            name: "status".into(),
            registry: registry.clone(),
            leases: BTreeMap::from([(PIN_ROLE.to_string(), lease)]),
            config,
        };
        (Led::build(ctx).unwrap(), registry, probe)
    }

    #[test]
    fn test_write_states() {
        let (led, _, probe) = led(json!({}));
        assert_eq!(probe.level(17), Some(false));

        led.write(&json!({"state": true})).unwrap();
        assert_eq!(probe.level(17), Some(true));
        led.write(&json!({"state": 0})).unwrap();
        assert_eq!(probe.level(17), Some(false));

        assert!(matches!(
            led.write(&json!({"state": "on"})),
            Err(PanelError::InvalidArgument(_))
        ));
        assert!(led.write(&json!({})).is_err());
    }

    #[test]
    fn test_active_low() {
        let (led, _, probe) = led(json!({"active_low": true}));
        assert_eq!(probe.level(17), Some(true));
        led.write(&json!({"state": true})).unwrap();
        assert_eq!(probe.level(17), Some(false));
        led.cleanup().unwrap();
        assert_eq!(probe.level(17), Some(true));
    }

    #[test]
    fn test_revoked_lease_stops_writes() {
        let (led, registry, _) = led(json!({}));
        registry.revoke(PinId::new(11).unwrap());
        assert!(matches!(
            led.write(&json!({"state": true})),
            Err(PanelError::OwnershipConflict { .. })
        ));
    }
}
