//! Sensors and actuators layered on top of raw pins.
//!
//! A component is either a [`Producer`] (polled for readings on its own task)
//! or a [`Consumer`] (written to on request). Drivers are built by the
//! [`ComponentFactory`] from a [`ComponentSpec`] and only ever touch their
//! pins through the leases they were handed.

pub mod dht;
pub mod led;
pub mod runtime;

pub use runtime::{ComponentMetadata, ComponentReading, ComponentRuntime};

use crate::error::{PanelError, Result};
use crate::pins::{Lease, PinId, PinRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Values produced by a single read, keyed by output name.
pub type Readings = serde_json::Map<String, Value>;

/// Whether a component generates data or accepts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Producer,
    Consumer,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Producer => f.write_str("producer"),
            Self::Consumer => f.write_str("consumer"),
        }
    }
}

/// A sensor or input polled for readings.
///
/// Every method runs on the blocking pool, so implementations may sleep or
/// bit-bang freely.
pub trait Producer: Send + Sync {
    fn read(&self) -> Result<Readings>;

    /// Check the device responds sensibly.
    fn test(&self) -> Result<bool>;

    /// Return the device to a safe state before its pins are released.
    fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    /// Description of the outputs and accepted configuration.
    fn schema(&self) -> Value {
        Value::Null
    }
}

/// An actuator or display driven by explicit writes.
pub trait Consumer: Send + Sync {
    fn write(&self, data: &Value) -> Result<()>;

    fn test(&self) -> Result<bool>;

    fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    /// Description of the accepted inputs and configuration.
    fn schema(&self) -> Value {
        Value::Null
    }
}

/// A built driver of either category.
#[derive(Clone)]
pub enum Driver {
    Producer(Arc<dyn Producer>),
    Consumer(Arc<dyn Consumer>),
}

impl Driver {
    pub fn category(&self) -> Category {
        match self {
            Self::Producer(_) => Category::Producer,
            Self::Consumer(_) => Category::Consumer,
        }
    }

    pub fn schema(&self) -> Value {
        match self {
            Self::Producer(p) => p.schema(),
            Self::Consumer(c) => c.schema(),
        }
    }

    pub fn test(&self) -> Result<bool> {
        match self {
            Self::Producer(p) => p.test(),
            Self::Consumer(c) => c.test(),
        }
    }

    pub fn cleanup(&self) -> Result<()> {
        match self {
            Self::Producer(p) => p.cleanup(),
            Self::Consumer(c) => c.cleanup(),
        }
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Driver::{}", self.category())
    }
}

/// Request to assign a component: type, instance name, role to pin bindings
/// and driver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    #[serde(rename = "type")]
    pub component_type: String,
    pub name: String,
    pub pins: BTreeMap<String, PinId>,
    #[serde(default = "empty_config")]
    pub config: Value,
}

fn empty_config() -> Value {
    Value::Object(serde_json::Map::new())
}

impl ComponentSpec {
    pub fn new(component_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            component_type: component_type.into(),
            name: name.into(),
            pins: BTreeMap::new(),
            config: empty_config(),
        }
    }

    pub fn with_pin(mut self, role: impl Into<String>, pin: PinId) -> Self {
        self.pins.insert(role.into(), pin);
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Bound pins in role order.
    pub fn pin_ids(&self) -> Vec<PinId> {
        self.pins.values().copied().collect()
    }
}

/// Everything a driver builder gets to work with.
#[derive(Debug, Clone)]
pub struct ComponentContext {
    pub name: String,
    pub registry: PinRegistry,
    pub leases: BTreeMap<String, Lease>,
    pub config: Value,
}

impl ComponentContext {
    /// Lease bound to `role`.
    pub fn lease(&self, role: &str) -> Result<Lease> {
        self.leases.get(role).copied().ok_or_else(|| {
            PanelError::component_failure(&self.name, format!("missing '{}' pin", role))
        })
    }

    fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.get(key).filter(|v| !v.is_null())
    }

    pub fn config_u64(&self, key: &str, default: u64) -> Result<u64> {
        match self.config_value(key) {
            None => Ok(default),
            Some(v) => v.as_u64().ok_or_else(|| {
                PanelError::invalid_argument(format!("config '{}' must be a non-negative integer", key))
            }),
        }
    }

    pub fn config_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.config_value(key) {
            None => Ok(default),
            Some(v) => v
                .as_bool()
                .ok_or_else(|| PanelError::invalid_argument(format!("config '{}' must be a boolean", key))),
        }
    }

    /// A duration given in (possibly fractional) seconds.
    pub fn config_seconds(&self, key: &str, default: Duration) -> Result<Duration> {
        config_seconds(&self.config, key, default)
    }
}

pub(crate) fn config_seconds(config: &Value, key: &str, default: Duration) -> Result<Duration> {
    match config.get(key).filter(|v| !v.is_null()) {
        None => Ok(default),
        Some(v) => v
            .as_f64()
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(Duration::from_secs_f64)
            .ok_or_else(|| {
                PanelError::invalid_argument(format!("config '{}' must be a number of seconds", key))
            }),
    }
}

type Builder = Arc<dyn Fn(ComponentContext) -> Result<Driver> + Send + Sync>;

struct FactoryEntry {
    category: Category,
    roles: Vec<String>,
    description: String,
    build: Builder,
}

/// A registered component type, as listed to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentType {
    #[serde(rename = "type")]
    pub name: String,
    pub category: Category,
    pub pins: Vec<String>,
    pub description: String,
    /// Extra definition loaded with [`ComponentFactory::load_definitions`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<Value>,
}

/// Registry of component types by name.
#[derive(Clone, Default)]
pub struct ComponentFactory {
    entries: BTreeMap<String, Arc<FactoryEntry>>,
    definitions: BTreeMap<String, Value>,
}

impl ComponentFactory {
    /// Factory with no types registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the built-in `dht22`, `dht11` and `led` types.
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        for model in [dht::DhtModel::Dht22, dht::DhtModel::Dht11] {
            factory.register(
                model.type_name(),
                Category::Producer,
                &[dht::DATA_ROLE],
                model.description(),
                move |ctx| dht::Dht::build(model, ctx).map(|d| Driver::Producer(Arc::new(d))),
            );
        }
        factory.register(
            "led",
            Category::Consumer,
            &[led::PIN_ROLE],
            "Single LED driven HIGH for on",
            |ctx| led::Led::build(ctx).map(|l| Driver::Consumer(Arc::new(l))),
        );
        factory
    }

    /// Register (or replace) a component type.
    ///
    /// `roles` lists the pin bindings an assignment must provide.
    pub fn register<F>(
        &mut self,
        type_name: impl Into<String>,
        category: Category,
        roles: &[&str],
        description: impl Into<String>,
        build: F,
    ) where
        F: Fn(ComponentContext) -> Result<Driver> + Send + Sync + 'static,
    {
        self.entries.insert(
            type_name.into(),
            Arc::new(FactoryEntry {
                category,
                roles: roles.iter().map(|r| r.to_string()).collect(),
                description: description.into(),
                build: Arc::new(build),
            }),
        );
    }

    pub fn types(&self) -> Vec<ComponentType> {
        self.entries
            .iter()
            .map(|(name, entry)| {
                let definition = self.definitions.get(name);
                let description = definition
                    .and_then(|d| d.get("description"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| entry.description.clone());
                ComponentType {
                    name: name.clone(),
                    category: entry.category,
                    pins: entry.roles.clone(),
                    description,
                    definition: definition.cloned(),
                }
            })
            .collect()
    }

    /// Merge component definitions from a JSON document.
    ///
    /// The document is an object keyed by type name; each value is an object
    /// whose optional `description` overrides the registered one. Definitions
    /// for types without a driver are kept and listed by
    /// [`definition`](Self::definition) only. Returns the number of
    /// definitions read.
    pub fn load_definitions(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PanelError::config_error(format!("cannot read {}: {}", path.display(), e))
        })?;
        let count = self.merge_definitions(serde_json::from_str(&text)?)?;
        info!("Loaded {} component definitions from {}", count, path.display());
        Ok(count)
    }

    /// Merge definitions from an already parsed document.
    pub fn merge_definitions(&mut self, document: Value) -> Result<usize> {
        let Value::Object(definitions) = document else {
            return Err(PanelError::config_error(
                "component definitions must be an object keyed by type",
            ));
        };
        if let Some((name, _)) = definitions.iter().find(|(_, d)| !d.is_object()) {
            return Err(PanelError::config_error(format!(
                "definition of '{}' must be an object",
                name
            )));
        }

        let count = definitions.len();
        self.definitions.extend(definitions);
        Ok(count)
    }

    /// Loaded definition of `type_name`, if any.
    pub fn definition(&self, type_name: &str) -> Option<&Value> {
        self.definitions.get(type_name)
    }

    fn entry(&self, type_name: &str) -> Result<&FactoryEntry> {
        self.entries
            .get(type_name)
            .map(|e| e.as_ref())
            .ok_or_else(|| PanelError::UnknownComponent(type_name.to_string()))
    }

    pub fn category(&self, type_name: &str) -> Result<Category> {
        Ok(self.entry(type_name)?.category)
    }

    /// Check a spec against its type before any pin is touched.
    pub fn validate(&self, spec: &ComponentSpec) -> Result<()> {
        if spec.name.trim().is_empty() {
            return Err(PanelError::invalid_argument("component name must not be empty"));
        }
        let entry = self.entry(&spec.component_type)?;

        for role in &entry.roles {
            if !spec.pins.contains_key(role) {
                return Err(PanelError::invalid_argument(format!(
                    "{} requires a '{}' pin",
                    spec.component_type, role
                )));
            }
        }
        if let Some(extra) = spec.pins.keys().find(|r| !entry.roles.contains(*r)) {
            return Err(PanelError::invalid_argument(format!(
                "{} has no '{}' pin",
                spec.component_type, extra
            )));
        }

        let mut pins = spec.pin_ids();
        pins.sort_unstable();
        if pins.windows(2).any(|w| w[0] == w[1]) {
            return Err(PanelError::invalid_argument("a pin may only be bound to one role"));
        }
        if !spec.config.is_object() {
            return Err(PanelError::invalid_argument("component config must be an object"));
        }
        Ok(())
    }

    /// Build the driver for `spec` over the granted leases.
    pub fn build(&self, spec: &ComponentSpec, ctx: ComponentContext) -> Result<Driver> {
        let entry = self.entry(&spec.component_type)?;
        let driver = (entry.build)(ctx)?;
        if driver.category() != entry.category {
            return Err(PanelError::component_failure(
                &spec.name,
                format!("driver is a {}, type is registered as {}", driver.category(), entry.category),
            ));
        }
        Ok(driver)
    }
}

impl fmt::Debug for ComponentFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentFactory")
            .field("types", &self.entries.keys().collect::<Vec<_>>())
            .field("definitions", &self.definitions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pin(n: u8) -> PinId {
        PinId::new(n).unwrap()
    }

    #[test]
    fn test_builtin_types() {
        let factory = ComponentFactory::with_builtins();
        let names: Vec<String> = factory.types().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["dht11", "dht22", "led"]);
        assert_eq!(factory.category("dht22").unwrap(), Category::Producer);
        assert_eq!(factory.category("led").unwrap(), Category::Consumer);
        assert!(matches!(
            factory.category("bme280"),
            Err(PanelError::UnknownComponent(_))
        ));
    }

    #[test]
    fn test_validation() {
        let factory = ComponentFactory::with_builtins();

        let ok = ComponentSpec::new("dht22", "porch").with_pin("data", pin(7));
        assert!(factory.validate(&ok).is_ok());

        let missing = ComponentSpec::new("dht22", "porch");
        assert!(matches!(factory.validate(&missing), Err(PanelError::InvalidArgument(_))));

        let extra = ok.clone().with_pin("clock", pin(11));
        assert!(matches!(factory.validate(&extra), Err(PanelError::InvalidArgument(_))));

        let unnamed = ComponentSpec::new("led", " ").with_pin("pin", pin(7));
        assert!(factory.validate(&unnamed).is_err());

        let unknown = ComponentSpec::new("servo", "arm").with_pin("pwm", pin(12));
        assert!(matches!(factory.validate(&unknown), Err(PanelError::UnknownComponent(_))));

        let bad_config = ok.with_config(json!([1, 2]));
        assert!(factory.validate(&bad_config).is_err());
    }

    #[test]
    fn test_spec_deserializes_from_api_shape() {
        let spec: ComponentSpec = serde_json::from_value(json!({
            "type": "dht22",
            "name": "porch",
            "pins": {"data": 7},
        }))
        .unwrap();
        assert_eq!(spec.pins["data"], pin(7));
        assert_eq!(spec.config, json!({}));

        assert!(serde_json::from_value::<ComponentSpec>(json!({
            "type": "dht22",
            "name": "porch",
            "pins": {"data": 4},
        }))
        .is_err());
    }

    #[test]
    fn test_load_definitions() {
        let path = std::env::temp_dir().join(format!("pinboard-defs-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            json!({
                "dht22": {"description": "Porch sensor", "manufacturer": "Aosong"},
                "bme280": {"description": "Pressure sensor", "pins": ["sda", "scl"]},
            })
            .to_string(),
        )
        .unwrap();

        let mut factory = ComponentFactory::with_builtins();
        assert_eq!(factory.load_definitions(&path).unwrap(), 2);
        std::fs::remove_file(&path).unwrap();

        let types = factory.types();
        let dht22 = types.iter().find(|t| t.name == "dht22").unwrap();
        assert_eq!(dht22.description, "Porch sensor");
        assert_eq!(dht22.definition.as_ref().unwrap()["manufacturer"], "Aosong");

        let led = types.iter().find(|t| t.name == "led").unwrap();
        assert!(led.definition.is_none());

        assert!(types.iter().all(|t| t.name != "bme280"));
        assert_eq!(factory.definition("bme280").unwrap()["pins"][0], "sda");
    }

    #[test]
    fn test_rejects_bad_definitions() {
        let mut factory = ComponentFactory::new();
        assert!(matches!(
            factory.merge_definitions(json!([1, 2])),
            Err(PanelError::Config(_))
        ));
        assert!(matches!(
            factory.merge_definitions(json!({"led": "bright"})),
            Err(PanelError::Config(_))
        ));
        assert!(matches!(
            factory.load_definitions("/nonexistent/pinboard-defs.json"),
            Err(PanelError::Config(_))
        ));
    }

    #[test]
    fn test_config_seconds() {
        let config = json!({"polling": 0.5, "bad": "x", "none": null});
        assert_eq!(
            config_seconds(&config, "polling", Duration::from_secs(2)).unwrap(),
            Duration::from_millis(500)
        );
        assert_eq!(
            config_seconds(&config, "none", Duration::from_secs(2)).unwrap(),
            Duration::from_secs(2)
        );
        assert!(config_seconds(&config, "bad", Duration::ZERO).is_err());
    }
}
