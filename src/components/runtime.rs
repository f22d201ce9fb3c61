//! Live component instances: producer pollers, the reading cache and
//! consumer writes.

use crate::components::{
    config_seconds, Category, ComponentContext, ComponentFactory, ComponentSpec, Driver, Producer,
    Readings,
};
use crate::error::{PanelError, Result};
use crate::pins::{Lease, PinId, PinRegistry};
use crate::tasks::TaskHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Shortest producer polling interval accepted.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Latest result of polling a producer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ComponentReading {
    /// Values of the last successful read
    pub values: Option<Readings>,
    /// When the last read finished, successful or not
    pub timestamp: Option<DateTime<Utc>>,
    /// Error of the last read; cleared by the next success
    pub error: Option<String>,
    pub attempts: u64,
    pub failures: u64,
}

/// Description of an assigned component.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub component_type: String,
    pub category: Category,
    pub pins: BTreeMap<String, PinId>,
    pub schema: Value,
    pub config: Value,
    pub tested: bool,
    /// Producer polling interval in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polling: Option<f64>,
}

struct Instance {
    spec: ComponentSpec,
    driver: Driver,
    leases: Vec<Lease>,
    poller: Option<TaskHandle>,
    interval: Option<Duration>,
    tested: bool,
}

impl Instance {
    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            name: self.spec.name.clone(),
            component_type: self.spec.component_type.clone(),
            category: self.driver.category(),
            pins: self.spec.pins.clone(),
            schema: self.driver.schema(),
            config: self.spec.config.clone(),
            tested: self.tested,
            polling: self.interval.map(|d| d.as_secs_f64()),
        }
    }
}

type ReadingCache = Arc<Mutex<BTreeMap<String, ComponentReading>>>;

fn lock_cache(cache: &Mutex<BTreeMap<String, ComponentReading>>) -> MutexGuard<'_, BTreeMap<String, ComponentReading>> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns every assigned component.
///
/// The runtime does not arbitrate pins: callers claim the pins and hand over
/// the leases, and get the pins back from [`remove`](Self::remove).
pub struct ComponentRuntime {
    registry: PinRegistry,
    factory: ComponentFactory,
    default_poll: Duration,
    instances: tokio::sync::Mutex<BTreeMap<String, Instance>>,
    readings: ReadingCache,
}

impl ComponentRuntime {
    pub fn new(registry: PinRegistry, factory: ComponentFactory, default_poll: Duration) -> Self {
        Self {
            registry,
            factory,
            default_poll,
            instances: tokio::sync::Mutex::new(BTreeMap::new()),
            readings: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn factory(&self) -> &ComponentFactory {
        &self.factory
    }

    /// Check `spec` and its producer polling interval without touching any
    /// pin.
    pub fn validate(&self, spec: &ComponentSpec) -> Result<()> {
        self.factory.validate(spec)?;
        if self.factory.category(&spec.component_type)? == Category::Producer {
            self.poll_interval(spec)?;
        }
        Ok(())
    }

    fn poll_interval(&self, spec: &ComponentSpec) -> Result<Duration> {
        let interval = config_seconds(&spec.config, "polling", self.default_poll)?;
        if interval < MIN_POLL_INTERVAL {
            return Err(PanelError::invalid_argument(format!(
                "polling interval must be at least {}ms",
                MIN_POLL_INTERVAL.as_millis()
            )));
        }
        Ok(interval)
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.instances.lock().await.contains_key(name)
    }

    /// Build the driver over `leases` and start polling if it is a producer.
    ///
    /// `leases` maps each role of the spec to a lease on its pin. On error
    /// the leases are left with the caller.
    pub async fn start(&self, spec: ComponentSpec, leases: BTreeMap<String, Lease>) -> Result<ComponentMetadata> {
        self.validate(&spec)?;
        let mut instances = self.instances.lock().await;
        if instances.contains_key(&spec.name) {
            return Err(PanelError::invalid_argument(format!(
                "component '{}' already exists",
                spec.name
            )));
        }

        let ctx = ComponentContext {
            name: spec.name.clone(),
            registry: self.registry.clone(),
            leases: leases.clone(),
            config: spec.config.clone(),
        };
        let factory = self.factory.clone();
        let build_spec = spec.clone();
        let driver = tokio::task::spawn_blocking(move || factory.build(&build_spec, ctx))
            .await
            .map_err(|e| PanelError::component_failure(&spec.name, format!("build task failed: {}", e)))??;

        let (poller, interval) = match &driver {
            Driver::Producer(producer) => {
                let interval = self.poll_interval(&spec)?;
                lock_cache(&self.readings).insert(spec.name.clone(), ComponentReading::default());
                let handle = TaskHandle::spawn(format!("poll-{}", spec.name), {
                    let name = spec.name.clone();
                    let producer = Arc::clone(producer);
                    let cache = Arc::clone(&self.readings);
                    move |stop| poll(name, producer, interval, cache, stop)
                });
                (Some(handle), Some(interval))
            }
            Driver::Consumer(_) => (None, None),
        };

        let instance = Instance {
            spec,
            driver,
            leases: leases.into_values().collect(),
            poller,
            interval,
            tested: false,
        };
        let metadata = instance.metadata();
        info!(
            "Assigned {} '{}' on pins {:?}",
            metadata.component_type,
            metadata.name,
            instance.spec.pin_ids().iter().map(|p| p.physical()).collect::<Vec<_>>()
        );
        instances.insert(metadata.name.clone(), instance);
        Ok(metadata)
    }

    /// Stop the component, run its cleanup and release its pins.
    ///
    /// Returns the pins that were released. Cleanup failures are logged.
    pub async fn remove(&self, name: &str) -> Result<Vec<PinId>> {
        let instance = self
            .instances
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| PanelError::ComponentNotFound(name.to_string()))?;
        Ok(self.teardown(instance).await)
    }

    /// Remove every component. Returns every released pin.
    pub async fn remove_all(&self) -> Vec<PinId> {
        let instances = std::mem::take(&mut *self.instances.lock().await);
        let mut pins = Vec::new();
        for (_, instance) in instances {
            pins.extend(self.teardown(instance).await);
        }
        pins
    }

    async fn teardown(&self, instance: Instance) -> Vec<PinId> {
        let name = instance.spec.name.clone();
        if let Some(poller) = instance.poller {
            poller.stop().await;
        }

        let driver = instance.driver.clone();
        match tokio::task::spawn_blocking(move || driver.cleanup()).await {
            Ok(Ok(())) => {}
            Ok(Err(PanelError::OwnershipConflict { .. })) => {
                debug!("Component '{}' no longer holds its pins, skipped cleanup", name)
            }
            Ok(Err(e)) => warn!("Cleanup of component '{}' failed: {}", name, e),
            Err(e) => warn!("Cleanup task of component '{}' failed: {}", name, e),
        }

        for lease in &instance.leases {
            self.registry.release(*lease);
        }
        lock_cache(&self.readings).remove(&name);
        info!("Removed component '{}'", name);
        instance.leases.iter().map(|l| l.pin()).collect()
    }

    /// Latest cached reading of a producer.
    pub async fn data(&self, name: &str) -> Result<ComponentReading> {
        let instances = self.instances.lock().await;
        let instance = instances
            .get(name)
            .ok_or_else(|| PanelError::ComponentNotFound(name.to_string()))?;
        if instance.driver.category() != Category::Producer {
            return Err(PanelError::invalid_argument(format!(
                "component '{}' is a consumer and has no readings",
                name
            )));
        }
        Ok(lock_cache(&self.readings).get(name).cloned().unwrap_or_default())
    }

    /// Send `data` to a consumer and wait for the write to finish.
    pub async fn write(&self, name: &str, data: Value) -> Result<()> {
        let consumer = {
            let instances = self.instances.lock().await;
            let instance = instances
                .get(name)
                .ok_or_else(|| PanelError::ComponentNotFound(name.to_string()))?;
            match &instance.driver {
                Driver::Consumer(c) => Arc::clone(c),
                Driver::Producer(_) => {
                    return Err(PanelError::invalid_argument(format!(
                        "component '{}' is a producer and cannot be written",
                        name
                    )))
                }
            }
        };

        tokio::task::spawn_blocking(move || consumer.write(&data))
            .await
            .map_err(|e| PanelError::component_failure(name, format!("write task failed: {}", e)))?
    }

    /// Run the component's self test. A pass marks it as tested.
    pub async fn test(&self, name: &str) -> Result<bool> {
        let driver = self
            .instances
            .lock()
            .await
            .get(name)
            .map(|i| i.driver.clone())
            .ok_or_else(|| PanelError::ComponentNotFound(name.to_string()))?;

        let passed = tokio::task::spawn_blocking(move || driver.test())
            .await
            .map_err(|e| PanelError::component_failure(name, format!("test task failed: {}", e)))??;

        if passed {
            if let Some(instance) = self.instances.lock().await.get_mut(name) {
                instance.tested = true;
            }
        }
        info!("Component '{}' test {}", name, if passed { "passed" } else { "failed" });
        Ok(passed)
    }

    pub async fn metadata(&self, name: &str) -> Result<ComponentMetadata> {
        self.instances
            .lock()
            .await
            .get(name)
            .map(Instance::metadata)
            .ok_or_else(|| PanelError::ComponentNotFound(name.to_string()))
    }

    pub async fn list(&self) -> Vec<ComponentMetadata> {
        self.instances.lock().await.values().map(Instance::metadata).collect()
    }

    /// Name of the component bound to `pin`, if any.
    pub async fn find_by_pin(&self, pin: PinId) -> Option<String> {
        self.instances
            .lock()
            .await
            .values()
            .find(|i| i.spec.pins.values().any(|p| *p == pin))
            .map(|i| i.spec.name.clone())
    }

    /// Specs of every assigned component, in name order.
    pub async fn specs(&self) -> Vec<ComponentSpec> {
        self.instances
            .lock()
            .await
            .values()
            .map(|i| i.spec.clone())
            .collect()
    }
}

impl std::fmt::Debug for ComponentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRuntime")
            .field("factory", &self.factory)
            .field("default_poll", &self.default_poll)
            .finish()
    }
}

fn record(cache: &Mutex<BTreeMap<String, ComponentReading>>, name: &str, result: &Result<Readings>) {
    let mut cache = lock_cache(cache);
    let entry = cache.entry(name.to_string()).or_default();
    entry.attempts += 1;
    entry.timestamp = Some(Utc::now());
    match result {
        Ok(values) => {
            entry.values = Some(values.clone());
            entry.error = None;
        }
        Err(e) => {
            entry.failures += 1;
            entry.error = Some(e.to_string());
        }
    }
}

async fn poll(
    name: String,
    producer: Arc<dyn Producer>,
    interval: Duration,
    cache: ReadingCache,
    mut stop: oneshot::Receiver<()>,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = ticker.tick() => {}
        }

        let reader = Arc::clone(&producer);
        let read = tokio::task::spawn_blocking(move || reader.read());
        let result = tokio::select! {
            biased;
            _ = &mut stop => break,
            joined = read => joined.unwrap_or_else(|e| {
                Err(PanelError::component_failure(&name, format!("read task failed: {}", e)))
            }),
        };

        match &result {
            Ok(values) => debug!("Component '{}' read {:?}", name, values),
            Err(PanelError::OwnershipConflict { .. }) => {
                debug!("Component '{}' lost its pins, stopping poller", name);
                record(&cache, &name, &result);
                break;
            }
            Err(e) => warn!("Component '{}' read failed: {}", name, e),
        }
        record(&cache, &name, &result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{NoopSwitch, SimulatedHardware};
    use crate::pins::Owner;
    use serde_json::json;

    fn runtime() -> (ComponentRuntime, PinRegistry) {
        let registry = PinRegistry::new(Box::new(SimulatedHardware::new()), Arc::new(NoopSwitch));
        let runtime = ComponentRuntime::new(
            registry.clone(),
            ComponentFactory::with_builtins(),
            Duration::from_secs(2),
        );
        (runtime, registry)
    }

    fn claim(registry: &PinRegistry, name: &str, role: &str, pin: u8) -> BTreeMap<String, Lease> {
        let lease = registry
            .claim(PinId::new(pin).unwrap(), Owner::Component { name: name.into() })
            .unwrap();
        BTreeMap::from([(role.to_string(), lease)])
    }

    #[tokio::test]
    async fn test_consumer_lifecycle() {
        let (runtime, registry) = runtime();
        let spec = ComponentSpec::new("led", "status").with_pin("pin", PinId::new(13).unwrap());
        let leases = claim(&registry, "status", "pin", 13);

        let meta = runtime.start(spec, leases).await.unwrap();
        assert_eq!(meta.category, Category::Consumer);
        assert!(meta.polling.is_none());

        runtime.write("status", json!({"state": true})).await.unwrap();
        assert!(registry.record(PinId::new(13).unwrap()).state);
        assert!(matches!(
            runtime.data("status").await,
            Err(PanelError::InvalidArgument(_))
        ));
        assert_eq!(runtime.find_by_pin(PinId::new(13).unwrap()).await.as_deref(), Some("status"));

        let pins = runtime.remove("status").await.unwrap();
        assert_eq!(pins, vec![PinId::new(13).unwrap()]);
        assert!(registry.owner(PinId::new(13).unwrap()).is_none());
        assert!(!registry.record(PinId::new(13).unwrap()).state);
        assert!(matches!(
            runtime.remove("status").await,
            Err(PanelError::ComponentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_bad_polling() {
        let (runtime, _) = runtime();
        let spec = ComponentSpec::new("dht22", "porch")
            .with_pin("data", PinId::new(7).unwrap())
            .with_config(json!({"polling": 0.001}));
        assert!(matches!(runtime.validate(&spec), Err(PanelError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_write_to_unknown_component() {
        let (runtime, _) = runtime();
        assert!(matches!(
            runtime.write("ghost", json!({})).await,
            Err(PanelError::ComponentNotFound(_))
        ));
        assert!(runtime.list().await.is_empty());
    }
}
