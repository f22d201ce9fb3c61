use pinboard::components::ComponentContext;
use pinboard::hardware::{NoopSwitch, SimProbe};
use pinboard::{
    Category, ComponentFactory, ComponentSpec, Driver, Owner, Panel, PanelError, PanelSettings,
    PeripheralMode, PinId, PinMode, PinRegistry, Producer, Readings, SimulatedHardware, TimeSource,
};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

struct FixedTime(u32);

impl TimeSource for FixedTime {
    fn second_of_minute(&self) -> u32 {
        self.0
    }
}

fn pin(physical: u8) -> PinId {
    PinId::new(physical).unwrap()
}

fn simulated() -> (PinRegistry, SimProbe) {
    let hardware = SimulatedHardware::new();
    let probe = hardware.probe();
    let registry = PinRegistry::new(Box::new(hardware), Arc::new(NoopSwitch));
    (registry, probe)
}

fn panel() -> (Panel, SimProbe) {
    let (registry, probe) = simulated();
    (Panel::new(registry, PanelSettings::default()), probe)
}

fn panel_with(factory: ComponentFactory, second: u32) -> Panel {
    let (registry, _) = simulated();
    Panel::from_parts(
        registry,
        PanelSettings::default(),
        factory,
        Arc::new(FixedTime(second)),
    )
}

/// Poll `check` until it holds or `timeout` passes.
async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}

/// Producer that fails on one chosen attempt and counts reads.
struct Flaky {
    reads: AtomicU64,
    fail_on: u64,
}

impl Producer for Flaky {
    fn read(&self) -> pinboard::Result<Readings> {
        let attempt = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == self.fail_on {
            return Err(PanelError::component_failure("flaky", "no response"));
        }
        let mut values = Readings::new();
        values.insert("count".to_string(), json!(attempt));
        Ok(values)
    }

    fn test(&self) -> pinboard::Result<bool> {
        Ok(true)
    }
}

fn flaky_factory(fail_on: u64) -> ComponentFactory {
    let mut factory = ComponentFactory::with_builtins();
    factory.register(
        "flaky",
        Category::Producer,
        &["data"],
        "Counts reads, fails once",
        move |ctx: ComponentContext| {
            ctx.lease("data")?;
            Ok(Driver::Producer(Arc::new(Flaky {
                reads: AtomicU64::new(0),
                fail_on,
            })))
        },
    );
    factory
}

#[tokio::test(start_paused = true)]
async fn test_flash_toggles_once_per_period() {
    let (panel, probe) = panel();
    let led = pin(7);
    let bcm = led.bcm();

    panel
        .start_flash(led, Some(Duration::from_millis(100)))
        .await
        .unwrap();
    let baseline = probe.writes(bcm);
    assert!(panel.snapshot().get(led).unwrap().flashing);

    tokio::time::sleep(Duration::from_millis(1050)).await;
    assert_eq!(probe.writes(bcm) - baseline, 10);
    assert_eq!(probe.level(bcm), Some(false));

    panel.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_restarting_a_flash_replaces_the_old_task() {
    let (panel, probe) = panel();
    let led = pin(15);
    let bcm = led.bcm();

    panel
        .start_flash(led, Some(Duration::from_millis(100)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    panel
        .start_flash(led, Some(Duration::from_millis(100)))
        .await
        .unwrap();
    let baseline = probe.writes(bcm);

    tokio::time::sleep(Duration::from_millis(1050)).await;
    assert_eq!(probe.writes(bcm) - baseline, 10);
    assert_eq!(
        panel.registry().owner(led),
        Some(Owner::Flash { period_ms: 100 })
    );

    panel.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stopping_a_flash_freezes_the_pin() {
    let (panel, probe) = panel();
    let led = pin(11);
    let bcm = led.bcm();

    panel
        .start_flash(led, Some(Duration::from_millis(100)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(panel.stop_flash(led).await);

    let writes = probe.writes(bcm);
    let level = probe.level(bcm);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(probe.writes(bcm), writes);
    assert_eq!(probe.level(bcm), level);

    let record = panel.snapshot().get(led).cloned().unwrap();
    assert!(!record.flashing);
    assert!(record.owner.is_none());
    assert!(!panel.stop_flash(led).await);
}

#[tokio::test]
async fn test_clock_renders_current_second() {
    let panel = panel_with(ComponentFactory::with_builtins(), 37);
    assert_ok!(panel.enable_clock().await);
    assert!(panel.clock_enabled().await);

    let snapshot = panel.snapshot();
    let high: Vec<u8> = [11, 13, 15, 16, 18, 22, 37]
        .into_iter()
        .filter(|p| snapshot.get(pin(*p)).unwrap().state)
        .collect();
    assert_eq!(high, vec![11, 13, 16, 18, 22]);
    assert_eq!(snapshot.owned_by(|o| *o == Owner::Clock).len(), 7);

    assert!(panel.disable_clock().await);
    assert!(panel.snapshot().owned_by(|o| *o == Owner::Clock).is_empty());
    panel.shutdown().await;
}

#[tokio::test]
async fn test_manual_write_disables_whole_clock() {
    let panel = panel_with(ComponentFactory::with_builtins(), 5);
    assert_ok!(panel.enable_clock().await);

    panel.set_state(pin(16), false).await.unwrap();
    assert!(!panel.clock_enabled().await);

    let snapshot = panel.snapshot();
    assert!(snapshot.owned_by(|o| *o == Owner::Clock).is_empty());
    assert!(!snapshot.get(pin(16)).unwrap().state);
    panel.shutdown().await;
}

#[tokio::test]
async fn test_clock_evicts_flashing_pin() {
    let panel = panel_with(ComponentFactory::with_builtins(), 0);
    panel.start_flash(pin(13), None).await.unwrap();

    assert_ok!(panel.enable_clock().await);
    assert_eq!(panel.registry().owner(pin(13)), Some(Owner::Clock));
    assert!(!panel.snapshot().get(pin(13)).unwrap().flashing);
    panel.shutdown().await;
}

#[tokio::test]
async fn test_clock_evicts_component() {
    let panel = panel_with(ComponentFactory::with_builtins(), 1);
    let spec = ComponentSpec::new("led", "lamp").with_pin("pin", pin(16));
    panel.assign_component(spec).await.unwrap();

    assert_ok!(panel.enable_clock().await);
    assert!(matches!(
        panel.component("lamp").await,
        Err(PanelError::ComponentNotFound(_))
    ));
    assert!(panel.component_on(pin(16)).await.is_none());
    assert_eq!(panel.registry().owner(pin(16)), Some(Owner::Clock));

    let snapshot = panel.snapshot();
    let high: Vec<u8> = [11, 13, 15, 16, 18, 22, 37]
        .into_iter()
        .filter(|p| snapshot.get(pin(*p)).unwrap().state)
        .collect();
    assert_eq!(high, vec![16]);
    panel.shutdown().await;
}

#[tokio::test]
async fn test_component_takes_over_flashing_pin() {
    let (panel, _) = panel();
    let target = pin(7);
    panel
        .start_flash(target, Some(Duration::from_millis(50)))
        .await
        .unwrap();

    let spec = ComponentSpec::new("led", "status").with_pin("pin", target);
    let metadata = panel.assign_component(spec).await.unwrap();
    assert_eq!(metadata.category, Category::Consumer);

    let record = panel.snapshot().get(target).cloned().unwrap();
    assert!(!record.flashing);
    assert_eq!(
        record.owner,
        Some(Owner::Component {
            name: "status".to_string()
        })
    );

    panel
        .write_component("status", json!({"state": true}))
        .await
        .unwrap();
    assert!(panel.snapshot().get(target).unwrap().state);

    panel.remove_component("status").await.unwrap();
    let record = panel.snapshot().get(target).cloned().unwrap();
    assert!(record.owner.is_none());
    assert_eq!(record.mode, PinMode::Output);
    assert!(!record.state);
    panel.shutdown().await;
}

#[tokio::test]
async fn test_manual_write_removes_component() {
    let (panel, _) = panel();
    let spec = ComponentSpec::new("led", "lamp").with_pin("pin", pin(29));
    panel.assign_component(spec).await.unwrap();

    panel.set_state(pin(29), true).await.unwrap();
    assert!(matches!(
        panel.component("lamp").await,
        Err(PanelError::ComponentNotFound(_))
    ));
    assert!(panel.snapshot().get(pin(29)).unwrap().state);
    panel.shutdown().await;
}

#[tokio::test]
async fn test_failed_read_is_cached_and_polling_continues() {
    let panel = panel_with(flaky_factory(2), 0);
    let spec = ComponentSpec::new("flaky", "sensor")
        .with_pin("data", pin(7))
        .with_config(json!({"polling": 0.02}));
    let metadata = panel.assign_component(spec).await.unwrap();
    assert_eq!(metadata.polling, Some(0.02));

    let panel = &panel;
    let recovered = wait_until(Duration::from_secs(5), || async move {
        panel
            .component_data("sensor")
            .await
            .is_ok_and(|r| r.attempts >= 4 && r.error.is_none())
    })
    .await;
    assert!(recovered, "polling should continue after a failed read");

    let reading = panel.component_data("sensor").await.unwrap();
    assert_eq!(reading.failures, 1);
    assert!(reading.values.unwrap()["count"].as_u64().unwrap() >= 3);

    assert!(panel.test_component("sensor").await.unwrap());
    panel.shutdown().await;
}

#[tokio::test]
async fn test_unknown_component_type_is_rejected() {
    let (panel, _) = panel();
    let spec = ComponentSpec::new("servo", "arm").with_pin("pin", pin(7));
    assert!(matches!(
        panel.assign_component(spec).await,
        Err(PanelError::UnknownComponent(_))
    ));
    assert!(panel.registry().owner(pin(7)).is_none());
}

#[tokio::test]
async fn test_peripheral_pins_refuse_gpio_writes() {
    let (panel, _) = panel();
    assert!(matches!(
        panel.set_peripheral(pin(37), PeripheralMode::Pwm).await,
        Err(PanelError::UnsupportedMode { pin: 37, .. })
    ));

    let moved = panel
        .set_peripheral(pin(3), PeripheralMode::I2c)
        .await
        .unwrap();
    assert_eq!(moved, vec![pin(3), pin(5)]);

    assert!(matches!(
        panel.set_state(pin(5), true).await,
        Err(PanelError::UnsupportedMode { pin: 5, .. })
    ));
    assert_err!(panel.start_flash(pin(3), None).await);

    panel
        .set_peripheral(pin(5), PeripheralMode::Gpio)
        .await
        .unwrap();
    panel.set_state(pin(5), true).await.unwrap();
}

#[tokio::test]
async fn test_input_pins_read_live_levels() {
    let (panel, probe) = panel();
    let button = pin(40);
    panel.set_mode(button, PinMode::Input).await.unwrap();

    probe.set_input(button.bcm(), true);
    assert!(panel.read_pin(button).unwrap());
    assert!(panel.sample().get(button).unwrap().state);

    assert!(matches!(
        panel.set_state(button, true).await,
        Err(PanelError::UnsupportedMode { .. })
    ));
}

#[tokio::test]
async fn test_layout_round_trip_is_stable() {
    let (panel, _) = panel();
    assert_ok!(panel.set_state(pin(7), true).await);
    panel
        .start_flash(pin(11), Some(Duration::from_millis(400)))
        .await
        .unwrap();
    panel
        .set_peripheral(pin(3), PeripheralMode::I2c)
        .await
        .unwrap();
    panel
        .assign_component(ComponentSpec::new("led", "status").with_pin("pin", pin(13)))
        .await
        .unwrap();

    let path = std::env::temp_dir().join(format!("pinboard-{}.json", uuid::Uuid::new_v4()));
    let saved = panel.save_layout(&path).await.unwrap();
    assert_eq!(saved.components.len(), 1);
    assert!(saved.pins.iter().all(|p| p.pin != pin(13)));

    let report = panel.load_layout(&path).await.unwrap();
    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(report.components, 1);

    let reloaded = panel.save_layout(&path).await.unwrap();
    assert_eq!(saved, reloaded);
    assert!(panel.snapshot().get(pin(11)).unwrap().flashing);

    tokio::fs::remove_file(&path).await.unwrap();
    panel.shutdown().await;
}

#[tokio::test]
async fn test_missing_layout_file_is_a_config_error() {
    let (panel, _) = panel();
    let path = std::env::temp_dir().join(format!("pinboard-missing-{}.json", uuid::Uuid::new_v4()));
    assert!(matches!(
        panel.load_layout(&path).await,
        Err(PanelError::Config(_))
    ));
}

#[tokio::test]
async fn test_reset_keeps_peripheral_modes() {
    let (panel, _) = panel();
    panel
        .set_peripheral(pin(12), PeripheralMode::Pwm)
        .await
        .unwrap();
    assert_ok!(panel.set_state(pin(7), true).await);
    panel.start_flash(pin(22), None).await.unwrap();

    panel.reset_all().await.unwrap();
    let snapshot = panel.snapshot();
    assert_eq!(
        snapshot.get(pin(12)).unwrap().peripheral_mode,
        PeripheralMode::Pwm
    );
    assert!(!snapshot.get(pin(7)).unwrap().state);
    assert!(!snapshot.get(pin(22)).unwrap().flashing);
}

#[tokio::test]
async fn test_shutdown_releases_lines() {
    let (panel, probe) = panel();
    assert_ok!(panel.set_state(pin(7), true).await);
    panel.start_flash(pin(11), None).await.unwrap();

    panel.shutdown().await;
    assert!(!probe.is_configured(pin(7).bcm()));
    assert!(!probe.is_configured(pin(11).bcm()));
    let released = probe.released();
    assert!(released.contains(&pin(7).bcm()));
    assert!(released.contains(&pin(11).bcm()));

    // Idempotent.
    panel.shutdown().await;
    assert!(panel.snapshot().owned_by(|_| true).is_empty());
}
