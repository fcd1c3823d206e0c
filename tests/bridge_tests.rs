use pvbridge::bus::{BusEntry, BusError, BusValue, PathSpec};
use pvbridge::config::DeviceConfig;
use pvbridge::scheduler::CycleOutcome;
use pvbridge::service::*;
use pvbridge::subscriber::Delivery;
use pvbridge::*;
use std::sync::Arc;

const TOPIC: &str = "sma2/3001234567/inverter";

fn device() -> DeviceConfig {
    DeviceConfig {
        instance: 40,
        serial: "3001234567".into(),
        custom_name: "Garage roof".into(),
        product_name: "MQTT Inverter".into(),
        connection: "MQTT Inverter JSON service".into(),
        position: 0,
    }
}

fn registered_bus() -> LocalBus {
    let mut bus = LocalBus::new(service_name(40));
    register_service(&mut bus, &device()).unwrap();
    bus
}

fn payload(power: f64, total: f64) -> Vec<u8> {
    let per_phase = power / 3.0;
    format!(
        r#"{{"spotacvoltage1":230,"spotacvoltage2":231,"spotacvoltage3":232,
            "spotacamperage1":0.5,"spotacamperage2":0.6,"spotacamperage3":0.7,
            "spotacpower1":{p},"spotacpower2":{p},"spotacpower3":{p},
            "spotacpower":{power},"total":{total}}}"#,
        p = per_phase,
        power = power,
        total = total
    )
    .into_bytes()
}

fn pipeline() -> (FeedSubscriber, RevisionPublisher, Arc<FrameQueue>) {
    let queue = Arc::new(FrameQueue::new());
    let subscriber = FeedSubscriber::new(Arc::clone(&queue), "inverter");
    let publisher = RevisionPublisher::new(Arc::clone(&queue));
    (subscriber, publisher, queue)
}

#[test]
fn test_single_frame_published() {
    let mut bus = registered_bus();
    let (subscriber, mut publisher, queue) = pipeline();

    assert_eq!(
        subscriber.handle_message(TOPIC, &payload(300.0, 5000.0)),
        Delivery::Queued { evicted: 0 }
    );

    let outcome = publisher.run_cycle(&mut bus);
    assert_eq!(outcome, CycleOutcome::Published { revision: 1 });

    assert_eq!(bus.get(PATH_UPDATE_INDEX).unwrap(), BusValue::Int(1));
    assert_eq!(bus.get(PATH_AC_POWER).unwrap(), BusValue::Float(300.0));
    assert_eq!(bus.get(PATH_L1_POWER).unwrap(), BusValue::Float(100.0));
    assert_eq!(bus.get(PATH_L2_POWER).unwrap(), BusValue::Float(100.0));
    assert_eq!(bus.get(PATH_L3_POWER).unwrap(), BusValue::Float(100.0));
    assert_eq!(bus.get(PATH_L2_VOLTAGE).unwrap(), BusValue::Float(231.0));
    assert_eq!(bus.get(PATH_L3_CURRENT).unwrap(), BusValue::Float(0.7));
    assert_eq!(bus.get(PATH_AC_ENERGY_FORWARD).unwrap(), BusValue::Float(5.0));
    assert_eq!(bus.get(PATH_CONNECTED).unwrap(), BusValue::Int(1));
    assert_eq!(bus.text(PATH_AC_ENERGY_FORWARD).unwrap(), "5.00KWh");

    assert!(queue.is_empty());
    assert!(publisher.last_update().is_some());
}

#[test]
fn test_energy_scaled_to_kwh() {
    let mut bus = registered_bus();
    let (subscriber, mut publisher, _queue) = pipeline();

    subscriber.handle_message(TOPIC, &payload(0.0, 12345.0));
    publisher.run_cycle(&mut bus);

    assert_eq!(bus.get(PATH_AC_ENERGY_FORWARD).unwrap(), BusValue::Float(12.345));
    assert_eq!(bus.text(PATH_AC_ENERGY_FORWARD).unwrap(), "12.35KWh");
}

#[test]
fn test_only_newest_frame_published() {
    let mut bus = registered_bus();
    let (subscriber, mut publisher, queue) = pipeline();

    for power in [100.0, 200.0, 300.0] {
        subscriber.handle_message(TOPIC, &payload(power, 1000.0));
    }
    assert_eq!(queue.len(), 3);

    assert_eq!(publisher.run_cycle(&mut bus), CycleOutcome::Published { revision: 1 });
    assert_eq!(bus.get(PATH_AC_POWER).unwrap(), BusValue::Float(300.0));
    assert!(queue.is_empty());
    assert_eq!(queue.get_stats().total_expired, 2);

    // Older frames were discarded, so the next tick has nothing to do.
    assert_eq!(publisher.run_cycle(&mut bus), CycleOutcome::Idle);
    assert_eq!(bus.get(PATH_UPDATE_INDEX).unwrap(), BusValue::Int(1));
}

#[test]
fn test_burst_keeps_four_newest() {
    let (subscriber, _publisher, queue) = pipeline();

    let mut evicted = 0;
    for i in 0..10 {
        if let Delivery::Queued { evicted: n } = subscriber.handle_message(TOPIC, &payload(f64::from(i), 0.0)) {
            evicted += n;
        }
    }

    assert_eq!(queue.len(), 4);
    assert_eq!(evicted, 6);
    assert_eq!(queue.pop_latest().unwrap().spotacpower, 9.0);
}

#[test]
fn test_idle_tick_is_noop() {
    let mut bus = registered_bus();
    let (_subscriber, mut publisher, _queue) = pipeline();
    let before: Vec<BusEntry> = bus.entries();

    assert_eq!(publisher.run_cycle(&mut bus), CycleOutcome::Idle);
    assert_eq!(bus.entries(), before);
    assert_eq!(bus.write_count(), 0);
    assert!(publisher.last_update().is_none());
}

#[test]
fn test_revision_wraps_after_255() {
    let mut bus = registered_bus();
    let (subscriber, mut publisher, _queue) = pipeline();
    bus.set(PATH_UPDATE_INDEX, BusValue::Int(255)).unwrap();

    subscriber.handle_message(TOPIC, &payload(10.0, 0.0));
    assert_eq!(publisher.run_cycle(&mut bus), CycleOutcome::Published { revision: 0 });
    assert_eq!(bus.get(PATH_UPDATE_INDEX).unwrap(), BusValue::Int(0));

    subscriber.handle_message(TOPIC, &payload(10.0, 0.0));
    assert_eq!(publisher.run_cycle(&mut bus), CycleOutcome::Published { revision: 1 });
}

#[test]
fn test_revision_advances_once_per_publish() {
    let mut bus = registered_bus();
    let (subscriber, mut publisher, _queue) = pipeline();

    for expected in 1..=5u8 {
        subscriber.handle_message(TOPIC, &payload(50.0, 0.0));
        assert_eq!(publisher.run_cycle(&mut bus), CycleOutcome::Published { revision: expected });
        assert_eq!(publisher.run_cycle(&mut bus), CycleOutcome::Idle);
    }
    assert_eq!(bus.get(PATH_UPDATE_INDEX).unwrap(), BusValue::Int(5));
}

#[test]
fn test_malformed_payloads_do_not_reach_queue() {
    let mut bus = registered_bus();
    let (subscriber, mut publisher, queue) = pipeline();

    assert_eq!(subscriber.handle_message(TOPIC, b"{not json"), Delivery::Rejected);
    assert_eq!(subscriber.handle_message(TOPIC, b"[1,2,3]"), Delivery::Rejected);
    assert_eq!(subscriber.handle_message(TOPIC, br#"{"spotacpower":300}"#), Delivery::Rejected);
    assert_eq!(subscriber.handle_message("sma2/3001234567/meter", &payload(1.0, 1.0)), Delivery::Ignored);
    assert!(queue.is_empty());

    // A good frame afterwards is handled normally.
    subscriber.handle_message(TOPIC, &payload(90.0, 0.0));
    assert_eq!(publisher.run_cycle(&mut bus), CycleOutcome::Published { revision: 1 });

    let stats = subscriber.stats();
    assert_eq!(stats.received, 5);
    assert_eq!(stats.rejected, 3);
    assert_eq!(stats.ignored, 1);
    assert_eq!(stats.queued, 1);
}

#[test]
fn test_non_integer_revision_fails_cycle() {
    let mut bus = LocalBus::new("test.bus");
    bus.add_path(PATH_UPDATE_INDEX, PathSpec::fixed("seven")).unwrap();
    let (subscriber, mut publisher, _queue) = pipeline();

    subscriber.handle_message(TOPIC, &payload(10.0, 0.0));
    assert!(matches!(publisher.run_cycle(&mut bus), CycleOutcome::Failed { .. }));
    assert!(publisher.last_update().is_none());
}

/// Bus that accepts reads but refuses every batch write.
struct FailingBus {
    inner: LocalBus,
}

impl ServiceBus for FailingBus {
    fn service_name(&self) -> &str {
        self.inner.service_name()
    }

    fn add_path(&mut self, path: &str, spec: PathSpec) -> Result<(), BusError> {
        self.inner.add_path(path, spec)
    }

    fn get(&self, path: &str) -> Result<BusValue, BusError> {
        self.inner.get(path)
    }

    fn set(&mut self, path: &str, value: BusValue) -> Result<(), BusError> {
        self.inner.set(path, value)
    }

    fn set_many(&mut self, _updates: &[(&str, BusValue)]) -> Result<(), BusError> {
        Err(BusError::WriteFailed("bus went away".into()))
    }

    fn text(&self, path: &str) -> Result<String, BusError> {
        self.inner.text(path)
    }

    fn write_external(&mut self, path: &str, value: BusValue) -> Result<bool, BusError> {
        self.inner.write_external(path, value)
    }

    fn entries(&self) -> Vec<BusEntry> {
        self.inner.entries()
    }
}

#[test]
fn test_bus_failure_reported_and_next_cycle_runs() {
    let mut bus = FailingBus {
        inner: registered_bus(),
    };
    let (subscriber, mut publisher, queue) = pipeline();

    subscriber.handle_message(TOPIC, &payload(10.0, 0.0));
    match publisher.run_cycle(&mut bus) {
        CycleOutcome::Failed { reason } => assert!(reason.contains("bus went away")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(bus.get(PATH_UPDATE_INDEX).unwrap(), BusValue::Int(0));
    assert!(queue.is_empty());

    // The publisher stays usable after a failed cycle.
    assert_eq!(publisher.run_cycle(&mut bus), CycleOutcome::Idle);
}

#[test]
fn test_concurrent_producer_and_publisher() {
    let mut bus = registered_bus();
    let (subscriber, mut publisher, _queue) = pipeline();

    let producer = {
        let subscriber = subscriber.clone();
        std::thread::spawn(move || {
            for i in 0..200 {
                subscriber.handle_message(TOPIC, &payload(f64::from(i), f64::from(i)));
            }
        })
    };

    let mut published: i64 = 0;
    while !producer.is_finished() {
        if let CycleOutcome::Published { .. } = publisher.run_cycle(&mut bus) {
            published += 1;
        }
    }
    producer.join().unwrap();
    if let CycleOutcome::Published { .. } = publisher.run_cycle(&mut bus) {
        published += 1;
    }

    // Every committed snapshot is internally consistent.
    let power = bus.get(PATH_AC_POWER).unwrap().as_f64().unwrap();
    let energy = bus.get(PATH_AC_ENERGY_FORWARD).unwrap().as_f64().unwrap();
    assert_eq!(power, 199.0);
    assert_eq!(energy, 0.199);
    assert!(published >= 1);
    assert_eq!(
        bus.get(PATH_UPDATE_INDEX).unwrap(),
        BusValue::Int(published % 256)
    );
}
