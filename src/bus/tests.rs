use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
struct Reading(u32);

#[derive(Debug, Clone, PartialEq)]
struct Heartbeat;

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<u32>>,
}

impl Recorder {
    fn seen(&self) -> Vec<u32> {
        self.seen.lock().unwrap().clone()
    }
}

fn setting(path: &str, value: &str) -> SettingValue {
    SettingValue {
        path: path.to_string(),
        value: value.to_string(),
    }
}

#[test]
fn test_each_subscriber_receives_each_message_once_in_order() {
    let bus = RelayBus::default();
    let recorders: Vec<Arc<Recorder>> = (0..3).map(|_| Arc::new(Recorder::default())).collect();
    for recorder in &recorders {
        bus.register(recorder, |r: &Recorder, m: &Reading| r.seen.lock().unwrap().push(m.0));
    }

    for n in 0..50 {
        assert_eq!(bus.send(&Reading(n)), 3);
    }

    let expected: Vec<u32> = (0..50).collect();
    for recorder in &recorders {
        assert_eq!(recorder.seen(), expected);
    }
}

#[test]
fn test_unregister_stops_delivery() {
    let bus = RelayBus::default();
    let recorder = Arc::new(Recorder::default());
    bus.register(&recorder, |r: &Recorder, m: &Reading| r.seen.lock().unwrap().push(m.0));

    bus.send(&Reading(1));
    assert_eq!(bus.unregister(&recorder), 1);
    assert_eq!(bus.send(&Reading(2)), 0);

    assert_eq!(recorder.seen(), vec![1]);
}

#[test]
fn test_dropped_subscriber_is_not_kept_alive_and_is_pruned() {
    let bus = RelayBus::default();
    let count = Arc::new(AtomicUsize::new(0));

    let subscriber = Arc::new(Recorder::default());
    let weak = Arc::downgrade(&subscriber);
    let counter = Arc::clone(&count);
    bus.register(&subscriber, move |_: &Recorder, _: &Reading| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    bus.send(&Reading(1));
    drop(subscriber);
    assert!(weak.upgrade().is_none());

    assert_eq!(bus.send(&Reading(2)), 0);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(bus.subscriber_count::<Reading>(), 0);
}

#[test]
fn test_register_prunes_dead_subscribers_without_a_send() {
    let bus = RelayBus::default();
    let first = Arc::new(Recorder::default());
    bus.register(&first, |_: &Recorder, _: &Heartbeat| {});
    drop(first);
    assert_eq!(bus.subscriber_count::<Heartbeat>(), 1);

    let second = Arc::new(Recorder::default());
    bus.register(&second, |_: &Recorder, _: &Heartbeat| {});
    assert_eq!(bus.subscriber_count::<Heartbeat>(), 1);
}

#[test]
fn test_unregister_counts_only_live_registrations() {
    let bus = RelayBus::default();
    let dead = Arc::new(Recorder::default());
    bus.register(&dead, |r: &Recorder, m: &Reading| r.seen.lock().unwrap().push(m.0));
    drop(dead);

    let live = Arc::new(Recorder::default());
    bus.register(&live, |r: &Recorder, m: &Reading| r.seen.lock().unwrap().push(m.0));
    bus.register(&live, |_: &Recorder, _: &Heartbeat| {});

    assert_eq!(bus.unregister(&live), 2);
    assert_eq!(bus.subscriber_count::<Reading>(), 0);
    assert_eq!(bus.subscriber_count::<Heartbeat>(), 0);
}

#[test]
fn test_message_types_are_isolated() {
    let bus = RelayBus::default();
    let recorder = Arc::new(Recorder::default());
    bus.register(&recorder, |r: &Recorder, m: &Reading| r.seen.lock().unwrap().push(m.0));

    assert_eq!(bus.send(&Heartbeat), 0);
    assert_eq!(bus.send(&Reading(9)), 1);
    assert_eq!(recorder.seen(), vec![9]);
}

#[test]
fn test_handler_may_unregister_during_delivery() {
    let bus = Arc::new(RelayBus::default());
    let recorder = Arc::new(Recorder::default());
    let bus_in_handler = Arc::downgrade(&bus);
    let me = Arc::downgrade(&recorder);

    bus.register(&recorder, move |r: &Recorder, m: &Reading| {
        r.seen.lock().unwrap().push(m.0);
        if let (Some(bus), Some(me)) = (bus_in_handler.upgrade(), me.upgrade()) {
            bus.unregister(&me);
        }
    });

    bus.send(&Reading(1));
    bus.send(&Reading(2));
    assert_eq!(recorder.seen(), vec![1]);
}

#[test]
fn test_panicking_subscriber_does_not_block_others() {
    let bus = RelayBus::default();
    let faulty = Arc::new(Recorder::default());
    let healthy = Arc::new(Recorder::default());

    bus.register(&faulty, |_: &Recorder, _: &Reading| panic!("subscriber failure"));
    bus.register(&healthy, |r: &Recorder, m: &Reading| r.seen.lock().unwrap().push(m.0));

    assert_eq!(bus.send(&Reading(4)), 1);
    assert_eq!(healthy.seen(), vec![4]);
}

#[test]
fn test_path_prefix_subscription() {
    let bus = RelayBus::default();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    bus.register_path("/services/unitOfMeasure", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    bus.send_setting(&setting(
        "/services/unitOfMeasure/airTemperature/selection",
        "fahrenheit",
    ));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    bus.send_setting(&setting("/services/udpListener/preferredPort", "50222"));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_overlapping_prefixes_all_fire() {
    let bus = RelayBus::default();
    let fired = Arc::new(AtomicUsize::new(0));
    for prefix in [
        "/services",
        "/services/unitOfMeasure",
        "/services/unitOfMeasure/airTemperature/selection",
    ] {
        let counter = Arc::clone(&fired);
        bus.register_path(prefix, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    let invoked = bus.send_setting(&setting(
        "/services/unitOfMeasure/airTemperature/selection",
        "celsius",
    ));
    assert_eq!(invoked, 3);
    assert_eq!(fired.load(Ordering::SeqCst), 3);
}

#[test]
fn test_unregister_path() {
    let bus = RelayBus::default();
    let id = bus.register_path("/services", |_| {});
    assert!(bus.unregister_path(id));
    assert!(!bus.unregister_path(id));
    assert_eq!(bus.send_setting(&setting("/services/x", "1")), 0);
}

#[test]
fn test_path_handler_receives_value() {
    let bus = RelayBus::default();
    let received = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&received);
    bus.register_path("/services/udpListener/preferredPort", move |value| {
        *slot.lock().unwrap() = Some(value.value.clone());
    });

    bus.send_setting(&setting("/services/udpListener/preferredPort", "50300"));
    assert_eq!(received.lock().unwrap().as_deref(), Some("50300"));
}

#[test]
fn test_metrics_disabled_by_default() {
    let bus = RelayBus::default();
    assert!(!bus.metrics_enabled());
    assert!(bus.take_metrics(10).is_none());
}

#[test]
fn test_metrics_record_message_and_subscriber_kinds() {
    let bus = RelayBus::new(&BusConfig {
        metrics_enabled: true,
        ..BusConfig::default()
    });
    let recorder = Arc::new(Recorder::default());
    bus.register(&recorder, |r: &Recorder, m: &Reading| r.seen.lock().unwrap().push(m.0));

    for n in 0..5 {
        bus.send(&Reading(n));
    }

    let snapshot = bus.take_metrics(10).unwrap();
    assert_eq!(snapshot.entries.len(), 1);
    let entry = &snapshot.entries[0];
    assert_eq!(entry.message_kind, "Reading");
    assert_eq!(entry.subscriber_kind, "Recorder");
    assert_eq!(entry.count, 5);

    let empty = bus.take_metrics(10).unwrap();
    assert!(empty.entries.is_empty());
}
