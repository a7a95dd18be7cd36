//! Concurrent first-time requests collapse onto one backend.

mod common;

use common::ScriptedFactory;
use labwire::broker::{BrokerOptions, ChannelBroker};
use labwire::deps::BrokerDep;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const THREADS: usize = 16;

#[test]
fn test_racing_requests_construct_once() {
    let factory = ScriptedFactory::slow(Duration::from_millis(50));
    let broker = Arc::new(ChannelBroker::with_factory(
        factory.clone(),
        BrokerOptions::default(),
    ));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let broker = broker.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                broker.get_or_create("serial:/dev/ttyUSB0").unwrap()
            })
        })
        .collect();
    let channels: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(factory.created(), 1);
    assert!(channels.iter().all(|c| c.same_backend(&channels[0])));
    assert_eq!(
        broker.list_descriptors(),
        vec!["serial:/dev/ttyUSB0?baud=9600&timeout=1.0".to_string()]
    );
}

#[test]
fn test_distinct_descriptors_build_in_parallel() {
    let factory = ScriptedFactory::slow(Duration::from_millis(200));
    let broker = Arc::new(ChannelBroker::with_factory(
        factory.clone(),
        BrokerOptions::default(),
    ));
    let barrier = Arc::new(Barrier::new(4));

    let started = std::time::Instant::now();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let broker = broker.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                broker.get_or_create(&format!("dummy:bench{i}")).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(factory.created(), 4);
    // Serialized construction would take at least 800 ms.
    assert!(started.elapsed() < Duration::from_millis(700));
    assert_eq!(broker.len(), 4);
}

#[test]
fn test_role_deps_from_many_threads_share_channel() {
    let factory = ScriptedFactory::slow(Duration::from_millis(20));
    let broker = BrokerDep::local(Arc::new(ChannelBroker::with_factory(
        factory.clone(),
        BrokerOptions::default(),
    )));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let broker = broker.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let serial = broker.serial("serial:COM3").unwrap();
                serial.write_str(&format!("cmd {i}\n")).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(factory.created(), 1);
    assert_eq!(factory.writes().len(), 8);
    assert!(factory
        .writes()
        .iter()
        .all(|(descriptor, _)| descriptor == "serial:COM3?baud=9600&timeout=1.0"));
}
