//! Controller -> mainframe -> module chains built from YAML over a scripted serial port.

mod common;

use common::ScriptedFactory;
use labwire::broker::{BrokerOptions, ChannelBroker};
use labwire::deps::BrokerDep;
use labwire::instrument::{Sim900, Sim921, Sim928, Sim970, VSource};
use labwire::tree::params::{PrologixGpibParams, Sim900Params, Sim928Params, Sim970Params};
use labwire::tree::render_tree;
use labwire::{Instrument, InstrumentRegistry, LabError, Params, ParentExt};
use std::sync::Arc;
use std::time::{Duration, Instant};

const BENCH: &str = r#"
type: prologix_gpib
port: /dev/ttyUSB0
children:
  3:
    type: sim900
    query_delay: 0.0
    children:
      1:
        type: sim970
        settling_time: 0.0
      5:
        type: sim928
        settling_time: 0.0
        verify: false
"#;

fn bench(factory: Arc<ScriptedFactory>) -> Box<dyn Instrument> {
    let broker = ChannelBroker::with_factory(factory, BrokerOptions::default());
    let registry = Arc::new(InstrumentRegistry::standard());
    registry
        .build_root_on(
            Params::from_yaml(BENCH).unwrap(),
            BrokerDep::local(Arc::new(broker)),
        )
        .unwrap()
}

/// A controller with no devices yet.
fn bare_bus(factory: Arc<ScriptedFactory>) -> Box<dyn Instrument> {
    let broker = ChannelBroker::with_factory(factory, BrokerOptions::default());
    Arc::new(InstrumentRegistry::standard())
        .build_root_on(
            Params::PrologixGpib(PrologixGpibParams::new("/dev/ttyUSB0")),
            BrokerDep::local(Arc::new(broker)),
        )
        .unwrap()
}

fn quick_mainframe() -> Params {
    Params::Sim900(Sim900Params {
        query_delay: 0.0,
        ..Sim900Params::default()
    })
}

fn source(settling_time: f64, verify: bool) -> Params {
    Params::Sim928(Sim928Params {
        settling_time,
        verify,
        attribute: None,
    })
}

fn mainframe(root: &mut Box<dyn Instrument>) -> &mut dyn Instrument {
    root.as_parent_mut().unwrap().child_mut("3").unwrap()
}

#[test]
fn test_chain_is_navigable_and_stable() {
    let root = bench(ScriptedFactory::new());
    let bus = root.as_parent().unwrap();
    assert_eq!(bus.children().len(), 1);

    let frame = bus.child("3").unwrap();
    assert!(frame.downcast_ref::<Sim900>().is_some());
    let first = frame
        .as_parent()
        .unwrap()
        .child("1")
        .unwrap()
        .downcast_ref::<Sim970>()
        .unwrap();
    let again = root
        .as_parent()
        .unwrap()
        .child("3")
        .unwrap()
        .as_parent()
        .unwrap()
        .child("1")
        .unwrap()
        .downcast_ref::<Sim970>()
        .unwrap();
    assert!(std::ptr::eq(first, again));
    assert_eq!(first.channels().len(), 4);

    let listing = render_tree(root.as_ref());
    assert!(listing.starts_with("PrologixGpib (/dev/ttyUSB0, 1 devices)"));
    assert!(listing.contains("\n  3: Sim900 (GPIB 3, 2/8 slots used)"));
    assert!(listing.contains("\n    1: Sim970 (slot 1): 4/4 channels connected"));
}

#[test]
fn test_module_traffic_is_framed_on_shared_port() {
    let factory = ScriptedFactory::new();
    factory.reply("VOLT? 2", "1.250000");
    let mut root = bench(factory.clone());

    let sim970 = mainframe(&mut root)
        .as_parent_mut()
        .unwrap()
        .child_mut("1")
        .unwrap()
        .downcast_mut::<Sim970>()
        .unwrap();
    assert_eq!(sim970.get_voltage(2).unwrap(), 1.25);

    let sim928 = mainframe(&mut root)
        .as_parent_mut()
        .unwrap()
        .child_mut("5")
        .unwrap()
        .downcast_mut::<Sim928>()
        .unwrap();
    sim928.set_voltage(0.5).unwrap();

    // Everything below the controller shares one serial channel.
    assert_eq!(factory.created(), 1);
    let writes: Vec<String> = factory.writes().into_iter().map(|(_, text)| text).collect();
    assert!(writes.contains(&"++addr 3\nCONN 1, \"esc\"\r\nVOLT? 2\r\nesc\n".to_string()));
    assert!(writes.contains(&"++addr 3\nCONN 5, \"esc\"\r\nVOLT 0.500\r\nesc\n".to_string()));
}

#[test]
fn test_disconnect_cascades_below_mainframe() {
    let mut root = bench(ScriptedFactory::new());
    mainframe(&mut root).disconnect().unwrap();

    let frame = root.as_parent().unwrap().child("3").unwrap();
    assert!(!frame.is_connected());
    let sim970 = frame
        .as_parent()
        .unwrap()
        .child("1")
        .unwrap()
        .downcast_ref::<Sim970>()
        .unwrap();
    assert!(sim970.channels().iter().all(|c| !c.is_connected()));
    assert!(!frame.as_parent().unwrap().child("5").unwrap().is_connected());
    assert!(root.is_connected());

    // Idempotent, and the root still tears down cleanly afterwards.
    mainframe(&mut root).disconnect().unwrap();
    root.disconnect().unwrap();
    root.disconnect().unwrap();
    assert!(!root.is_connected());
}

#[test]
fn test_add_child_validates_keys_against_capacity() {
    let mut root = bench(ScriptedFactory::new());
    let frame = mainframe(&mut root).as_parent_mut().unwrap();

    let bridge = frame
        .add::<Sim921>("7", Params::Sim921(Default::default()))
        .unwrap();
    assert!(bridge.is_connected());
    assert_eq!(frame.children().len(), 3);

    let err = frame
        .add_child("8", Params::Sim921(Default::default()))
        .err()
        .unwrap();
    assert!(matches!(err, LabError::SlotOutOfRange { capacity: 8, .. }));
    let err = frame
        .add_child("left", Params::Sim921(Default::default()))
        .err()
        .unwrap();
    assert!(matches!(err, LabError::InvalidSlotKey(_)));

    let err = frame
        .add::<Sim970>("6", Params::Sim921(Default::default()))
        .err()
        .unwrap();
    assert!(matches!(err, LabError::TypeMismatch { .. }));
    assert_eq!(frame.children().len(), 4);
}

#[test]
fn test_disconnected_parent_refuses_new_children() {
    let mut root = bench(ScriptedFactory::new());
    mainframe(&mut root).disconnect().unwrap();
    let frame = mainframe(&mut root).as_parent_mut().unwrap();
    let err = frame
        .add_child("2", Params::Sim921(Default::default()))
        .err()
        .unwrap();
    assert!(matches!(err, LabError::NotConnected(_)));
}

#[test]
fn test_chain_built_with_add_is_reachable_from_root() {
    let mut root = bare_bus(ScriptedFactory::new());
    let frame = root
        .as_parent_mut()
        .unwrap()
        .add::<Sim900>("3", quick_mainframe())
        .unwrap();
    let added: *const Sim970 = frame
        .add::<Sim970>(
            "1",
            Params::Sim970(Sim970Params {
                settling_time: 0.0,
                ..Sim970Params::default()
            }),
        )
        .unwrap();

    let found = root
        .as_parent()
        .unwrap()
        .child("3")
        .unwrap()
        .as_parent()
        .unwrap()
        .child("1")
        .unwrap()
        .downcast_ref::<Sim970>()
        .unwrap();
    assert!(std::ptr::eq(added, found));
    assert!(found.channels().iter().all(|c| c.is_connected()));

    mainframe(&mut root).disconnect().unwrap();
    let sim970 = root
        .as_parent()
        .unwrap()
        .child("3")
        .unwrap()
        .as_parent()
        .unwrap()
        .child("1")
        .unwrap()
        .downcast_ref::<Sim970>()
        .unwrap();
    assert_eq!(sim970.channels().len(), 4);
    assert!(sim970.channels().iter().all(|c| !c.is_connected()));
    assert!(!sim970.is_connected());
}

#[test]
fn test_zero_padded_address_cannot_alias_a_device() {
    let mut root = bare_bus(ScriptedFactory::new());
    let bus = root.as_parent_mut().unwrap();
    bus.add_child("3", quick_mainframe()).unwrap();
    for alias in ["03", "+3", " 3"] {
        let err = bus.add_child(alias, quick_mainframe()).err().unwrap();
        assert!(matches!(err, LabError::InvalidSlotKey(_)), "{alias:?}: {err}");
    }
    let keys: Vec<&str> = bus.children().into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["3"]);
}

#[test]
fn test_source_readback_mismatch_is_reported() {
    let factory = ScriptedFactory::new();
    factory.reply("VOLT?", "0.000");
    let mut root = bare_bus(factory.clone());
    let frame = root
        .as_parent_mut()
        .unwrap()
        .add::<Sim900>("3", quick_mainframe())
        .unwrap();
    let sim928 = frame.add::<Sim928>("5", source(0.0, true)).unwrap();

    let err = sim928.set_voltage(1.25).unwrap_err();
    match err {
        LabError::VerificationFailed {
            quantity,
            expected,
            actual,
        } => {
            assert_eq!(quantity, "voltage");
            assert_eq!(expected, "1.250");
            assert_eq!(actual, "0.000");
        }
        other => panic!("unexpected error: {other}"),
    }
    let writes: Vec<String> = factory.writes().into_iter().map(|(_, text)| text).collect();
    assert!(writes.iter().any(|w| w.contains("CONN 5") && w.contains("VOLT?")));

    sim928.set_voltage(0.0).unwrap();
}

#[test]
fn test_source_waits_for_output_to_settle() {
    let mut root = bare_bus(ScriptedFactory::new());
    let frame = root
        .as_parent_mut()
        .unwrap()
        .add::<Sim900>("3", quick_mainframe())
        .unwrap();
    let sim928 = frame.add::<Sim928>("5", source(0.15, false)).unwrap();

    let started = Instant::now();
    sim928.set_voltage(0.25).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));

    let started = Instant::now();
    sim928.turn_on().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));
}
