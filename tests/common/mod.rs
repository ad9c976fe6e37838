//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;

use nexxt::config::Configuration;
use nexxt::filters::{SampleTap, TapRecord, SAMPLE_TAP_SERVICE};
use nexxt::graph::LibraryRef;
use nexxt::property::PropertyValue;
use nexxt::services::ServiceRegistry;

pub const SOURCE_LIB: &str = "entry_point://nexxt.filters.PeriodicSource";
pub const PASS_LIB: &str = "entry_point://nexxt.filters.PassThrough";
pub const SINK_LIB: &str = "entry_point://nexxt.filters.CollectingSink";

/// Register the built-in filters and install a fresh sample tap service.
/// Returns the receiving end of the tap.
pub fn setup_runtime() -> Receiver<TapRecord> {
    nexxt::filters::register_builtin();
    let (tap, rx) = SampleTap::channel();
    ServiceRegistry::default().add_service(SAMPLE_TAP_SERVICE, Arc::new(tap));
    rx
}

/// Build `source -> sink` into a new application named "application".
pub fn build_chain(
    config: &mut Configuration,
    source_thread: &str,
    sink_thread: &str,
    frequency: f64,
    sleep_seconds: f64,
) -> String {
    let name = config.add_new_application().unwrap();
    let app = config.application_by_name(&name).unwrap();
    app.graph_mut()
        .add_node(LibraryRef::Url(SOURCE_LIB.into()), "PeriodicSource", Some("source"))
        .unwrap();
    app.graph_mut()
        .add_node(LibraryRef::Url(SINK_LIB.into()), "CollectingSink", Some("sink"))
        .unwrap();
    app.graph_mut()
        .base_mut()
        .add_connection("source", "outPort", "sink", "inPort")
        .unwrap();
    let props = app.property_collection();
    let source_props = props.get_child_collection("source").unwrap();
    source_props
        .set_property("frequency", PropertyValue::Float(frequency))
        .unwrap();
    set_thread(&source_props, source_thread);
    let sink_props = props.get_child_collection("sink").unwrap();
    sink_props
        .set_property("sleep_seconds", PropertyValue::Float(sleep_seconds))
        .unwrap();
    set_thread(&sink_props, sink_thread);
    name
}

pub fn set_thread(filter_props: &Arc<nexxt::property::PropertyCollection>, thread: &str) {
    filter_props
        .get_child_collection("_nexxT")
        .unwrap()
        .set_property("thread", PropertyValue::Str(thread.into()))
        .unwrap();
}

/// Drain all currently available tap records.
pub fn drain(rx: &Receiver<TapRecord>) -> Vec<TapRecord> {
    let mut records = Vec::new();
    while let Ok(rec) = rx.try_recv() {
        records.push(rec);
    }
    records
}

/// Inter-arrival times of the records in seconds.
pub fn intervals(records: &[TapRecord]) -> Vec<f64> {
    records
        .windows(2)
        .map(|w| (w[1].received_time - w[0].received_time) as f64 * nexxt::TIMESTAMP_RES)
        .collect()
}

pub fn activate_and_run(config: &mut Configuration, app: &str, duration: Duration) {
    config.activate(app).unwrap();
    let active = config.active_application().unwrap();
    active.init().unwrap();
    active.open().unwrap();
    active.start().unwrap();
    active.process_events(duration);
    active.stop().unwrap();
}
