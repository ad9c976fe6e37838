//! Cycles in the thread graph are refused at start.

mod common;

use serial_test::serial;

use common::{set_thread, setup_runtime, PASS_LIB};
use nexxt::config::Configuration;
use nexxt::graph::{ConnProperties, LibraryRef};
use nexxt::FilterState;

fn build_cycle(config: &mut Configuration, widths: (usize, usize)) -> String {
    let name = config.add_new_application().unwrap();
    let app = config.application_by_name(&name).unwrap();
    app.graph_mut()
        .add_node(LibraryRef::Url(PASS_LIB.into()), "PassThrough", Some("a"))
        .unwrap();
    app.graph_mut()
        .add_node(LibraryRef::Url(PASS_LIB.into()), "PassThrough", Some("b"))
        .unwrap();
    app.graph_mut()
        .base_mut()
        .add_connection("a", "outPort", "b", "inPort")
        .unwrap();
    app.graph_mut()
        .base_mut()
        .add_connection("b", "outPort", "a", "inPort")
        .unwrap();
    app.graph_mut()
        .base_mut()
        .set_connection_properties("a", "outPort", "b", "inPort", ConnProperties { width: widths.0 })
        .unwrap();
    app.graph_mut()
        .base_mut()
        .set_connection_properties("b", "outPort", "a", "inPort", ConnProperties { width: widths.1 })
        .unwrap();
    let props = app.property_collection();
    set_thread(&props.get_child_collection("a").unwrap(), "t1");
    set_thread(&props.get_child_collection("b").unwrap(), "t2");
    name
}

#[test]
#[serial]
fn test_thread_cycle_fails_activation() {
    let _rx = setup_runtime();
    let mut config = Configuration::new();
    let app_name = build_cycle(&mut config, (1, 1));
    config.activate(&app_name).unwrap();
    let active = config.active_application().unwrap();
    active.init().unwrap();
    active.open().unwrap();

    // the deadlock is logged and contained: start does not propagate it
    active.start().unwrap();
    // no filter was started; the application wound itself back down
    // through close and deinit
    assert_eq!(active.get_state(), FilterState::Constructed);
    assert_eq!(
        active.get_filter("/a").unwrap().state(),
        FilterState::Constructed
    );
    assert_eq!(
        active.get_filter("/b").unwrap().state(),
        FilterState::Constructed
    );

    active.destruct().unwrap();
    assert_eq!(active.get_state(), FilterState::Destructed);
}

#[test]
#[serial]
fn test_width_zero_edges_are_ignored_by_deadlock_detection() {
    let _rx = setup_runtime();
    let mut config = Configuration::new();
    // the back edge is declared non-blocking
    let app_name = build_cycle(&mut config, (1, 0));
    config.activate(&app_name).unwrap();
    let active = config.active_application().unwrap();
    active.init().unwrap();
    active.open().unwrap();
    active.start().unwrap();
    assert_eq!(active.get_state(), FilterState::Active);
    active.shutdown().unwrap();
}
