//! Composite filters expand into a flattened graph with no boundary
//! nodes left.

mod common;

use std::time::Duration;

use serial_test::serial;

use common::{drain, set_thread, setup_runtime, PASS_LIB, SINK_LIB, SOURCE_LIB};
use nexxt::config::Configuration;
use nexxt::graph::LibraryRef;
use nexxt::property::PropertyValue;

#[test]
#[serial]
fn test_composite_expansion_end_to_end() {
    let rx = setup_runtime();
    let mut config = Configuration::new();

    // composite: CompositeInput.in -> inner -> CompositeOutput.out
    let comp_name = config.add_new_composite_filter().unwrap();
    let cf = config.composite_by_name(&comp_name).unwrap();
    {
        let mut sub = cf.write();
        sub.graph_mut()
            .add_dynamic_output_port("CompositeInput", "in")
            .unwrap();
        sub.graph_mut()
            .add_dynamic_input_port("CompositeOutput", "out")
            .unwrap();
        sub.graph_mut()
            .add_node(LibraryRef::Url(PASS_LIB.into()), "PassThrough", Some("inner"))
            .unwrap();
        sub.graph_mut()
            .base_mut()
            .add_connection("CompositeInput", "in", "inner", "inPort")
            .unwrap();
        sub.graph_mut()
            .base_mut()
            .add_connection("inner", "outPort", "CompositeOutput", "out")
            .unwrap();
    }
    assert_eq!(
        cf.boundary_ports(),
        (vec!["in".to_string()], vec!["out".to_string()])
    );

    // application: source -> comp -> sink
    let app_name = config.add_new_application().unwrap();
    let app = config.application_by_name(&app_name).unwrap();
    app.graph_mut()
        .add_node(LibraryRef::Url(SOURCE_LIB.into()), "PeriodicSource", Some("source"))
        .unwrap();
    app.graph_mut()
        .add_node(LibraryRef::CompositeRef(cf.clone()), "compositeNode", Some("comp"))
        .unwrap();
    app.graph_mut()
        .add_node(LibraryRef::Url(SINK_LIB.into()), "CollectingSink", Some("sink"))
        .unwrap();
    app.graph_mut()
        .base_mut()
        .add_connection("source", "outPort", "comp", "in")
        .unwrap();
    app.graph_mut()
        .base_mut()
        .add_connection("comp", "out", "sink", "inPort")
        .unwrap();
    let source_props = app.property_collection().get_child_collection("source").unwrap();
    source_props
        .set_property("frequency", PropertyValue::Float(10.0))
        .unwrap();
    set_thread(&source_props, "main");

    config.activate(&app_name).unwrap();
    let active = config.active_application().unwrap();

    // the flattened graph holds the concrete filters, no boundary nodes
    assert!(active.get_filter("/source").is_ok());
    assert!(active.get_filter("/comp/inner").is_ok());
    assert!(active.get_filter("/sink").is_ok());
    assert!(active.get_filter("/comp").is_err());
    assert!(active.get_filter("/comp/CompositeInput").is_err());
    assert!(active.get_filter("/comp/CompositeOutput").is_err());

    active.init().unwrap();
    active.open().unwrap();
    active.start().unwrap();
    active.process_events(Duration::from_millis(800));
    active.stop().unwrap();

    // data flowed end-to-end through the expanded chain
    let records = drain(&rx);
    assert!(
        records.len() >= 2,
        "expected data to flow through the composite, got {} samples",
        records.len()
    );
    assert!(records.iter().all(|r| r.filter == "/sink"));

    active.shutdown().unwrap();
}

#[test]
#[serial]
fn test_composite_recursion_is_refused() {
    let _rx = setup_runtime();
    let mut config = Configuration::new();
    let a_name = config.add_new_composite_filter().unwrap();
    let b_name = config.add_new_composite_filter().unwrap();
    let a = config.composite_by_name(&a_name).unwrap();
    let b = config.composite_by_name(&b_name).unwrap();

    // a uses b: fine
    a.write()
        .graph_mut()
        .add_node(LibraryRef::CompositeRef(b.clone()), "compositeNode", Some("uses_b"))
        .unwrap();
    // b uses a: cycle
    let err = b
        .write()
        .graph_mut()
        .add_node(LibraryRef::CompositeRef(a.clone()), "compositeNode", Some("uses_a"))
        .unwrap_err();
    assert!(matches!(err, nexxt::NexxTError::CompositeRecursion(_)));
    // the offending node was rolled back
    assert!(!b.read().graph().base().has_node("uses_a"));
}

#[test]
#[serial]
fn test_protected_boundary_nodes() {
    let _rx = setup_runtime();
    let mut config = Configuration::new();
    let name = config.add_new_composite_filter().unwrap();
    let cf = config.composite_by_name(&name).unwrap();
    let err = cf
        .write()
        .graph_mut()
        .rename_node("CompositeInput", "Renamed")
        .unwrap_err();
    assert!(matches!(err, nexxt::NexxTError::NodeProtected(_)));
    let err = cf.write().graph_mut().delete_node("CompositeOutput").unwrap_err();
    assert!(matches!(err, nexxt::NexxTError::NodeProtected(_)));
}
