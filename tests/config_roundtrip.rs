//! Saving and re-loading a configuration is an identity on the model.

mod common;

use serial_test::serial;

use common::{set_thread, setup_runtime, PASS_LIB, SINK_LIB, SOURCE_LIB};
use nexxt::config::{ConfigFileLoader, Configuration};
use nexxt::graph::LibraryRef;
use nexxt::property::PropertyValue;

fn build_config() -> Configuration {
    let mut config = Configuration::new();
    config
        .property_collection()
        .variables()
        .set("RECDIR", "${CFG_DIR}/recordings")
        .unwrap();

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

    let app_name = config.add_new_application().unwrap();
    let app = config.application_by_name(&app_name).unwrap();
    app.graph_mut()
        .add_node(LibraryRef::Url(SOURCE_LIB.into()), "PeriodicSource", Some("source"))
        .unwrap();
    app.graph_mut()
        .add_node(LibraryRef::CompositeRef(cf), "compositeNode", Some("comp"))
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
        .set_property("frequency", PropertyValue::Float(2.0))
        .unwrap();
    set_thread(&source_props, "reader");
    config
}

#[test]
#[serial]
fn test_save_load_save_is_identity() {
    let _rx = setup_runtime();
    let dir = tempfile::tempdir().unwrap();
    let path1 = dir.path().join("conf.json");
    let path2 = dir.path().join("conf2.json");

    let mut config = build_config();
    ConfigFileLoader::save(&mut config, Some(&path1)).unwrap();

    let mut reloaded = Configuration::new();
    ConfigFileLoader::load(&mut reloaded, &path1).unwrap();
    assert_eq!(reloaded.application_names(), config.application_names());
    assert_eq!(
        reloaded.composite_filter_names(),
        config.composite_filter_names()
    );
    ConfigFileLoader::save(&mut reloaded, Some(&path2)).unwrap();

    let doc1: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path1).unwrap()).unwrap();
    let doc2: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path2).unwrap()).unwrap();
    assert_eq!(doc1, doc2);
}

#[test]
#[serial]
fn test_loaded_variables_substitute_against_cfg_dir() {
    let _rx = setup_runtime();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conf.json");

    let mut config = build_config();
    ConfigFileLoader::save(&mut config, Some(&path)).unwrap();

    let mut reloaded = Configuration::new();
    ConfigFileLoader::load(&mut reloaded, &path).unwrap();
    let recdir = reloaded
        .property_collection()
        .variables()
        .get("RECDIR")
        .unwrap();
    let expected = dir
        .path()
        .canonicalize()
        .unwrap()
        .join("recordings")
        .to_string_lossy()
        .into_owned();
    assert_eq!(recdir, expected);
}

#[test]
#[serial]
fn test_reloaded_application_is_runnable() {
    let rx = setup_runtime();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conf.json");

    let mut config = build_config();
    ConfigFileLoader::save(&mut config, Some(&path)).unwrap();
    drop(config);

    let mut reloaded = Configuration::new();
    ConfigFileLoader::load(&mut reloaded, &path).unwrap();
    // run everything on the main thread for the smoke test
    reloaded.set_single_threaded(true);
    let app_name = reloaded.application_names()[0].clone();
    common::activate_and_run(&mut reloaded, &app_name, std::time::Duration::from_secs(1));
    let records = common::drain(&rx);
    assert!(
        !records.is_empty(),
        "expected samples to flow through the reloaded application"
    );
    reloaded.active_application().unwrap().shutdown().unwrap();
}
