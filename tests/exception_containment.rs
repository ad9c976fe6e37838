//! A failing filter callback must not wedge the pipeline.

mod common;

use std::sync::Arc;

use serial_test::serial;

use common::setup_runtime;
use nexxt::config::Configuration;
use nexxt::environment::FilterContext;
use nexxt::filter::Filter;
use nexxt::graph::LibraryRef;
use nexxt::plugins::PluginManager;
use nexxt::{FilterState, NexxTError, Result};

struct FailOnInit;

impl Filter for FailOnInit {
    fn on_init(&mut self, _ctx: &mut FilterContext<'_>) -> Result<()> {
        Err(NexxTError::Runtime("simulated failure in onInit".into()))
    }
}

fn register_failing_filter() {
    PluginManager::default().register_entry_point(
        "tests.FailOnInit",
        Arc::new(|ctx: &mut nexxt::FilterCreationContext| {
            ctx.add_static_input_port("inPort")?;
            Ok(Box::new(FailOnInit) as Box<dyn Filter>)
        }),
    );
}

#[test]
#[serial]
fn test_failing_on_init_is_contained() {
    let _rx = setup_runtime();
    register_failing_filter();
    let mut config = Configuration::new();
    let app_name = config.add_new_application().unwrap();
    let app = config.application_by_name(&app_name).unwrap();
    app.graph_mut()
        .add_node(
            LibraryRef::Url("entry_point://tests.FailOnInit".into()),
            "FailOnInit",
            Some("failing"),
        )
        .unwrap();

    config.activate(&app_name).unwrap();
    let active = config.active_application().unwrap();
    assert_eq!(active.get_state(), FilterState::Constructed);

    // the error is caught and logged; the application does not advance
    active.init().unwrap();
    assert_eq!(active.get_state(), FilterState::Constructed);
    assert_eq!(
        active.get_filter("/failing").unwrap().state(),
        FilterState::Constructed
    );

    // deinit is rejected in this state
    assert!(matches!(
        active.deinit(),
        Err(NexxTError::FilterStateMachine { .. })
    ));

    // shutdown still reaches DESTRUCTED
    active.shutdown().unwrap();
    assert_eq!(active.get_state(), FilterState::Destructed);
}
