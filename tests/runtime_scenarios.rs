//! End-to-end scenarios: rate limiting through a blocking sink, bounded
//! inter-thread queues and deterministic shutdown.

mod common;

use std::time::Duration;

use serial_test::serial;

use common::{activate_and_run, build_chain, drain, intervals, setup_runtime};
use nexxt::config::Configuration;
use nexxt::FilterState;

#[test]
#[serial]
fn test_intra_thread_chain_is_rate_limited_by_sink() {
    let rx = setup_runtime();
    let mut config = Configuration::new();
    // 4 Hz source, 0.5 s sink processing time, both on the main thread
    let app = build_chain(&mut config, "main", "main", 4.0, 0.5);
    activate_and_run(&mut config, &app, Duration::from_secs(2));

    let records = drain(&rx);
    // the sink's sleep blocks the shared thread, limiting the effective
    // rate to ~2 Hz
    assert!(
        records.len() >= 3,
        "expected at least 3 samples, got {}",
        records.len()
    );
    assert!(
        records.len() <= 6,
        "expected at most 6 samples, got {}",
        records.len()
    );
    for dt in intervals(&records) {
        assert!(
            (0.3..=0.9).contains(&dt),
            "inter-arrival time {} outside [0.3, 0.9]",
            dt
        );
    }

    config.active_application().unwrap().shutdown().unwrap();
    assert_eq!(
        config.active_application().unwrap().get_state(),
        FilterState::Destructed
    );
}

#[test]
#[serial]
fn test_inter_thread_chain_applies_backpressure() {
    let rx = setup_runtime();
    let mut config = Configuration::new();
    // source and sink in separate threads, queue size 1 on the sink
    let app = build_chain(&mut config, "src", "snk", 4.0, 0.5);
    activate_and_run(&mut config, &app, Duration::from_millis(2500));

    let records = drain(&rx);
    assert!(
        records.len() >= 3,
        "expected at least 3 samples, got {}",
        records.len()
    );
    assert!(
        records.len() <= 7,
        "expected at most 7 samples, got {}",
        records.len()
    );
    // the sink processes one sample per ~0.5 s; the producer backpressures
    // through the connection semaphore
    for dt in intervals(&records) {
        assert!(
            (0.3..=0.9).contains(&dt),
            "inter-arrival time {} outside [0.3, 0.9]",
            dt
        );
    }

    config.active_application().unwrap().shutdown().unwrap();
}

#[test]
#[serial]
fn test_shutdown_is_idempotent() {
    let _rx = setup_runtime();
    let mut config = Configuration::new();
    let app = build_chain(&mut config, "main", "worker", 4.0, 0.0);
    config.activate(&app).unwrap();
    let active = config.active_application().unwrap();
    active.init().unwrap();
    active.open().unwrap();
    active.start().unwrap();
    active.process_events(Duration::from_millis(300));

    active.shutdown().unwrap();
    assert_eq!(active.get_state(), FilterState::Destructed);
    // calling it again from DESTRUCTED changes nothing
    active.shutdown().unwrap();
    assert_eq!(active.get_state(), FilterState::Destructed);
}

#[test]
#[serial]
fn test_lifecycle_states_advance_in_order() {
    let _rx = setup_runtime();
    let mut config = Configuration::new();
    let app = build_chain(&mut config, "main", "main", 4.0, 0.0);
    config.activate(&app).unwrap();
    let active = config.active_application().unwrap();
    assert_eq!(active.get_state(), FilterState::Constructed);
    active.init().unwrap();
    assert_eq!(active.get_state(), FilterState::Initialized);
    active.open().unwrap();
    assert_eq!(active.get_state(), FilterState::Opened);
    active.start().unwrap();
    assert_eq!(active.get_state(), FilterState::Active);
    // operations out of order are rejected
    assert!(active.init().is_err());
    assert!(active.open().is_err());
    active.stop().unwrap();
    assert_eq!(active.get_state(), FilterState::Opened);
    active.close().unwrap();
    assert_eq!(active.get_state(), FilterState::Initialized);
    active.deinit().unwrap();
    assert_eq!(active.get_state(), FilterState::Constructed);
    active.destruct().unwrap();
    assert_eq!(active.get_state(), FilterState::Destructed);
}
