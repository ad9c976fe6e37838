//! Built-in demonstration filters.
//!
//! A minimal set of filters shipped with the runtime: a timer-driven
//! source, a pass-through and a collecting sink. They serve as living
//! examples of the filter API and drive the end-to-end tests.

pub mod simple;
pub mod tap;

pub use simple::{CollectingSink, PassThrough, PeriodicSource};
pub use tap::{SampleTap, TapRecord, SAMPLE_TAP_SERVICE};

use crate::plugins::PluginManager;

/// Register the built-in filters at the process-wide plugin registry.
/// Safe to call multiple times.
pub fn register_builtin() {
    let mgr = PluginManager::default();
    mgr.register_entry_point(
        "nexxt.filters.PeriodicSource",
        std::sync::Arc::new(simple::periodic_source),
    );
    mgr.register_entry_point(
        "nexxt.filters.PassThrough",
        std::sync::Arc::new(simple::pass_through),
    );
    mgr.register_entry_point(
        "nexxt.filters.CollectingSink",
        std::sync::Arc::new(simple::collecting_sink),
    );
}
