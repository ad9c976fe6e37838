//! The filter extension point and its state machine.
//!
//! User filters implement [`Filter`] and are driven by the framework through
//! the lifecycle callbacks and [`Filter::on_port_data_changed`]. All
//! callbacks return [`Result`]; a failing callback is logged by the
//! framework and the filter's state reverts to the pre-transition state.

use crate::environment::{FilterContext, InputPortRef};
use crate::error::Result;

/// The states a filter (and the active application) passes through.
///
/// The forward order is CONSTRUCTING → CONSTRUCTED → INITIALIZING →
/// INITIALIZED → OPENING → OPENED → STARTING → ACTIVE; teardown retraces
/// the chain through STOPPING, CLOSING, DEINITIALIZING and DESTRUCTING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterState {
    Constructing,
    Constructed,
    Initializing,
    Initialized,
    Opening,
    Opened,
    Starting,
    Active,
    Stopping,
    Closing,
    Deinitializing,
    Destructing,
    Destructed,
}

impl FilterState {
    /// The canonical upper-case name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            FilterState::Constructing => "CONSTRUCTING",
            FilterState::Constructed => "CONSTRUCTED",
            FilterState::Initializing => "INITIALIZING",
            FilterState::Initialized => "INITIALIZED",
            FilterState::Opening => "OPENING",
            FilterState::Opened => "OPENED",
            FilterState::Starting => "STARTING",
            FilterState::Active => "ACTIVE",
            FilterState::Stopping => "STOPPING",
            FilterState::Closing => "CLOSING",
            FilterState::Deinitializing => "DEINITIALIZING",
            FilterState::Destructing => "DESTRUCTING",
            FilterState::Destructed => "DESTRUCTED",
        }
    }
}

impl std::fmt::Display for FilterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The coordinated operations broadcast by the active application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Init,
    Open,
    Start,
    Stop,
    Close,
    Deinit,
    Destruct,
}

impl Operation {
    /// The transitional state entered while the operation runs, or `None`
    /// for the construction/destruction endpoints.
    pub fn transitional_state(self) -> Option<FilterState> {
        match self {
            Operation::Create => None,
            Operation::Init => Some(FilterState::Initializing),
            Operation::Open => Some(FilterState::Opening),
            Operation::Start => Some(FilterState::Starting),
            Operation::Stop => Some(FilterState::Stopping),
            Operation::Close => Some(FilterState::Closing),
            Operation::Deinit => Some(FilterState::Deinitializing),
            Operation::Destruct => None,
        }
    }

    /// `(source, target)` states of the transition.
    pub fn states(self) -> (FilterState, FilterState) {
        match self {
            Operation::Create => (FilterState::Constructing, FilterState::Constructed),
            Operation::Init => (FilterState::Constructed, FilterState::Initialized),
            Operation::Open => (FilterState::Initialized, FilterState::Opened),
            Operation::Start => (FilterState::Opened, FilterState::Active),
            Operation::Stop => (FilterState::Active, FilterState::Opened),
            Operation::Close => (FilterState::Opened, FilterState::Initialized),
            Operation::Deinit => (FilterState::Initialized, FilterState::Constructed),
            Operation::Destruct => (FilterState::Constructed, FilterState::Destructed),
        }
    }

    /// Operation name as broadcast to the threads.
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Init => "init",
            Operation::Open => "open",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Close => "close",
            Operation::Deinit => "deinit",
            Operation::Destruct => "destruct",
        }
    }
}

/// A dataflow filter.
///
/// Filters are created by a factory function which registers static ports
/// and defines properties, and are afterwards driven exclusively on their
/// bound thread. A minimal pass-through filter:
///
/// ```ignore
/// struct PassThrough { inp: InputPortRef, out: OutputPortRef }
///
/// fn pass_through(ctx: &mut FilterCreationContext) -> Result<Box<dyn Filter>> {
///     let inp = ctx.add_static_input_port("inPort")?;
///     let out = ctx.add_static_output_port("outPort")?;
///     Ok(Box::new(PassThrough { inp, out }))
/// }
///
/// impl Filter for PassThrough {
///     fn on_port_data_changed(&mut self, ctx: &mut FilterContext, port: InputPortRef) -> Result<()> {
///         let sample = ctx.get_data(port, 0)?;
///         ctx.transmit(self.out, sample)
///     }
/// }
/// ```
#[allow(unused_variables)]
pub trait Filter: Send {
    /// Initialization related to dynamic ports. Dynamic ports are complete
    /// when this is called.
    fn on_init(&mut self, ctx: &mut FilterContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Acquire resources needed to run the filter (open files, connect to
    /// services etc.).
    fn on_open(&mut self, ctx: &mut FilterContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Reset internal state before data starts flowing.
    fn on_start(&mut self, ctx: &mut FilterContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Called exactly once for each data sample arriving at an input port.
    fn on_port_data_changed(
        &mut self,
        ctx: &mut FilterContext<'_>,
        port: InputPortRef,
    ) -> Result<()> {
        Ok(())
    }

    /// Called when a timer started with [`FilterContext::start_timer`]
    /// elapses. Timers only fire while the filter is ACTIVE.
    fn on_timer(&mut self, ctx: &mut FilterContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Opposite of [`Filter::on_start`].
    fn on_stop(&mut self, ctx: &mut FilterContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Opposite of [`Filter::on_open`].
    fn on_close(&mut self, ctx: &mut FilterContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Opposite of [`Filter::on_init`].
    fn on_deinit(&mut self, ctx: &mut FilterContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Suggested names for dynamic ports, e.g. the streams contained in a
    /// recording. Returns `(input_names, output_names)`.
    fn on_suggest_dynamic_ports(&self) -> (Vec<String>, Vec<String>) {
        (Vec::new(), Vec::new())
    }
}
