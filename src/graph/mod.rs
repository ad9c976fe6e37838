//! The graph model: nodes, ports, connections and the filter mockups
//! attached to them.

pub mod base;
pub mod filtergraph;

pub use base::{BaseGraph, ConnProperties, GraphEvent};
pub use filtergraph::{CompositeRole, FilterGraph, FilterMockup, LibraryRef};
