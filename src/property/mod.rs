//! The property and variable subsystem parameterizing filters.
//!
//! Property collections form a tree mirroring the configuration structure;
//! each collection owns typed properties with handlers for validation and
//! persistence, and a [`Variables`] scope used for `${NAME}` substitution
//! in string values.

pub mod collection;
pub mod handlers;
pub mod variables;

pub use collection::{PropertyCollection, PropertyDetails};
pub use handlers::{PropertyHandler, PropertyValue};
pub use variables::Variables;
