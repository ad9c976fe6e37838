//! Error handling for the nexxT runtime.
//!
//! All fallible framework APIs return [`Result`]. The variants cover the
//! configuration, state machine, property, plugin and concurrency error
//! classes; [`NexxTError::Internal`] is reserved for broken invariants.

use thiserror::Error;

use crate::filter::FilterState;

/// Main error type for nexxT operations.
#[derive(Error, Debug)]
pub enum NexxTError {
    /// A graph node with this name already exists.
    #[error("Node {0} already exists.")]
    NodeExists(String),

    /// A referenced graph node was not found.
    #[error("Node {0} not found.")]
    NodeNotFound(String),

    /// A protected node (composite boundary) cannot be renamed or deleted.
    #[error("Node {0} is protected and cannot be deleted or renamed.")]
    NodeProtected(String),

    /// A port with this name already exists on the node.
    #[error("{direction}Port {node}/{port} already exists.")]
    PortExists {
        node: String,
        port: String,
        direction: &'static str,
    },

    /// A referenced port was not found.
    #[error("{direction}Port {node}/{port} not found.")]
    PortNotFound {
        node: String,
        port: String,
        direction: &'static str,
    },

    /// No sample matching the requested delay is stored in the input queue.
    #[error("No data for port {port} at the requested delay.")]
    PortDataNotFound { port: String },

    /// A dynamic port was requested on a filter without dynamic port support.
    #[error("No dynamic {direction}Port support; port name: {port}")]
    DynamicPortUnsupported {
        port: String,
        direction: &'static str,
    },

    /// The connection is already present in the graph.
    #[error("Connection from {from_node}/{from_port} to {to_node}/{to_port} already exists.")]
    ConnectionExists {
        from_node: String,
        from_port: String,
        to_node: String,
        to_port: String,
    },

    /// The referenced connection is not present in the graph.
    #[error("Connection from {from_node}/{from_port} to {to_node}/{to_port} not found.")]
    ConnectionNotFound {
        from_node: String,
        from_port: String,
        to_node: String,
        to_port: String,
    },

    /// The plugin URL scheme is not supported.
    #[error("Don't know how to load library '{0}'.")]
    UnknownPluginType(String),

    /// Loading or instantiating a plugin failed.
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// An operation was requested in a state it is not allowed in.
    #[error("Operation '{operation}' cannot be performed in state {}", .state.as_str())]
    UnexpectedFilterState {
        state: FilterState,
        operation: String,
    },

    /// A state transition is invalid for the current state.
    #[error("Transition to {} cannot be performed in state {}", .to.as_str(), .from.as_str())]
    FilterStateMachine { from: FilterState, to: FilterState },

    /// A property collection child with this name already exists.
    #[error("PropertyCollection already has a child named {0}")]
    PropertyChildExists(String),

    /// The referenced property collection child was not found.
    #[error("PropertyCollection has no child named {0}")]
    PropertyChildNotFound(String),

    /// The referenced property was not found.
    #[error("PropertyCollection has no property named {0}")]
    PropertyNotFound(String),

    /// A value of an unsupported type was handed to the property system.
    #[error("PropertyCollection has been provided with an invalid typed value {0}")]
    PropertyUnknownType(String),

    /// A property value could not be parsed or validated.
    #[error("Property parsing error: {0}")]
    PropertyParsing(String),

    /// The same property was defined with differing default/help/handler.
    #[error("Inconsistent definitions for property named {0}")]
    PropertyInconsistentDefinition(String),

    /// A name does not match the identifier grammar.
    #[error("Invalid identifier '{0}'")]
    InvalidIdentifier(String),

    /// A composite filter directly or indirectly references itself.
    #[error("Composite filter '{0}' depends on itself.")]
    CompositeRecursion(String),

    /// A cycle was found in the thread graph during activation.
    #[error("This graph is not deadlock-safe. A cycle has been found in the thread graph: {0}")]
    PossibleDeadlock(String),

    /// Variable substitution exceeded the recursion limit.
    #[error("Recursion limit exceeded while substituting '{0}'.")]
    RecursionLimit(String),

    /// A variable marked readonly was written to.
    #[error("Trying to modify readonly variable {0}.")]
    ReadonlyVariable(String),

    /// A referenced variable does not exist in the scope chain.
    #[error("Variable {0} not found.")]
    VariableNotFound(String),

    /// A framework call was made from a thread it is not bound to.
    #[error("{0} has been called from an unexpected thread.")]
    WrongThread(&'static str),

    /// Errors related to configuration file handling.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic runtime error.
    #[error("{0}")]
    Runtime(String),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Raised when we found a bug in nexxT.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for nexxT operations.
pub type Result<T> = std::result::Result<T, NexxTError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NexxTError::NodeExists("source".into());
        assert_eq!(err.to_string(), "Node source already exists.");

        let err = NexxTError::PortNotFound {
            node: "source".into(),
            port: "out".into(),
            direction: "Output",
        };
        assert_eq!(err.to_string(), "OutputPort source/out not found.");
    }

    #[test]
    fn test_state_machine_error_display() {
        let err = NexxTError::FilterStateMachine {
            from: FilterState::Constructed,
            to: FilterState::Starting,
        };
        assert!(err.to_string().contains("STARTING"));
        assert!(err.to_string().contains("CONSTRUCTED"));
    }
}
