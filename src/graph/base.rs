//! The basic directed multigraph of named nodes with input/output ports.
//!
//! All mutating operations are validated and emit [`GraphEvent`]s to the
//! registered observers. Renames rewrite the affected connections
//! atomically. Nodes can be protected against rename and deletion (used
//! for the composite boundary nodes).

use std::collections::{HashMap, HashSet};

use crate::error::{NexxTError, Result};

/// Default width annotation of new connections (one in-flight sample).
pub const DEFAULT_CONNECTION_WIDTH: usize = 1;

/// Properties attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnProperties {
    /// Queue sizing annotation; width 0 declares a non-blocking edge which
    /// is ignored by deadlock detection.
    pub width: usize,
}

impl Default for ConnProperties {
    fn default() -> Self {
        Self {
            width: DEFAULT_CONNECTION_WIDTH,
        }
    }
}

/// Change notifications emitted by the graph.
#[derive(Debug, Clone)]
pub enum GraphEvent {
    NodeAdded(String),
    NodeRenamed(String, String),
    NodeDeleted(String),
    InPortAdded(String, String),
    InPortRenamed(String, String, String),
    InPortDeleted(String, String),
    OutPortAdded(String, String),
    OutPortRenamed(String, String, String),
    OutPortDeleted(String, String),
    ConnectionAdded(String, String, String, String),
    ConnectionDeleted(String, String, String, String),
    DirtyChanged,
}

#[derive(Default)]
struct NodePorts {
    inports: Vec<String>,
    outports: Vec<String>,
}

type Observer = Box<dyn Fn(&GraphEvent) + Send + Sync>;

/// A connection as a `(from_node, from_port, to_node, to_port)` tuple.
pub type ConnectionTuple = (String, String, String, String);

/// A graph where nodes have input and output ports which can be connected
/// together.
#[derive(Default)]
pub struct BaseGraph {
    // insertion ordered for deterministic save files
    node_order: Vec<String>,
    nodes: HashMap<String, NodePorts>,
    connections: Vec<ConnectionTuple>,
    connection_props: HashMap<ConnectionTuple, ConnProperties>,
    protected: HashSet<String>,
    observers: Vec<Observer>,
}

impl BaseGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for graph change events.
    pub fn subscribe(&mut self, observer: Observer) {
        self.observers.push(observer);
    }

    fn emit(&self, event: GraphEvent) {
        for obs in &self.observers {
            obs(&event);
        }
        for obs in &self.observers {
            obs(&GraphEvent::DirtyChanged);
        }
    }

    /// Given a suggested node name, return a unique node name based on it.
    pub fn unique_node_name(&self, suggestion: &str) -> String {
        if !self.nodes.contains_key(suggestion) {
            return suggestion.to_string();
        }
        let mut t = 2;
        while self.nodes.contains_key(&format!("{suggestion}{t}")) {
            t += 1;
        }
        format!("{suggestion}{t}")
    }

    /// Protect a node against rename and deletion.
    pub fn protect(&mut self, name: &str) -> Result<()> {
        if !self.nodes.contains_key(name) {
            return Err(NexxTError::NodeNotFound(name.to_string()));
        }
        self.protected.insert(name.to_string());
        Ok(())
    }

    pub fn is_protected(&self, name: &str) -> bool {
        self.protected.contains(name)
    }

    /// Add a new node to the graph.
    pub fn add_node(&mut self, name: &str) -> Result<()> {
        if self.nodes.contains_key(name) {
            return Err(NexxTError::NodeExists(name.to_string()));
        }
        self.nodes.insert(name.to_string(), NodePorts::default());
        self.node_order.push(name.to_string());
        self.emit(GraphEvent::NodeAdded(name.to_string()));
        Ok(())
    }

    /// Rename a node; connections are rewritten atomically.
    pub fn rename_node(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        if !self.nodes.contains_key(old_name) {
            return Err(NexxTError::NodeNotFound(old_name.to_string()));
        }
        if self.nodes.contains_key(new_name) {
            return Err(NexxTError::NodeExists(new_name.to_string()));
        }
        if self.protected.contains(old_name) {
            return Err(NexxTError::NodeProtected(old_name.to_string()));
        }
        let ports = self.nodes.remove(old_name).expect("checked above");
        self.nodes.insert(new_name.to_string(), ports);
        if let Some(pos) = self.node_order.iter().position(|n| n == old_name) {
            self.node_order[pos] = new_name.to_string();
        }
        for i in 0..self.connections.len() {
            let old_conn = self.connections[i].clone();
            let mut conn = old_conn.clone();
            if conn.0 == old_name {
                conn.0 = new_name.to_string();
            }
            if conn.2 == old_name {
                conn.2 = new_name.to_string();
            }
            if conn != old_conn {
                let props = self
                    .connection_props
                    .remove(&old_conn)
                    .unwrap_or_default();
                self.connection_props.insert(conn.clone(), props);
                self.connections[i] = conn;
            }
        }
        self.emit(GraphEvent::NodeRenamed(
            old_name.to_string(),
            new_name.to_string(),
        ));
        Ok(())
    }

    /// Delete a node; its ports and connections are deleted as well.
    pub fn delete_node(&mut self, name: &str) -> Result<()> {
        if !self.nodes.contains_key(name) {
            return Err(NexxTError::NodeNotFound(name.to_string()));
        }
        if self.protected.contains(name) {
            return Err(NexxTError::NodeProtected(name.to_string()));
        }
        let inports = self.nodes[name].inports.clone();
        for port in inports.iter().rev() {
            self.delete_input_port(name, port)?;
        }
        let outports = self.nodes[name].outports.clone();
        for port in outports.iter().rev() {
            self.delete_output_port(name, port)?;
        }
        self.nodes.remove(name);
        self.node_order.retain(|n| n != name);
        self.emit(GraphEvent::NodeDeleted(name.to_string()));
        Ok(())
    }

    /// Add a connection between an existing output and input port.
    pub fn add_connection(
        &mut self,
        from_node: &str,
        from_port: &str,
        to_node: &str,
        to_port: &str,
    ) -> Result<()> {
        if !self.nodes.contains_key(from_node) {
            return Err(NexxTError::NodeNotFound(from_node.to_string()));
        }
        if !self.nodes.contains_key(to_node) {
            return Err(NexxTError::NodeNotFound(to_node.to_string()));
        }
        if !self.nodes[from_node].outports.iter().any(|p| p == from_port) {
            return Err(NexxTError::PortNotFound {
                node: from_node.to_string(),
                port: from_port.to_string(),
                direction: "Output",
            });
        }
        if !self.nodes[to_node].inports.iter().any(|p| p == to_port) {
            return Err(NexxTError::PortNotFound {
                node: to_node.to_string(),
                port: to_port.to_string(),
                direction: "Input",
            });
        }
        let conn = (
            from_node.to_string(),
            from_port.to_string(),
            to_node.to_string(),
            to_port.to_string(),
        );
        if self.connections.contains(&conn) {
            return Err(NexxTError::ConnectionExists {
                from_node: from_node.to_string(),
                from_port: from_port.to_string(),
                to_node: to_node.to_string(),
                to_port: to_port.to_string(),
            });
        }
        self.connections.push(conn.clone());
        self.connection_props
            .insert(conn.clone(), ConnProperties::default());
        self.emit(GraphEvent::ConnectionAdded(conn.0, conn.1, conn.2, conn.3));
        Ok(())
    }

    /// Remove a connection from the graph.
    pub fn delete_connection(
        &mut self,
        from_node: &str,
        from_port: &str,
        to_node: &str,
        to_port: &str,
    ) -> Result<()> {
        let conn = (
            from_node.to_string(),
            from_port.to_string(),
            to_node.to_string(),
            to_port.to_string(),
        );
        let idx = self.connections.iter().position(|c| c == &conn).ok_or(
            NexxTError::ConnectionNotFound {
                from_node: from_node.to_string(),
                from_port: from_port.to_string(),
                to_node: to_node.to_string(),
                to_port: to_port.to_string(),
            },
        )?;
        self.connections.remove(idx);
        self.connection_props.remove(&conn);
        self.emit(GraphEvent::ConnectionDeleted(
            conn.0, conn.1, conn.2, conn.3,
        ));
        Ok(())
    }

    /// Add an input port to a node.
    pub fn add_input_port(&mut self, node: &str, port: &str) -> Result<()> {
        let ports = self
            .nodes
            .get_mut(node)
            .ok_or_else(|| NexxTError::NodeNotFound(node.to_string()))?;
        if ports.inports.iter().any(|p| p == port) {
            return Err(NexxTError::PortExists {
                node: node.to_string(),
                port: port.to_string(),
                direction: "Input",
            });
        }
        ports.inports.push(port.to_string());
        self.emit(GraphEvent::InPortAdded(node.to_string(), port.to_string()));
        Ok(())
    }

    /// Remove an input port; connections to it are deleted as required.
    pub fn delete_input_port(&mut self, node: &str, port: &str) -> Result<()> {
        if !self.nodes.contains_key(node) {
            return Err(NexxTError::NodeNotFound(node.to_string()));
        }
        if !self.nodes[node].inports.iter().any(|p| p == port) {
            return Err(NexxTError::PortNotFound {
                node: node.to_string(),
                port: port.to_string(),
                direction: "Input",
            });
        }
        let to_del: Vec<ConnectionTuple> = self
            .connections
            .iter()
            .filter(|c| c.2 == node && c.3 == port)
            .cloned()
            .collect();
        for c in to_del {
            self.delete_connection(&c.0, &c.1, &c.2, &c.3)?;
        }
        self.nodes
            .get_mut(node)
            .expect("checked above")
            .inports
            .retain(|p| p != port);
        self.emit(GraphEvent::InPortDeleted(
            node.to_string(),
            port.to_string(),
        ));
        Ok(())
    }

    /// Rename an input port; connections are rewritten as needed.
    pub fn rename_input_port(&mut self, node: &str, old_port: &str, new_port: &str) -> Result<()> {
        if !self.nodes.contains_key(node) {
            return Err(NexxTError::NodeNotFound(node.to_string()));
        }
        let inports = &self.nodes[node].inports;
        if !inports.iter().any(|p| p == old_port) {
            if inports.iter().any(|p| p == new_port) {
                // already renamed
                return Ok(());
            }
            return Err(NexxTError::PortNotFound {
                node: node.to_string(),
                port: old_port.to_string(),
                direction: "Input",
            });
        }
        if inports.iter().any(|p| p == new_port) {
            return Err(NexxTError::PortExists {
                node: node.to_string(),
                port: new_port.to_string(),
                direction: "Input",
            });
        }
        let ports = self.nodes.get_mut(node).expect("checked above");
        if let Some(idx) = ports.inports.iter().position(|p| p == old_port) {
            ports.inports[idx] = new_port.to_string();
        }
        for i in 0..self.connections.len() {
            let old_conn = self.connections[i].clone();
            if old_conn.2 == node && old_conn.3 == old_port {
                let mut conn = old_conn.clone();
                conn.3 = new_port.to_string();
                let props = self
                    .connection_props
                    .remove(&old_conn)
                    .unwrap_or_default();
                self.connection_props.insert(conn.clone(), props);
                self.connections[i] = conn;
            }
        }
        self.emit(GraphEvent::InPortRenamed(
            node.to_string(),
            old_port.to_string(),
            new_port.to_string(),
        ));
        Ok(())
    }

    /// Add an output port to a node.
    pub fn add_output_port(&mut self, node: &str, port: &str) -> Result<()> {
        let ports = self
            .nodes
            .get_mut(node)
            .ok_or_else(|| NexxTError::NodeNotFound(node.to_string()))?;
        if ports.outports.iter().any(|p| p == port) {
            return Err(NexxTError::PortExists {
                node: node.to_string(),
                port: port.to_string(),
                direction: "Output",
            });
        }
        ports.outports.push(port.to_string());
        self.emit(GraphEvent::OutPortAdded(node.to_string(), port.to_string()));
        Ok(())
    }

    /// Remove an output port; connections from it are deleted as needed.
    pub fn delete_output_port(&mut self, node: &str, port: &str) -> Result<()> {
        if !self.nodes.contains_key(node) {
            return Err(NexxTError::NodeNotFound(node.to_string()));
        }
        if !self.nodes[node].outports.iter().any(|p| p == port) {
            return Err(NexxTError::PortNotFound {
                node: node.to_string(),
                port: port.to_string(),
                direction: "Output",
            });
        }
        let to_del: Vec<ConnectionTuple> = self
            .connections
            .iter()
            .filter(|c| c.0 == node && c.1 == port)
            .cloned()
            .collect();
        for c in to_del {
            self.delete_connection(&c.0, &c.1, &c.2, &c.3)?;
        }
        self.nodes
            .get_mut(node)
            .expect("checked above")
            .outports
            .retain(|p| p != port);
        self.emit(GraphEvent::OutPortDeleted(
            node.to_string(),
            port.to_string(),
        ));
        Ok(())
    }

    /// Rename an output port; connections are rewritten as needed.
    pub fn rename_output_port(&mut self, node: &str, old_port: &str, new_port: &str) -> Result<()> {
        if !self.nodes.contains_key(node) {
            return Err(NexxTError::NodeNotFound(node.to_string()));
        }
        let outports = &self.nodes[node].outports;
        if !outports.iter().any(|p| p == old_port) {
            if outports.iter().any(|p| p == new_port) {
                // already renamed
                return Ok(());
            }
            return Err(NexxTError::PortNotFound {
                node: node.to_string(),
                port: old_port.to_string(),
                direction: "Output",
            });
        }
        if outports.iter().any(|p| p == new_port) {
            return Err(NexxTError::PortExists {
                node: node.to_string(),
                port: new_port.to_string(),
                direction: "Output",
            });
        }
        let ports = self.nodes.get_mut(node).expect("checked above");
        if let Some(idx) = ports.outports.iter().position(|p| p == old_port) {
            ports.outports[idx] = new_port.to_string();
        }
        for i in 0..self.connections.len() {
            let old_conn = self.connections[i].clone();
            if old_conn.0 == node && old_conn.1 == old_port {
                let mut conn = old_conn.clone();
                conn.1 = new_port.to_string();
                let props = self
                    .connection_props
                    .remove(&old_conn)
                    .unwrap_or_default();
                self.connection_props.insert(conn.clone(), props);
                self.connections[i] = conn;
            }
        }
        self.emit(GraphEvent::OutPortRenamed(
            node.to_string(),
            old_port.to_string(),
            new_port.to_string(),
        ));
        Ok(())
    }

    /// All node names in insertion order.
    pub fn all_nodes(&self) -> Vec<String> {
        self.node_order.clone()
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// All connections.
    pub fn all_connections(&self) -> Vec<ConnectionTuple> {
        self.connections.clone()
    }

    /// All connections ending at the specified input port.
    pub fn all_connections_to_input_port(&self, to_node: &str, to_port: &str) -> Vec<ConnectionTuple> {
        self.connections
            .iter()
            .filter(|c| c.2 == to_node && c.3 == to_port)
            .cloned()
            .collect()
    }

    /// All connections starting at the specified output port.
    pub fn all_connections_from_output_port(
        &self,
        from_node: &str,
        from_port: &str,
    ) -> Vec<ConnectionTuple> {
        self.connections
            .iter()
            .filter(|c| c.0 == from_node && c.1 == from_port)
            .cloned()
            .collect()
    }

    /// The properties of the specified connection.
    pub fn get_connection_properties(
        &self,
        from_node: &str,
        from_port: &str,
        to_node: &str,
        to_port: &str,
    ) -> Result<ConnProperties> {
        let conn = (
            from_node.to_string(),
            from_port.to_string(),
            to_node.to_string(),
            to_port.to_string(),
        );
        self.connection_props
            .get(&conn)
            .cloned()
            .ok_or(NexxTError::ConnectionNotFound {
                from_node: from_node.to_string(),
                from_port: from_port.to_string(),
                to_node: to_node.to_string(),
                to_port: to_port.to_string(),
            })
    }

    /// Replace the properties of the specified connection.
    pub fn set_connection_properties(
        &mut self,
        from_node: &str,
        from_port: &str,
        to_node: &str,
        to_port: &str,
        properties: ConnProperties,
    ) -> Result<()> {
        let conn = (
            from_node.to_string(),
            from_port.to_string(),
            to_node.to_string(),
            to_port.to_string(),
        );
        match self.connection_props.get_mut(&conn) {
            Some(props) => {
                *props = properties;
                self.emit(GraphEvent::DirtyChanged);
                Ok(())
            }
            None => Err(NexxTError::ConnectionNotFound {
                from_node: from_node.to_string(),
                from_port: from_port.to_string(),
                to_node: to_node.to_string(),
                to_port: to_port.to_string(),
            }),
        }
    }

    /// All input port names of a node.
    pub fn all_input_ports(&self, node: &str) -> Result<Vec<String>> {
        self.nodes
            .get(node)
            .map(|n| n.inports.clone())
            .ok_or_else(|| NexxTError::NodeNotFound(node.to_string()))
    }

    /// All output port names of a node.
    pub fn all_output_ports(&self, node: &str) -> Result<Vec<String>> {
        self.nodes
            .get(node)
            .map(|n| n.outports.clone())
            .ok_or_else(|| NexxTError::NodeNotFound(node.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_graph() -> BaseGraph {
        let mut g = BaseGraph::new();
        g.add_node("a").unwrap();
        g.add_node("b").unwrap();
        g.add_output_port("a", "out").unwrap();
        g.add_input_port("b", "in").unwrap();
        g.add_connection("a", "out", "b", "in").unwrap();
        g
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut g = simple_graph();
        assert!(matches!(g.add_node("a"), Err(NexxTError::NodeExists(_))));
    }

    #[test]
    fn test_unique_node_name() {
        let g = simple_graph();
        assert_eq!(g.unique_node_name("c"), "c");
        assert_eq!(g.unique_node_name("a"), "a2");
    }

    #[test]
    fn test_duplicate_connection_rejected() {
        let mut g = simple_graph();
        assert!(matches!(
            g.add_connection("a", "out", "b", "in"),
            Err(NexxTError::ConnectionExists { .. })
        ));
    }

    #[test]
    fn test_connection_validates_ports() {
        let mut g = simple_graph();
        assert!(matches!(
            g.add_connection("a", "missing", "b", "in"),
            Err(NexxTError::PortNotFound { .. })
        ));
        assert!(matches!(
            g.add_connection("missing", "out", "b", "in"),
            Err(NexxTError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_rename_rewrites_connections() {
        let mut g = simple_graph();
        g.set_connection_properties("a", "out", "b", "in", ConnProperties { width: 3 })
            .unwrap();
        g.rename_node("a", "src").unwrap();
        assert_eq!(
            g.all_connections(),
            vec![(
                "src".to_string(),
                "out".to_string(),
                "b".to_string(),
                "in".to_string()
            )]
        );
        let props = g.get_connection_properties("src", "out", "b", "in").unwrap();
        assert_eq!(props.width, 3);
    }

    #[test]
    fn test_rename_port_rewrites_connections() {
        let mut g = simple_graph();
        g.rename_output_port("a", "out", "result").unwrap();
        g.rename_input_port("b", "in", "data").unwrap();
        assert_eq!(
            g.all_connections(),
            vec![(
                "a".to_string(),
                "result".to_string(),
                "b".to_string(),
                "data".to_string()
            )]
        );
    }

    #[test]
    fn test_delete_node_cascades() {
        let mut g = simple_graph();
        g.delete_node("a").unwrap();
        assert!(g.all_connections().is_empty());
        assert!(!g.has_node("a"));
        assert!(g.has_node("b"));
    }

    #[test]
    fn test_protected_nodes() {
        let mut g = simple_graph();
        g.protect("a").unwrap();
        assert!(matches!(
            g.rename_node("a", "x"),
            Err(NexxTError::NodeProtected(_))
        ));
        assert!(matches!(
            g.delete_node("a"),
            Err(NexxTError::NodeProtected(_))
        ));
    }

    #[test]
    fn test_delete_port_cascades_connections() {
        let mut g = simple_graph();
        g.delete_input_port("b", "in").unwrap();
        assert!(g.all_connections().is_empty());
        assert!(g.all_input_ports("b").unwrap().is_empty());
    }

    #[test]
    fn test_connection_queries() {
        let g = simple_graph();
        assert_eq!(g.all_connections_from_output_port("a", "out").len(), 1);
        assert_eq!(g.all_connections_to_input_port("b", "in").len(), 1);
        assert_eq!(g.all_connections_to_input_port("b", "other").len(), 0);
    }

    #[test]
    fn test_observer_events() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        let mut g = BaseGraph::new();
        let adds = Arc::new(AtomicUsize::new(0));
        let adds2 = Arc::clone(&adds);
        g.subscribe(Box::new(move |ev| {
            if matches!(ev, GraphEvent::NodeAdded(_)) {
                adds2.fetch_add(1, Ordering::SeqCst);
            }
        }));
        g.add_node("x").unwrap();
        g.add_node("y").unwrap();
        assert_eq!(adds.load(Ordering::SeqCst), 2);
    }
}
