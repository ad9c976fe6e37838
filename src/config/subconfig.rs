//! A subconfiguration: a named filter graph with its property collection.
//!
//! Subconfigurations come in two shapes, applications and composite
//! filters, and share the JSON (de)serialization implemented here.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::config::composite::CompositeFilter;
use crate::error::{NexxTError, Result};
use crate::graph::{CompositeRole, FilterGraph, LibraryRef};
use crate::ports::PortDirection;
use crate::property::collection::check_identifier;
use crate::property::PropertyCollection;

/// Lookup callback resolving composite names during load.
pub type CompositeLookup<'a> = dyn FnMut(&str) -> Result<Arc<CompositeFilter>> + 'a;

/// A named graph with a root property collection.
pub struct SubConfiguration {
    name: String,
    props: Arc<PropertyCollection>,
    graph: FilterGraph,
}

impl SubConfiguration {
    pub fn new(name: &str, config_props: &Arc<PropertyCollection>) -> Result<Self> {
        check_identifier(name)?;
        let props = PropertyCollection::new_child(config_props, name, None)?;
        let graph = FilterGraph::new(Arc::clone(&props));
        Ok(Self {
            name: name.to_string(),
            props,
            graph,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: &str) -> Result<()> {
        check_identifier(name)?;
        if let Some(parent) = self.props.parent() {
            parent.rename_child(&self.name, name)?;
        }
        self.name = name.to_string();
        Ok(())
    }

    pub fn property_collection(&self) -> &Arc<PropertyCollection> {
        &self.props
    }

    pub fn graph(&self) -> &FilterGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut FilterGraph {
        &mut self.graph
    }

    pub(crate) fn parse_connection(con: &str) -> Result<(String, String, String, String)> {
        let err = || NexxTError::Config(format!("invalid connection string '{}'", con));
        let (f, t) = con.split_once("->").ok_or_else(err)?;
        let (from_node, from_port) = f.trim().split_once('.').ok_or_else(err)?;
        let (to_node, to_port) = t.trim().split_once('.').ok_or_else(err)?;
        Ok((
            from_node.trim().to_string(),
            from_port.trim().to_string(),
            to_node.trim().to_string(),
            to_port.trim().to_string(),
        ))
    }

    fn format_connection(conn: &(String, String, String, String)) -> String {
        format!("{}.{} -> {}.{}", conn.0, conn.1, conn.2, conn.3)
    }

    /// Load graph and properties from a config dictionary (inverse of
    /// [`SubConfiguration::save`]).
    pub fn load(&mut self, cfg: &Value, composite_lookup: &mut CompositeLookup<'_>) -> Result<()> {
        if let Some(guistate) = cfg.get("_guiState").and_then(|v| v.as_object()) {
            if !guistate.is_empty() {
                let guistate_cc = self.props.get_or_create_child("_guiState");
                for (k, v) in guistate {
                    let loaded = v.as_object().cloned().unwrap_or_default();
                    PropertyCollection::new_child(&guistate_cc, k, Some(loaded))?;
                }
            }
        }
        let nodes = cfg
            .get("nodes")
            .and_then(|v| v.as_array())
            .ok_or_else(|| NexxTError::Config("subconfig without nodes".into()))?;
        for n in nodes {
            let name = n
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| NexxTError::Config("node without name".into()))?;
            let library = n
                .get("library")
                .and_then(|v| v.as_str())
                .ok_or_else(|| NexxTError::Config("node without library".into()))?;
            let factory = n
                .get("factoryFunction")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if let Some(kind) = library.strip_prefix("composite://") {
                match kind {
                    // the boundary nodes are already there
                    "port" => {}
                    "ref" => {
                        let cf = composite_lookup(factory)?;
                        let tmp = self.graph.add_node(
                            LibraryRef::CompositeRef(cf),
                            "compositeNode",
                            Some(name),
                        )?;
                        if tmp != name {
                            return Err(NexxTError::Internal(
                                "addNode has set unexpected name for node.".into(),
                            ));
                        }
                    }
                    other => {
                        return Err(NexxTError::Config(format!(
                            "unknown composite node kind '{}'",
                            other
                        )))
                    }
                }
            } else {
                let properties = n
                    .get("properties")
                    .and_then(|v| v.as_object())
                    .cloned()
                    .unwrap_or_default();
                let thread = n.get("thread").and_then(|v| v.as_str()).unwrap_or("main");
                let p = PropertyCollection::new_child(&self.props, name, Some(properties))?;
                let mut nexxt_loaded = Map::new();
                nexxt_loaded.insert("thread".into(), Value::String(thread.to_string()));
                PropertyCollection::new_child(&p, "_nexxT", Some(nexxt_loaded))?;
                tracing::debug!(
                    "loading: subconfig {} / node {} -> thread: {}",
                    self.name,
                    name,
                    thread
                );
                let tmp =
                    self.graph
                        .add_node(LibraryRef::Url(library.to_string()), factory, Some(name))?;
                if tmp != name {
                    return Err(NexxTError::Internal(
                        "addNode has set unexpected name for node.".into(),
                    ));
                }
            }
            for dip in n
                .get("dynamicInputPorts")
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
            {
                if let Some(port) = dip.as_str() {
                    self.graph.add_dynamic_input_port(name, port)?;
                }
            }
            for dop in n
                .get("dynamicOutputPorts")
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
            {
                if let Some(port) = dop.as_str() {
                    self.graph.add_dynamic_output_port(name, port)?;
                }
            }
        }
        for c in cfg
            .get("connections")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            let con = c
                .as_str()
                .ok_or_else(|| NexxTError::Config("connection is not a string".into()))?;
            let (fnode, fport, tnode, tport) = Self::parse_connection(con)?;
            self.graph
                .base_mut()
                .add_connection(&fnode, &fport, &tnode, &tport)?;
        }
        Ok(())
    }

    /// Save graph and properties to a config dictionary (inverse of
    /// [`SubConfiguration::load`]).
    pub fn save(&self) -> Result<Value> {
        let mut cfg = Map::new();
        cfg.insert("name".into(), Value::String(self.name.clone()));
        let mut guistate = Map::new();
        if let Ok(gs) = self.props.get_child_collection("_guiState") {
            for child in gs.children() {
                guistate.insert(child.name(), Value::Object(child.save_dict()));
            }
        }
        cfg.insert("_guiState".into(), Value::Object(guistate));
        let mut nodes = Vec::new();
        for name in self.graph.base().all_nodes() {
            let mockup = self.graph.get_mockup(&name)?;
            let mut ncfg = Map::new();
            ncfg.insert("name".into(), Value::String(name.clone()));
            let (library, factory) = match mockup.library() {
                LibraryRef::Url(url) => (url.clone(), mockup.factory_function().to_string()),
                LibraryRef::CompositeRef(cf) => ("composite://ref".to_string(), cf.name()),
                LibraryRef::CompositePort(CompositeRole::Input) => {
                    ("composite://port".to_string(), "CompositeInput".to_string())
                }
                LibraryRef::CompositePort(CompositeRole::Output) => {
                    ("composite://port".to_string(), "CompositeOutput".to_string())
                }
            };
            ncfg.insert("library".into(), Value::String(library));
            ncfg.insert("factoryFunction".into(), Value::String(factory));
            let dyn_in: Vec<String> = mockup
                .dynamic_port_infos()
                .iter()
                .filter(|p| p.direction == PortDirection::Input)
                .map(|p| p.name.clone())
                .collect();
            let dyn_out: Vec<String> = mockup
                .dynamic_port_infos()
                .iter()
                .filter(|p| p.direction == PortDirection::Output)
                .map(|p| p.name.clone())
                .collect();
            let static_in: Vec<String> = self
                .graph
                .base()
                .all_input_ports(&name)?
                .into_iter()
                .filter(|p| !dyn_in.contains(p))
                .collect();
            let static_out: Vec<String> = self
                .graph
                .base()
                .all_output_ports(&name)?
                .into_iter()
                .filter(|p| !dyn_out.contains(p))
                .collect();
            ncfg.insert("dynamicInputPorts".into(), json!(dyn_in));
            ncfg.insert("staticInputPorts".into(), json!(static_in));
            ncfg.insert("dynamicOutputPorts".into(), json!(dyn_out));
            ncfg.insert("staticOutputPorts".into(), json!(static_out));
            let p = self.props.get_child_collection(&name).ok();
            let thread = p
                .as_ref()
                .and_then(|p| p.get_child_collection("_nexxT").ok())
                .and_then(|n| n.get_property("thread").ok())
                .map(|v| v.to_string())
                .unwrap_or_else(|| "main".to_string());
            ncfg.insert("thread".into(), Value::String(thread));
            let properties = p.map(|p| p.save_dict()).unwrap_or_default();
            ncfg.insert("properties".into(), Value::Object(properties));
            nodes.push(Value::Object(ncfg));
        }
        cfg.insert("nodes".into(), Value::Array(nodes));
        let connections: Vec<Value> = self
            .graph
            .base()
            .all_connections()
            .iter()
            .map(|c| Value::String(Self::format_connection(c)))
            .collect();
        cfg.insert("connections".into(), Value::Array(connections));
        Ok(Value::Object(cfg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connection() {
        let parsed = SubConfiguration::parse_connection("a.out -> b.in").unwrap();
        assert_eq!(
            parsed,
            (
                "a".to_string(),
                "out".to_string(),
                "b".to_string(),
                "in".to_string()
            )
        );
        assert!(SubConfiguration::parse_connection("garbage").is_err());
        assert!(SubConfiguration::parse_connection("a.out -> b").is_err());
    }

    #[test]
    fn test_format_connection_round_trip() {
        let conn = (
            "src".to_string(),
            "out".to_string(),
            "snk".to_string(),
            "in".to_string(),
        );
        let s = SubConfiguration::format_connection(&conn);
        assert_eq!(SubConfiguration::parse_connection(&s).unwrap(), conn);
    }
}
