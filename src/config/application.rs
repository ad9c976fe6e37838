//! An application: an activatable top-level subconfiguration.

use std::sync::Arc;

use serde_json::Value;

use crate::config::subconfig::{CompositeLookup, SubConfiguration};
use crate::error::Result;
use crate::graph::FilterGraph;
use crate::property::PropertyCollection;

/// An activatable subgraph.
pub struct Application {
    sub: SubConfiguration,
}

impl Application {
    pub(crate) fn new(name: &str, config_props: &Arc<PropertyCollection>) -> Result<Self> {
        let sub = SubConfiguration::new(name, config_props)?;
        PropertyCollection::new_child(sub.property_collection(), "_guiState", None)?;
        Ok(Self { sub })
    }

    pub fn name(&self) -> &str {
        self.sub.name()
    }

    pub(crate) fn set_name(&mut self, name: &str) -> Result<()> {
        self.sub.set_name(name)
    }

    pub fn graph(&self) -> &FilterGraph {
        self.sub.graph()
    }

    pub fn graph_mut(&mut self) -> &mut FilterGraph {
        self.sub.graph_mut()
    }

    pub fn property_collection(&self) -> &Arc<PropertyCollection> {
        self.sub.property_collection()
    }

    /// The gui state collection of the entity referenced by `name`
    /// (a fully qualified filter name or a service name). Characters
    /// outside `[a-zA-Z0-9_]` are mapped to underscores.
    pub fn gui_state(&self, name: &str) -> Result<Arc<PropertyCollection>> {
        let sanitized: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        let gs = self.sub.property_collection().get_child_collection("_guiState")?;
        Ok(gs.get_or_create_child(&sanitized))
    }

    pub(crate) fn load(
        &mut self,
        cfg: &Value,
        composite_lookup: &mut CompositeLookup<'_>,
    ) -> Result<()> {
        self.sub.load(cfg, composite_lookup)
    }

    pub(crate) fn save(&self) -> Result<Value> {
        self.sub.save()
    }
}
