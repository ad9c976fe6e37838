//! Composite filters: reusable subgraphs exposed as filter nodes.
//!
//! A composite filter's graph carries two protected boundary nodes,
//! `CompositeInput` (dynamic output ports become the composite's logical
//! inputs) and `CompositeOutput` (dynamic input ports become the logical
//! outputs). Referencing nodes mirror the boundary ports as their static
//! ports; activation dissolves the boundaries entirely.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;

use crate::config::subconfig::{CompositeLookup, SubConfiguration};
use crate::error::{NexxTError, Result};
use crate::graph::{CompositeRole, LibraryRef};
use crate::ports::PortDirection;
use crate::property::PropertyCollection;

/// A reusable subgraph behaving like a filter.
pub struct CompositeFilter {
    // kept outside the subconfiguration lock so that recursion checks can
    // name a composite whose graph is currently locked
    name: RwLock<String>,
    sub: RwLock<SubConfiguration>,
}

impl CompositeFilter {
    /// Create a composite filter with its protected boundary nodes.
    pub(crate) fn create(
        name: &str,
        config_props: &Arc<PropertyCollection>,
    ) -> Result<Arc<Self>> {
        let sub = SubConfiguration::new(name, config_props)?;
        let cf = Arc::new_cyclic(|weak| {
            let mut sub = sub;
            sub.graph_mut().set_owner_composite(weak.clone());
            Self {
                name: RwLock::new(name.to_string()),
                sub: RwLock::new(sub),
            }
        });
        {
            let mut sub = cf.sub.write().unwrap();
            let cin = sub.graph_mut().add_node(
                LibraryRef::CompositePort(CompositeRole::Input),
                "CompositeInput",
                None,
            )?;
            let cout = sub.graph_mut().add_node(
                LibraryRef::CompositePort(CompositeRole::Output),
                "CompositeOutput",
                None,
            )?;
            if cin != "CompositeInput" || cout != "CompositeOutput" {
                return Err(NexxTError::Internal("unexpected node names.".into()));
            }
            // prevent renaming and deletion of these special nodes
            sub.graph_mut().base_mut().protect("CompositeInput")?;
            sub.graph_mut().base_mut().protect("CompositeOutput")?;
        }
        Ok(cf)
    }

    pub fn name(&self) -> String {
        self.name.read().unwrap().clone()
    }

    pub(crate) fn set_name(&self, name: &str) -> Result<()> {
        self.sub.write().unwrap().set_name(name)?;
        *self.name.write().unwrap() = name.to_string();
        Ok(())
    }

    /// Read access to the underlying subconfiguration.
    pub fn read(&self) -> RwLockReadGuard<'_, SubConfiguration> {
        self.sub.read().unwrap()
    }

    /// Write access to the underlying subconfiguration.
    pub fn write(&self) -> RwLockWriteGuard<'_, SubConfiguration> {
        self.sub.write().unwrap()
    }

    /// The logical ports of this composite:
    /// `(input_names, output_names)`, taken from the boundary nodes.
    pub fn boundary_ports(&self) -> (Vec<String>, Vec<String>) {
        let sub = self.sub.read().unwrap();
        let inputs = sub
            .graph()
            .get_mockup("CompositeInput")
            .map(|m| {
                m.dynamic_port_infos()
                    .iter()
                    .filter(|p| p.direction == PortDirection::Output)
                    .map(|p| p.name.clone())
                    .collect()
            })
            .unwrap_or_default();
        let outputs = sub
            .graph()
            .get_mockup("CompositeOutput")
            .map(|m| {
                m.dynamic_port_infos()
                    .iter()
                    .filter(|p| p.direction == PortDirection::Input)
                    .map(|p| p.name.clone())
                    .collect()
            })
            .unwrap_or_default();
        (inputs, outputs)
    }

    /// The composite filters referenced from within this composite.
    pub fn referenced_composites(&self) -> Vec<Arc<CompositeFilter>> {
        self.sub.read().unwrap().graph().referenced_composites()
    }

    pub(crate) fn load(
        &self,
        cfg: &Value,
        composite_lookup: &mut CompositeLookup<'_>,
    ) -> Result<()> {
        self.sub.write().unwrap().load(cfg, composite_lookup)
    }

    pub(crate) fn save(&self) -> Result<Value> {
        self.sub.read().unwrap().save()
    }
}
