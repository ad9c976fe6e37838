//! The filter graph: a [`BaseGraph`] whose nodes are backed by
//! [`FilterMockup`] instances.
//!
//! A mockup caches the port information of a filter without keeping the
//! filter instantiated: the filter is constructed temporarily, initialized
//! and destroyed again whenever the cached information needs refreshing.
//! Dynamic (user-defined) ports are stored on the mockup and re-added to
//! every instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::config::composite::CompositeFilter;
use crate::environment::{FilterEnvironment, FilterFactory};
use crate::error::{NexxTError, Result};
use crate::graph::base::BaseGraph;
use crate::plugins::PluginManager;
use crate::ports::{PortDirection, PortInfo};
use crate::property::collection::check_identifier;
use crate::property::{PropertyCollection, PropertyValue};

/// Role of a composite boundary node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeRole {
    /// `CompositeInput`: provides dynamic output ports which become the
    /// composite's logical inputs.
    Input,
    /// `CompositeOutput`: provides dynamic input ports which become the
    /// composite's logical outputs.
    Output,
}

/// Reference to the code implementing a filter node.
#[derive(Clone)]
pub enum LibraryRef {
    /// A plugin URL (`binary://...`, `entry_point://...`, ...).
    Url(String),
    /// A reference to a composite filter (`composite://ref`).
    CompositeRef(Arc<CompositeFilter>),
    /// A composite boundary node (`composite://port`).
    CompositePort(CompositeRole),
}

struct MockupState {
    ports: Vec<PortInfo>,
    dyn_in_supported: bool,
    dyn_out_supported: bool,
}

/// Caches the port information of a filter without having the filter
/// loaded all the time.
pub struct FilterMockup {
    library: LibraryRef,
    factory: String,
    props: Arc<PropertyCollection>,
    state: Mutex<MockupState>,
}

impl FilterMockup {
    pub(crate) fn new(
        library: LibraryRef,
        factory: &str,
        props: Arc<PropertyCollection>,
    ) -> Result<Arc<Self>> {
        // the nexxT internals live in a child collection of the filter
        let nexxt_props = props.get_or_create_child("_nexxT");
        nexxt_props.define_property(
            "thread",
            PropertyValue::Str("main".into()),
            "The thread this filter belongs to.",
        )?;
        Ok(Arc::new(Self {
            library,
            factory: factory.to_string(),
            props,
            state: Mutex::new(MockupState {
                ports: Vec::new(),
                dyn_in_supported: false,
                dyn_out_supported: false,
            }),
        }))
    }

    pub fn library(&self) -> &LibraryRef {
        &self.library
    }

    pub fn factory_function(&self) -> &str {
        &self.factory
    }

    pub fn property_collection(&self) -> &Arc<PropertyCollection> {
        &self.props
    }

    pub fn is_composite_ref(&self) -> bool {
        matches!(self.library, LibraryRef::CompositeRef(_))
    }

    pub fn composite_ref(&self) -> Option<Arc<CompositeFilter>> {
        match &self.library {
            LibraryRef::CompositeRef(cf) => Some(Arc::clone(cf)),
            _ => None,
        }
    }

    pub fn composite_role(&self) -> Option<CompositeRole> {
        match &self.library {
            LibraryRef::CompositePort(role) => Some(*role),
            _ => None,
        }
    }

    /// Resolve the factory function constructing the filter.
    pub(crate) fn resolve_factory(&self) -> Result<FilterFactory> {
        match &self.library {
            LibraryRef::Url(url) => {
                PluginManager::default().create_factory(url, &self.factory, &self.props)
            }
            LibraryRef::CompositePort(role) => {
                let role = *role;
                Ok(Arc::new(
                    move |ctx: &mut crate::environment::FilterCreationContext| {
                        match role {
                            CompositeRole::Input => ctx.set_dynamic_ports_supported(false, true),
                            CompositeRole::Output => ctx.set_dynamic_ports_supported(true, false),
                        }
                        Ok(Box::new(CompositeBoundaryFilter) as Box<dyn crate::filter::Filter>)
                    },
                ))
            }
            LibraryRef::CompositeRef(cf) => {
                let (inputs, outputs) = cf.boundary_ports();
                Ok(Arc::new(
                    move |ctx: &mut crate::environment::FilterCreationContext| {
                        for name in &inputs {
                            ctx.add_static_input_port(name)?;
                        }
                        for name in &outputs {
                            ctx.add_static_output_port(name)?;
                        }
                        Ok(Box::new(CompositeBoundaryFilter) as Box<dyn crate::filter::Filter>)
                    },
                ))
            }
        }
    }

    /// Create the filter temporarily and refresh the cached port
    /// information and dynamic port support flags.
    pub(crate) fn create_filter_and_update(&self) -> Result<()> {
        let factory = self.resolve_factory()?;
        let dynamic_ports = self.dynamic_port_infos();
        self.props.mark_all_unused();
        let mut env = FilterEnvironment::construct(
            &self.props.name(),
            Arc::clone(&self.props),
            Arc::clone(self.props.variables()),
            &factory,
            &dynamic_ports,
        )?;
        // a failing onInit is already logged; the port information of the
        // constructed filter is still useful
        let _ = env.init_standalone();
        self.props.delete_unused();
        let (dyn_in, dyn_out) = env.dynamic_ports_supported();
        {
            let mut state = self.state.lock().unwrap();
            state.ports = env.port_infos();
            state.dyn_in_supported = dyn_in;
            state.dyn_out_supported = dyn_out;
        }
        env.destroy(None);
        Ok(())
    }

    /// Construct the filter for real use inside an active application.
    pub(crate) fn create_filter_host(
        &self,
        fqname: &str,
        thread_name: &str,
        executor: Arc<crate::executor::Executor>,
        variables: Arc<crate::property::Variables>,
    ) -> Result<Arc<crate::environment::FilterHost>> {
        let factory = self.resolve_factory()?;
        let dynamic_ports = self.dynamic_port_infos();
        crate::environment::FilterHost::create(
            fqname,
            thread_name,
            executor,
            Arc::clone(&self.props),
            variables,
            &factory,
            &dynamic_ports,
        )
    }

    /// Query the filter's suggested dynamic port names, e.g. the streams
    /// of a recording. Constructs a temporary instance.
    pub fn suggest_dynamic_ports(&self) -> Result<(Vec<String>, Vec<String>)> {
        let factory = self.resolve_factory()?;
        let mut env = FilterEnvironment::construct(
            &self.props.name(),
            Arc::clone(&self.props),
            Arc::clone(self.props.variables()),
            &factory,
            &self.dynamic_port_infos(),
        )?;
        let suggestion = env.suggest_dynamic_ports();
        env.destroy(None);
        Ok(suggestion)
    }

    /// Cached information of all ports (inputs first).
    pub fn all_port_infos(&self) -> Vec<PortInfo> {
        self.state.lock().unwrap().ports.clone()
    }

    /// Cached information of the dynamic ports only.
    pub fn dynamic_port_infos(&self) -> Vec<PortInfo> {
        self.state
            .lock()
            .unwrap()
            .ports
            .iter()
            .filter(|p| p.dynamic)
            .cloned()
            .collect()
    }

    /// Cached information of the static ports only.
    pub fn static_port_infos(&self) -> Vec<PortInfo> {
        self.state
            .lock()
            .unwrap()
            .ports
            .iter()
            .filter(|p| !p.dynamic)
            .cloned()
            .collect()
    }

    /// `(dynamic_inputs_supported, dynamic_outputs_supported)` flags.
    pub fn dynamic_ports_supported(&self) -> (bool, bool) {
        let state = self.state.lock().unwrap();
        (state.dyn_in_supported, state.dyn_out_supported)
    }

    /// Add a dynamic port and re-acquire the port information.
    pub(crate) fn add_dynamic_port(&self, port: &str, direction: PortDirection) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            let supported = match direction {
                PortDirection::Input => state.dyn_in_supported,
                PortDirection::Output => state.dyn_out_supported,
            };
            if !supported {
                return Err(NexxTError::DynamicPortUnsupported {
                    port: port.to_string(),
                    direction: direction.as_str(),
                });
            }
            if state
                .ports
                .iter()
                .any(|p| p.direction == direction && p.name == port)
            {
                return Err(NexxTError::PortExists {
                    node: self.props.name(),
                    port: port.to_string(),
                    direction: direction.as_str(),
                });
            }
            state.ports.push(match direction {
                PortDirection::Input => PortInfo::input(port, true),
                PortDirection::Output => PortInfo::output(port, true),
            });
        }
        self.create_filter_and_update()
    }

    /// Rename a dynamic port.
    pub(crate) fn rename_dynamic_port(
        &self,
        old_port: &str,
        new_port: &str,
        direction: PortDirection,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let port = state
            .ports
            .iter_mut()
            .find(|p| p.direction == direction && p.dynamic && p.name == old_port)
            .ok_or_else(|| NexxTError::PortNotFound {
                node: self.props.name(),
                port: old_port.to_string(),
                direction: direction.as_str(),
            })?;
        port.name = new_port.to_string();
        Ok(())
    }

    /// Remove a dynamic port.
    pub(crate) fn delete_dynamic_port(&self, port: &str, direction: PortDirection) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let idx = state
            .ports
            .iter()
            .position(|p| p.direction == direction && p.dynamic && p.name == port)
            .ok_or_else(|| NexxTError::PortNotFound {
                node: self.props.name(),
                port: port.to_string(),
                direction: direction.as_str(),
            })?;
        state.ports.remove(idx);
        Ok(())
    }
}

/// Placeholder filter used for composite reference and boundary nodes.
/// These nodes never take part in the data flow of an active application.
struct CompositeBoundaryFilter;

impl crate::filter::Filter for CompositeBoundaryFilter {}

/// The filter graph of a subconfiguration.
pub struct FilterGraph {
    base: BaseGraph,
    mockups: HashMap<String, Arc<FilterMockup>>,
    properties: Arc<PropertyCollection>,
    owner_composite: Option<Weak<CompositeFilter>>,
}

impl FilterGraph {
    pub fn new(properties: Arc<PropertyCollection>) -> Self {
        Self {
            base: BaseGraph::new(),
            mockups: HashMap::new(),
            properties,
            owner_composite: None,
        }
    }

    pub(crate) fn set_owner_composite(&mut self, owner: Weak<CompositeFilter>) {
        self.owner_composite = Some(owner);
    }

    /// The underlying node/connection model.
    pub fn base(&self) -> &BaseGraph {
        &self.base
    }

    /// Mutable access to the underlying node/connection model (e.g. for
    /// connection properties).
    pub fn base_mut(&mut self) -> &mut BaseGraph {
        &mut self.base
    }

    /// Add a node given a library reference and a factory function.
    /// Returns the chosen (unique) node name.
    pub fn add_node(
        &mut self,
        library: LibraryRef,
        factory: &str,
        suggested_name: Option<&str>,
    ) -> Result<String> {
        let name = self
            .base
            .unique_node_name(suggested_name.unwrap_or(factory));
        check_identifier(&name)?;
        let prop_coll = self.properties.get_or_create_child(&name);
        let mockup = FilterMockup::new(library, factory, prop_coll)?;
        mockup.create_filter_and_update()?;
        self.base.add_node(&name)?;
        self.mockups.insert(name.clone(), Arc::clone(&mockup));
        if let Some(cf) = mockup.composite_ref() {
            if let Err(e) = self.check_recursion(&cf) {
                self.delete_node(&name)?;
                return Err(e);
            }
        }
        for port in mockup.static_port_infos() {
            match port.direction {
                PortDirection::Input => self.base.add_input_port(&name, &port.name)?,
                PortDirection::Output => self.base.add_output_port(&name, &port.name)?,
            }
        }
        Ok(name)
    }

    fn check_recursion(&self, added: &Arc<CompositeFilter>) -> Result<()> {
        fn visit(cf: &Arc<CompositeFilter>, active: &mut Vec<usize>) -> Result<()> {
            let ptr = Arc::as_ptr(cf) as usize;
            if active.contains(&ptr) {
                return Err(NexxTError::CompositeRecursion(cf.name()));
            }
            active.push(ptr);
            for sub in cf.referenced_composites() {
                visit(&sub, active)?;
            }
            active.pop();
            Ok(())
        }
        let mut active = Vec::new();
        if let Some(owner) = self.owner_composite.as_ref().and_then(|w| w.upgrade()) {
            active.push(Arc::as_ptr(&owner) as usize);
        }
        visit(added, &mut active)
    }

    /// The mockup backing the given node.
    pub fn get_mockup(&self, name: &str) -> Result<Arc<FilterMockup>> {
        self.mockups
            .get(name)
            .cloned()
            .ok_or_else(|| NexxTError::NodeNotFound(name.to_string()))
    }

    /// The composite filters referenced by nodes of this graph.
    pub fn referenced_composites(&self) -> Vec<Arc<CompositeFilter>> {
        self.mockups
            .values()
            .filter_map(|m| m.composite_ref())
            .collect()
    }

    /// Rename a node, moving its property collection along.
    pub fn rename_node(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        check_identifier(new_name)?;
        self.base.rename_node(old_name, new_name)?;
        self.properties.rename_child(old_name, new_name)?;
        if let Some(mockup) = self.mockups.remove(old_name) {
            self.mockups.insert(new_name.to_string(), mockup);
        }
        Ok(())
    }

    /// Delete a node, its mockup and its property collection.
    pub fn delete_node(&mut self, name: &str) -> Result<()> {
        self.base.delete_node(name)?;
        self.properties.delete_child(name)?;
        self.mockups.remove(name);
        Ok(())
    }

    /// Add a dynamic input port to the referenced node.
    pub fn add_dynamic_input_port(&mut self, node: &str, port: &str) -> Result<()> {
        self.get_mockup(node)?
            .add_dynamic_port(port, PortDirection::Input)?;
        self.base.add_input_port(node, port)
    }

    /// Rename a dynamic input port of a node.
    pub fn rename_dynamic_input_port(
        &mut self,
        node: &str,
        old_port: &str,
        new_port: &str,
    ) -> Result<()> {
        self.base.rename_input_port(node, old_port, new_port)?;
        self.get_mockup(node)?
            .rename_dynamic_port(old_port, new_port, PortDirection::Input)
    }

    /// Remove a dynamic input port of a node.
    pub fn delete_dynamic_input_port(&mut self, node: &str, port: &str) -> Result<()> {
        self.get_mockup(node)?
            .delete_dynamic_port(port, PortDirection::Input)?;
        self.base.delete_input_port(node, port)
    }

    /// Add a dynamic output port to the referenced node.
    pub fn add_dynamic_output_port(&mut self, node: &str, port: &str) -> Result<()> {
        self.get_mockup(node)?
            .add_dynamic_port(port, PortDirection::Output)?;
        self.base.add_output_port(node, port)
    }

    /// Rename a dynamic output port of a node.
    pub fn rename_dynamic_output_port(
        &mut self,
        node: &str,
        old_port: &str,
        new_port: &str,
    ) -> Result<()> {
        self.base.rename_output_port(node, old_port, new_port)?;
        self.get_mockup(node)?
            .rename_dynamic_port(old_port, new_port, PortDirection::Output)
    }

    /// Remove a dynamic output port of a node.
    pub fn delete_dynamic_output_port(&mut self, node: &str, port: &str) -> Result<()> {
        self.get_mockup(node)?
            .delete_dynamic_port(port, PortDirection::Output)?;
        self.base.delete_output_port(node, port)
    }

    /// Re-sync the base graph ports of a node from its mockup (used after
    /// composite boundary changes).
    pub fn update_port_information(&mut self, node: &str) -> Result<()> {
        let mockup = self.get_mockup(node)?;
        let infos = mockup.all_port_infos();
        let current_in = self.base.all_input_ports(node)?;
        let current_out = self.base.all_output_ports(node)?;
        let new_in: Vec<&PortInfo> = infos
            .iter()
            .filter(|p| p.direction == PortDirection::Input)
            .collect();
        let new_out: Vec<&PortInfo> = infos
            .iter()
            .filter(|p| p.direction == PortDirection::Output)
            .collect();
        for port in &current_in {
            if !new_in.iter().any(|p| &p.name == port) {
                self.base.delete_input_port(node, port)?;
            }
        }
        for port in new_in {
            if !current_in.contains(&port.name) {
                self.base.add_input_port(node, &port.name)?;
            }
        }
        for port in &current_out {
            if !new_out.iter().any(|p| &p.name == port) {
                self.base.delete_output_port(node, port)?;
            }
        }
        for port in new_out {
            if !current_out.contains(&port.name) {
                self.base.add_output_port(node, &port.name)?;
            }
        }
        Ok(())
    }
}
