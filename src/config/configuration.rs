//! The configuration: the named collection of applications and composite
//! filters, of which at most one application is active at a time.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::active::ActiveApplication;
use crate::config::application::Application;
use crate::config::composite::CompositeFilter;
use crate::error::{NexxTError, Result};
use crate::plugins::PluginManager;
use crate::property::PropertyCollection;

/// A collection of subgraphs (applications and composite filters).
pub struct Configuration {
    composites: Vec<Arc<CompositeFilter>>,
    applications: Vec<Application>,
    props: Arc<PropertyCollection>,
    active: Option<ActiveApplication>,
    dirty: Arc<AtomicBool>,
    single_threaded: bool,
}

impl Configuration {
    pub fn new() -> Self {
        let dirty = Arc::new(AtomicBool::new(false));
        let props = Self::default_root_props(&dirty);
        Self {
            composites: Vec::new(),
            applications: Vec::new(),
            props,
            active: None,
            dirty,
            single_threaded: false,
        }
    }

    fn default_root_props(dirty: &Arc<AtomicBool>) -> Arc<PropertyCollection> {
        let props = PropertyCollection::new_root("root");
        let vars = props.variables();
        // standard variables available on all platforms
        vars.set(
            "CFG_DIR",
            "${!parent_dir(subst(\"${CFGFILE}\"))}",
        )
        .expect("fresh scope has no readonly variables");
        vars.set("NEXXT_PLATFORM", &crate::nexxt_platform())
            .expect("fresh scope has no readonly variables");
        vars.set("NEXXT_VARIANT", "${!env_or(\"NEXXT_VARIANT\", \"release\")}")
            .expect("fresh scope has no readonly variables");
        vars.set_readonly(["CFG_DIR", "NEXXT_PLATFORM", "NEXXT_VARIANT", "CFGFILE"]);
        let dirty_hook = Arc::clone(dirty);
        vars.on_change(Box::new(move || {
            dirty_hook.store(true, Ordering::SeqCst);
        }));
        PropertyCollection::new_child(&props, "_guiState", None)
            .expect("fresh root has no children");
        props
    }

    /// Force all filters into the main thread on activation.
    pub fn set_single_threaded(&mut self, single_threaded: bool) {
        self.single_threaded = single_threaded;
    }

    pub fn dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::SeqCst);
    }

    /// The root property collection (carrying the configuration
    /// variables).
    pub fn property_collection(&self) -> &Arc<PropertyCollection> {
        &self.props
    }

    /// The per-config gui state collection.
    pub fn gui_state(&self) -> Result<Arc<PropertyCollection>> {
        self.props.get_child_collection("_guiState")
    }

    /// The configuration file name, if set.
    pub fn filename(&self) -> Option<String> {
        self.props.variables().get("CFGFILE").ok()
    }

    // ── Lifecycle ──

    /// Close the configuration and free all resources.
    pub fn close(&mut self) {
        tracing::trace!("entering Configuration.close");
        self.deactivate();
        self.composites.clear();
        self.applications.clear();
        self.props = Self::default_root_props(&self.dirty);
        PluginManager::default().unload_all();
        tracing::trace!("leaving Configuration.close");
    }

    /// Load the configuration from a JSON document.
    pub fn load(&mut self, cfg: &Value) -> Result<()> {
        self.close();
        let res = self.load_impl(cfg);
        if res.is_err() {
            self.close();
        }
        res
    }

    fn load_impl(&mut self, cfg: &Value) -> Result<()> {
        if let Some(cfgfile) = cfg.get("CFGFILE").and_then(|v| v.as_str()) {
            let vars = self.props.variables();
            let orig_readonly = vars.set_readonly(Vec::<String>::new());
            vars.set("CFGFILE", cfgfile)?;
            vars.set_readonly(orig_readonly);
        }
        if let Some(guistate) = cfg.get("_guiState").and_then(|v| v.as_object()) {
            let _ = self.props.delete_child("_guiState");
            PropertyCollection::new_child(&self.props, "_guiState", Some(guistate.clone()))?;
        }
        let vars = self.props.variables();
        for k in vars.keys() {
            if !vars.is_readonly(&k) {
                vars.delete(&k)?;
            }
        }
        if let Some(variables) = cfg.get("variables").and_then(|v| v.as_object()) {
            for (k, v) in variables {
                if let Some(value) = v.as_str() {
                    vars.set(k, value)?;
                }
            }
        }
        let composites = cfg
            .get("composite_filters")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let mut loading = HashSet::new();
        for cfg_cf in &composites {
            let name = cfg_cf
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| NexxTError::Config("composite filter without name".into()))?;
            self.load_composite(name, &composites, &mut loading)?;
        }
        let applications = cfg
            .get("applications")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for cfg_app in &applications {
            let name = cfg_app
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| NexxTError::Config("application without name".into()))?;
            self.check_unique_name(name)?;
            let mut app = Application::new(name, &self.props)?;
            app.load(cfg_app, &mut |n| {
                self.composite_by_name(n)
                    .map_err(|_| NexxTError::NodeNotFound(n.to_string()))
            })?;
            self.applications.push(app);
        }
        self.set_dirty(false);
        Ok(())
    }

    fn load_composite(
        &mut self,
        name: &str,
        composites: &[Value],
        loading: &mut HashSet<String>,
    ) -> Result<Arc<CompositeFilter>> {
        // a name still being loaded means a cyclic reference; checked
        // before the by-name lookup which would hand out the half-loaded
        // instance
        if loading.contains(name) {
            return Err(NexxTError::CompositeRecursion(name.to_string()));
        }
        if let Ok(cf) = self.composite_by_name(name) {
            return Ok(cf);
        }
        loading.insert(name.to_string());
        let res = (|| {
            let cfg_cf = composites
                .iter()
                .find(|c| c.get("name").and_then(|v| v.as_str()) == Some(name))
                .ok_or_else(|| NexxTError::NodeNotFound(name.to_string()))?
                .clone();
            self.check_unique_name(name)?;
            let cf = CompositeFilter::create(name, &self.props)?;
            self.composites.push(Arc::clone(&cf));
            cf.load(&cfg_cf, &mut |n| self.load_composite(n, composites, loading))?;
            Ok(cf)
        })();
        loading.remove(name);
        res
    }

    /// Produce a JSON document suitable for saving (inverse of
    /// [`Configuration::load`]).
    pub fn save(&mut self, file: Option<&str>) -> Result<Value> {
        let vars = self.props.variables();
        if let Some(file) = file {
            let orig_readonly = vars.set_readonly(Vec::<String>::new());
            vars.set("CFGFILE", file)?;
            vars.set_readonly(orig_readonly);
        }
        let mut cfg = Map::new();
        match vars.getraw("CFGFILE") {
            Ok(cfgfile) => cfg.insert("CFGFILE".into(), Value::String(cfgfile)),
            Err(_) => cfg.insert("CFGFILE".into(), Value::Null),
        };
        cfg.insert(
            "_guiState".into(),
            Value::Object(self.gui_state().map(|g| g.save_dict()).unwrap_or_default()),
        );
        let user_vars: Map<String, Value> = vars
            .keys()
            .iter()
            .filter(|k| !vars.is_readonly(k))
            .filter_map(|k| vars.getraw(k).ok().map(|v| (k.clone(), Value::String(v))))
            .collect();
        if !user_vars.is_empty() {
            cfg.insert("variables".into(), Value::Object(user_vars));
        }
        let composites: Result<Vec<Value>> =
            self.composites.iter().map(|cf| cf.save()).collect();
        cfg.insert("composite_filters".into(), Value::Array(composites?));
        let applications: Result<Vec<Value>> =
            self.applications.iter().map(|app| app.save()).collect();
        cfg.insert("applications".into(), Value::Array(applications?));
        self.set_dirty(false);
        Ok(Value::Object(cfg))
    }

    // ── Subconfiguration management ──

    fn check_unique_name(&self, name: &str) -> Result<()> {
        let exists = self.applications.iter().any(|a| a.name() == name)
            || self.composites.iter().any(|c| c.name() == name);
        if exists {
            return Err(NexxTError::Runtime(format!(
                "Name '{}' is not unique.",
                name
            )));
        }
        Ok(())
    }

    /// The composite filter with the given name.
    pub fn composite_by_name(&self, name: &str) -> Result<Arc<CompositeFilter>> {
        self.composites
            .iter()
            .find(|cf| cf.name() == name)
            .cloned()
            .ok_or_else(|| NexxTError::NodeNotFound(name.to_string()))
    }

    /// The application with the given name.
    pub fn application_by_name(&mut self, name: &str) -> Result<&mut Application> {
        self.applications
            .iter_mut()
            .find(|app| app.name() == name)
            .ok_or_else(|| NexxTError::NodeNotFound(name.to_string()))
    }

    /// Add a new application with an automatically chosen unique name.
    pub fn add_new_application(&mut self) -> Result<String> {
        let mut name = "application".to_string();
        let mut idx = 1;
        while self.applications.iter().any(|a| a.name() == name) {
            idx += 1;
            name = format!("application_{}", idx);
        }
        let app = Application::new(&name, &self.props)?;
        self.applications.push(app);
        self.set_dirty(true);
        Ok(name)
    }

    /// Add a new composite filter with an automatically chosen unique
    /// name.
    pub fn add_new_composite_filter(&mut self) -> Result<String> {
        let mut name = "composite".to_string();
        let mut idx = 1;
        while self.composites.iter().any(|c| c.name() == name) {
            idx += 1;
            name = format!("composite_{}", idx);
        }
        let cf = CompositeFilter::create(&name, &self.props)?;
        self.composites.push(cf);
        self.set_dirty(true);
        Ok(name)
    }

    /// Rename an application subgraph.
    pub fn rename_application(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        if old_name == new_name {
            return Ok(());
        }
        self.check_unique_name(new_name)?;
        self.application_by_name(old_name)?.set_name(new_name)?;
        self.set_dirty(true);
        Ok(())
    }

    /// Rename a composite subgraph.
    pub fn rename_composite(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        if old_name == new_name {
            return Ok(());
        }
        self.check_unique_name(new_name)?;
        self.composite_by_name(old_name)?.set_name(new_name)?;
        self.set_dirty(true);
        Ok(())
    }

    /// Remove an application.
    pub fn remove_application(&mut self, name: &str) -> Result<()> {
        let idx = self
            .applications
            .iter()
            .position(|a| a.name() == name)
            .ok_or_else(|| NexxTError::NodeNotFound(name.to_string()))?;
        self.applications.remove(idx);
        self.set_dirty(true);
        Ok(())
    }

    /// Remove a composite filter; fails while it is still referenced.
    pub fn remove_composite(&mut self, name: &str) -> Result<()> {
        let cf = self.composite_by_name(name)?;
        let in_use = |refs: Vec<Arc<CompositeFilter>>| {
            refs.iter().any(|r| Arc::ptr_eq(r, &cf))
        };
        for app in &self.applications {
            if in_use(app.graph().referenced_composites()) {
                return Err(NexxTError::Runtime(format!(
                    "Composite filter is still in use by {}.",
                    app.name()
                )));
            }
        }
        for other in &self.composites {
            if !Arc::ptr_eq(other, &cf) && in_use(other.referenced_composites()) {
                return Err(NexxTError::Runtime(format!(
                    "Composite filter is still in use by {}.",
                    other.name()
                )));
            }
        }
        self.composites.retain(|c| !Arc::ptr_eq(c, &cf));
        self.set_dirty(true);
        Ok(())
    }

    /// All application names.
    pub fn application_names(&self) -> Vec<String> {
        self.applications.iter().map(|a| a.name().to_string()).collect()
    }

    /// All composite filter names.
    pub fn composite_filter_names(&self) -> Vec<String> {
        self.composites.iter().map(|c| c.name()).collect()
    }

    // ── Activation ──

    /// Activate the application with the given name. A previously active
    /// application is shut down first.
    pub fn activate(&mut self, app_name: &str) -> Result<()> {
        self.deactivate();
        let single_threaded = self.single_threaded;
        let root_vars = Arc::clone(self.props.variables());
        let app = self
            .applications
            .iter()
            .find(|a| a.name() == app_name)
            .ok_or_else(|| {
                NexxTError::Runtime(format!("Application '{}' not found.", app_name))
            })?;
        let active = ActiveApplication::new(app_name, app.graph(), &root_vars, single_threaded)?;
        self.active = Some(active);
        Ok(())
    }

    /// Shut down the active application, if any.
    pub fn deactivate(&mut self) {
        if let Some(mut active) = self.active.take() {
            if let Err(e) = active.shutdown() {
                tracing::error!("error while shutting down active application: {}", e);
            }
        }
    }

    /// The currently active application.
    pub fn active_application(&mut self) -> Option<&mut ActiveApplication> {
        self.active.as_mut()
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Configuration {
    fn drop(&mut self) {
        self.deactivate();
    }
}
