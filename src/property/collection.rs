//! The hierarchical property collection tree.
//!
//! Collections mirror the configuration structure (one per subgraph, one
//! per filter, plus internal children like `_nexxT` and `_guiState`).
//! Properties are created through [`PropertyCollection::define_property`],
//! which returns the loaded value if the configuration file provided one.
//! Handler read/write operations take the collection mutex so cross-thread
//! reads are safe.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde_json::{Map, Value};

use crate::error::{NexxTError, Result};
use crate::property::handlers::{PropertyHandler, PropertyValue};
use crate::property::variables::Variables;

/// Check that a name is a valid nexxT identifier.
pub fn check_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_first = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if valid_first
        && name[1..]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        Ok(())
    } else {
        Err(NexxTError::InvalidIdentifier(name.to_string()))
    }
}

struct Property {
    default: PropertyValue,
    value: PropertyValue,
    helpstr: String,
    handler: PropertyHandler,
    used: bool,
}

/// Details of a single property for display purposes.
#[derive(Debug, Clone)]
pub struct PropertyDetails {
    pub default: PropertyValue,
    pub value: PropertyValue,
    pub helpstr: String,
    pub handler: PropertyHandler,
}

type ChangeHook = Box<dyn Fn(&str) + Send + Sync>;

/// A node of the property tree.
pub struct PropertyCollection {
    name: RwLock<String>,
    parent: RwLock<Weak<PropertyCollection>>,
    children: Mutex<Vec<Arc<PropertyCollection>>>,
    properties: Mutex<BTreeMap<String, Property>>,
    loaded: Mutex<Map<String, Value>>,
    // if no property access has been made, we stick with the values from
    // the config file
    accessed: AtomicBool,
    variables: Arc<Variables>,
    change_hooks: Mutex<Vec<ChangeHook>>,
}

impl PropertyCollection {
    /// Create a root collection.
    pub fn new_root(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: RwLock::new(name.to_string()),
            parent: RwLock::new(Weak::new()),
            children: Mutex::new(Vec::new()),
            properties: Mutex::new(BTreeMap::new()),
            loaded: Mutex::new(Map::new()),
            accessed: AtomicBool::new(false),
            variables: Variables::new(None),
            change_hooks: Mutex::new(Vec::new()),
        })
    }

    /// Create a child collection, optionally seeded with values loaded
    /// from a configuration file.
    pub fn new_child(
        parent: &Arc<PropertyCollection>,
        name: &str,
        loaded: Option<Map<String, Value>>,
    ) -> Result<Arc<Self>> {
        if parent.find_child(name).is_some() {
            return Err(NexxTError::PropertyChildExists(name.to_string()));
        }
        let child = Arc::new(Self {
            name: RwLock::new(name.to_string()),
            parent: RwLock::new(Arc::downgrade(parent)),
            children: Mutex::new(Vec::new()),
            properties: Mutex::new(BTreeMap::new()),
            loaded: Mutex::new(loaded.unwrap_or_default()),
            accessed: AtomicBool::new(false),
            variables: Variables::new(Some(Arc::clone(&parent.variables))),
            change_hooks: Mutex::new(Vec::new()),
        });
        parent.children.lock().unwrap().push(Arc::clone(&child));
        tracing::trace!("Propcoll {}: add child {}", parent.name(), name);
        Ok(child)
    }

    pub fn name(&self) -> String {
        self.name.read().unwrap().clone()
    }

    pub fn parent(&self) -> Option<Arc<PropertyCollection>> {
        self.parent.read().unwrap().upgrade()
    }

    /// The variable scope associated with this collection.
    pub fn variables(&self) -> &Arc<Variables> {
        &self.variables
    }

    /// Register a hook invoked with the property name on every change.
    pub fn on_change(&self, hook: ChangeHook) {
        self.change_hooks.lock().unwrap().push(hook);
    }

    fn notify_change(&self, name: &str) {
        for hook in self.change_hooks.lock().unwrap().iter() {
            hook(name);
        }
    }

    fn find_child(&self, name: &str) -> Option<Arc<PropertyCollection>> {
        self.children
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Return the child collection with the given name.
    pub fn get_child_collection(&self, name: &str) -> Result<Arc<PropertyCollection>> {
        self.find_child(name)
            .ok_or_else(|| NexxTError::PropertyChildNotFound(name.to_string()))
    }

    /// Return the child with the given name, creating it if necessary.
    pub fn get_or_create_child(self: &Arc<Self>, name: &str) -> Arc<PropertyCollection> {
        match self.find_child(name) {
            Some(child) => child,
            None => Self::new_child(self, name, None).expect("child existence checked"),
        }
    }

    /// All child collections in creation order.
    pub fn children(&self) -> Vec<Arc<PropertyCollection>> {
        self.children.lock().unwrap().clone()
    }

    /// Rename a child collection.
    pub fn rename_child(&self, old_name: &str, new_name: &str) -> Result<()> {
        let child = self.get_child_collection(old_name)?;
        if self.find_child(new_name).is_some() {
            return Err(NexxTError::PropertyChildExists(new_name.to_string()));
        }
        *child.name.write().unwrap() = new_name.to_string();
        Ok(())
    }

    /// Remove a child collection and all its descendants.
    pub fn delete_child(&self, name: &str) -> Result<()> {
        let mut children = self.children.lock().unwrap();
        let idx = children
            .iter()
            .position(|c| c.name() == name)
            .ok_or_else(|| NexxTError::PropertyChildNotFound(name.to_string()))?;
        children.remove(idx);
        Ok(())
    }

    /// Return the value of the given property, creating it with the
    /// default handler if it doesn't exist.
    pub fn define_property(
        &self,
        name: &str,
        default: PropertyValue,
        helpstr: &str,
    ) -> Result<PropertyValue> {
        self.define_property_impl(name, default, helpstr, None)
    }

    /// Like [`PropertyCollection::define_property`] with an explicit
    /// handler carrying constraints (min/max/enum).
    pub fn define_property_with_handler(
        &self,
        name: &str,
        default: PropertyValue,
        helpstr: &str,
        handler: PropertyHandler,
    ) -> Result<PropertyValue> {
        self.define_property_impl(name, default, helpstr, Some(handler))
    }

    fn define_property_impl(
        &self,
        name: &str,
        default: PropertyValue,
        helpstr: &str,
        handler: Option<PropertyHandler>,
    ) -> Result<PropertyValue> {
        self.accessed.store(true, Ordering::SeqCst);
        check_identifier(name)?;
        let mut properties = self.properties.lock().unwrap();
        match properties.get_mut(name) {
            None => {
                let handler = handler.unwrap_or_else(|| PropertyHandler::default_for(&default));
                let mut prop = Property {
                    default: default.clone(),
                    value: default,
                    helpstr: helpstr.to_string(),
                    handler,
                    used: true,
                };
                if let Some(loaded) = self.loaded.lock().unwrap().get(name) {
                    match prop.handler.from_config(loaded) {
                        Ok(v) => prop.value = v,
                        Err(_) => {
                            tracing::warn!(
                                "Property {}: can't convert value '{}'.",
                                name,
                                loaded
                            );
                        }
                    }
                }
                let value = prop.value.clone();
                properties.insert(name.to_string(), prop);
                drop(properties);
                self.notify_change(name);
                Ok(value)
            }
            Some(prop) => {
                // definitions must be consistent among calls
                if prop.default != default || prop.helpstr != helpstr {
                    return Err(NexxTError::PropertyInconsistentDefinition(name.to_string()));
                }
                if let Some(handler) = handler {
                    if prop.handler != handler {
                        return Err(NexxTError::PropertyInconsistentDefinition(name.to_string()));
                    }
                }
                prop.used = true;
                Ok(prop.value.clone())
            }
        }
    }

    /// The current value of a property.
    pub fn get_property(&self, name: &str) -> Result<PropertyValue> {
        self.accessed.store(true, Ordering::SeqCst);
        let mut properties = self.properties.lock().unwrap();
        let prop = properties
            .get_mut(name)
            .ok_or_else(|| NexxTError::PropertyNotFound(name.to_string()))?;
        prop.used = true;
        Ok(prop.value.clone())
    }

    /// The current value of a string property with variables substituted.
    pub fn get_property_substituted(&self, name: &str) -> Result<PropertyValue> {
        let value = self.get_property(name)?;
        match value {
            PropertyValue::Str(s) => Ok(PropertyValue::Str(self.variables.subst(&s)?)),
            other => Ok(other),
        }
    }

    /// Details of a property for display purposes.
    pub fn get_property_details(&self, name: &str) -> Result<PropertyDetails> {
        let properties = self.properties.lock().unwrap();
        let prop = properties
            .get(name)
            .ok_or_else(|| NexxTError::PropertyNotFound(name.to_string()))?;
        Ok(PropertyDetails {
            default: prop.default.clone(),
            value: prop.value.clone(),
            helpstr: prop.helpstr.clone(),
            handler: prop.handler.clone(),
        })
    }

    /// All property names handled in this collection.
    pub fn property_names(&self) -> Vec<String> {
        self.properties.lock().unwrap().keys().cloned().collect()
    }

    /// Set the value of a named property, validating it first. Equal-value
    /// writes do not emit a change notification.
    pub fn set_property(&self, name: &str, value: PropertyValue) -> Result<()> {
        self.accessed.store(true, Ordering::SeqCst);
        let changed = {
            let mut properties = self.properties.lock().unwrap();
            let prop = properties
                .get_mut(name)
                .ok_or_else(|| NexxTError::PropertyNotFound(name.to_string()))?;
            let value = match value {
                // string input is parsed through the handler
                PropertyValue::Str(s) if !matches!(prop.handler, PropertyHandler::Str { .. }) => {
                    prop.handler.parse(&s)?
                }
                other => prop.handler.validate(other)?,
            };
            if value != prop.value {
                prop.value = value;
                true
            } else {
                false
            }
        };
        if changed {
            self.notify_change(name);
        }
        Ok(())
    }

    /// Mark all properties of the collection as unused.
    pub fn mark_all_unused(&self) {
        for prop in self.properties.lock().unwrap().values_mut() {
            prop.used = false;
        }
    }

    /// Delete properties still marked as unused after a redefinition
    /// cycle. Also drops stale loaded-from-config values.
    pub fn delete_unused(&self) {
        if !self.accessed.load(Ordering::SeqCst) {
            // only meaningful if something in the store has been used
            return;
        }
        let removed: Vec<String> = {
            let mut properties = self.properties.lock().unwrap();
            let stale: Vec<String> = properties
                .iter()
                .filter(|(_, p)| !p.used)
                .map(|(n, _)| n.clone())
                .collect();
            for name in &stale {
                properties.remove(name);
            }
            stale
        };
        self.loaded.lock().unwrap().clear();
        for name in removed {
            self.notify_change(&name);
        }
    }

    /// Properties as a map suited for JSON output. When the collection was
    /// never accessed, the loaded config is passed through unchanged.
    pub fn save_dict(&self) -> Map<String, Value> {
        if self.accessed.load(Ordering::SeqCst) {
            let properties = self.properties.lock().unwrap();
            properties
                .iter()
                .map(|(n, p)| (n.clone(), p.handler.to_config(&p.value)))
                .collect()
        } else {
            self.loaded.lock().unwrap().clone()
        }
    }

    /// Apply a loaded configuration after the instance has been created.
    pub fn apply_loaded_config(&self, loaded: Map<String, Value>) {
        self.accessed.store(false, Ordering::SeqCst);
        *self.loaded.lock().unwrap() = loaded;
    }

    /// Resolve a possibly relative path against the configuration file
    /// directory, substituting environment variables first.
    pub fn evalpath(&self, path: &str) -> String {
        if Path::new(path).is_absolute() {
            return path.to_string();
        }
        let mut substituted = String::with_capacity(path.len());
        // substitute ${VAR} with environment variables
        let mut rest = path;
        while let Some(start) = rest.find("${") {
            substituted.push_str(&rest[..start]);
            match rest[start..].find('}') {
                Some(end) => {
                    let name = &rest[start + 2..start + end];
                    let fallback = match name {
                        "NEXXT_VARIANT" => Some("release".to_string()),
                        "NEXXT_PLATFORM" => Some(crate::nexxt_platform()),
                        _ => None,
                    };
                    match std::env::var(name).ok().or(fallback) {
                        Some(value) => substituted.push_str(&value),
                        None => substituted.push_str(&rest[start..start + end + 1]),
                    }
                    rest = &rest[start + end + 1..];
                }
                None => {
                    substituted.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        substituted.push_str(rest);
        if Path::new(&substituted).is_absolute() {
            return substituted;
        }
        match self.variables.subst("${CFGFILE}") {
            Ok(cfgfile) if cfgfile != "${CFGFILE}" => {
                let dir = PathBuf::from(cfgfile);
                dir.parent()
                    .map(|d| d.join(&substituted).to_string_lossy().into_owned())
                    .unwrap_or(substituted)
            }
            _ => substituted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_identifier() {
        assert!(check_identifier("valid_name-1").is_ok());
        assert!(check_identifier("_x").is_ok());
        assert!(check_identifier("1bad").is_err());
        assert!(check_identifier("").is_err());
        assert!(check_identifier("with space").is_err());
    }

    #[test]
    fn test_define_and_get() {
        let root = PropertyCollection::new_root("root");
        let v = root
            .define_property("freq", PropertyValue::Float(4.0), "sampling frequency")
            .unwrap();
        assert_eq!(v, PropertyValue::Float(4.0));
        assert_eq!(root.get_property("freq").unwrap(), PropertyValue::Float(4.0));
        assert!(root.get_property("unknown").is_err());
    }

    #[test]
    fn test_inconsistent_redefinition() {
        let root = PropertyCollection::new_root("root");
        root.define_property("a", PropertyValue::Int(1), "help")
            .unwrap();
        // identical definition is fine
        root.define_property("a", PropertyValue::Int(1), "help")
            .unwrap();
        assert!(root
            .define_property("a", PropertyValue::Int(2), "help")
            .is_err());
        assert!(root
            .define_property("a", PropertyValue::Int(1), "other help")
            .is_err());
    }

    #[test]
    fn test_set_property_validates_and_suppresses_equal_writes() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let root = PropertyCollection::new_root("root");
        root.define_property_with_handler(
            "n",
            PropertyValue::Int(5),
            "bounded",
            PropertyHandler::Int {
                min: Some(0),
                max: Some(10),
            },
        )
        .unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        root.on_change(Box::new(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        root.set_property("n", PropertyValue::Int(7)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        root.set_property("n", PropertyValue::Int(7)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // clamped to 10
        root.set_property("n", PropertyValue::Int(99)).unwrap();
        assert_eq!(root.get_property("n").unwrap(), PropertyValue::Int(10));
    }

    #[test]
    fn test_string_values_parsed_through_handler() {
        let root = PropertyCollection::new_root("root");
        root.define_property("f", PropertyValue::Float(1.0), "h")
            .unwrap();
        root.set_property("f", PropertyValue::Str("2.5".into()))
            .unwrap();
        assert_eq!(root.get_property("f").unwrap(), PropertyValue::Float(2.5));
        assert!(root
            .set_property("f", PropertyValue::Str("zz".into()))
            .is_err());
    }

    #[test]
    fn test_loaded_config_applies_on_define() {
        let root = PropertyCollection::new_root("root");
        let mut loaded = Map::new();
        loaded.insert("thread".into(), Value::String("worker".into()));
        let child = PropertyCollection::new_child(&root, "filter", Some(loaded)).unwrap();
        let v = child
            .define_property("thread", PropertyValue::Str("main".into()), "the thread")
            .unwrap();
        assert_eq!(v, PropertyValue::Str("worker".into()));
    }

    #[test]
    fn test_unused_deletion() {
        let root = PropertyCollection::new_root("root");
        root.define_property("keep", PropertyValue::Int(1), "h")
            .unwrap();
        root.define_property("drop", PropertyValue::Int(2), "h")
            .unwrap();
        root.mark_all_unused();
        root.define_property("keep", PropertyValue::Int(1), "h")
            .unwrap();
        root.delete_unused();
        assert!(root.get_property("keep").is_ok());
        assert!(root.get_property("drop").is_err());
    }

    #[test]
    fn test_children_tree() {
        let root = PropertyCollection::new_root("root");
        let app = PropertyCollection::new_child(&root, "app", None).unwrap();
        let _filter = PropertyCollection::new_child(&app, "filter", None).unwrap();
        assert!(PropertyCollection::new_child(&root, "app", None).is_err());
        assert!(root.get_child_collection("app").is_ok());
        assert!(root.get_child_collection("filter").is_err());
        root.rename_child("app", "app2").unwrap();
        assert!(root.get_child_collection("app2").is_ok());
        root.delete_child("app2").unwrap();
        assert!(root.get_child_collection("app2").is_err());
    }

    #[test]
    fn test_variables_inherit_from_parent_collection() {
        let root = PropertyCollection::new_root("root");
        root.variables().set("BASE", "/cfg").unwrap();
        let child = PropertyCollection::new_child(&root, "sub", None).unwrap();
        assert_eq!(child.variables().get("BASE").unwrap(), "/cfg");
    }

    #[test]
    fn test_save_dict_passthrough_when_not_accessed() {
        let root = PropertyCollection::new_root("root");
        let mut loaded = Map::new();
        loaded.insert("x".into(), Value::from(3));
        let child = PropertyCollection::new_child(&root, "c", Some(loaded.clone())).unwrap();
        assert_eq!(child.save_dict(), loaded);
        child.define_property("x", PropertyValue::Int(0), "h").unwrap();
        let saved = child.save_dict();
        assert_eq!(saved.get("x"), Some(&Value::from(3)));
    }

    #[test]
    fn test_get_property_substituted() {
        let root = PropertyCollection::new_root("root");
        root.variables().set("DIR", "/data").unwrap();
        root.define_property("path", PropertyValue::Str("${DIR}/x.h5".into()), "h")
            .unwrap();
        assert_eq!(
            root.get_property_substituted("path").unwrap(),
            PropertyValue::Str("/data/x.h5".into())
        );
    }
}
