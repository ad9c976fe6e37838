//! The plugin loader resolving library URLs to filter factories.
//!
//! Supported schemes:
//!
//! - `entry_point://<ident>`: resolve against the in-process factory
//!   registry (the way built-in and statically linked filters are
//!   published).
//! - `binary://<path>`: load a dynamic library and look up the factory
//!   symbol. Libraries are cached by URL and never unloaded: forcing an
//!   unload while filter instances hold references into the library is
//!   unsafe, so handles are kept for the process lifetime.
//! - `pyfile://<path>` / `pymod://<dotted>`: script module backends,
//!   not available in this build.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use crate::environment::{FilterCreationContext, FilterFactory};
use crate::error::{NexxTError, Result};
use crate::filter::Filter;
use crate::property::PropertyCollection;

/// Symbol signature exported by binary filter plugins.
pub type RawFilterFactory =
    fn(&mut FilterCreationContext<'_>) -> Result<Box<dyn Filter>>;

/// Handles the loading of plugins. Accessed through
/// [`PluginManager::default`] in production; tests may construct their
/// own instance.
pub struct PluginManager {
    registry: RwLock<HashMap<String, FilterFactory>>,
    libraries: Mutex<HashMap<String, &'static libloading::Library>>,
}

static DEFAULT: OnceLock<PluginManager> = OnceLock::new();

impl PluginManager {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            libraries: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide plugin manager.
    pub fn default() -> &'static PluginManager {
        DEFAULT.get_or_init(PluginManager::new)
    }

    /// Publish a filter factory under an `entry_point://` identifier.
    /// Re-registration replaces the factory.
    pub fn register_entry_point(&self, ident: &str, factory: FilterFactory) {
        self.registry
            .write()
            .unwrap()
            .insert(ident.to_string(), factory);
    }

    /// The registered entry point identifiers.
    pub fn entry_points(&self) -> Vec<String> {
        let mut idents: Vec<String> = self.registry.read().unwrap().keys().cloned().collect();
        idents.sort();
        idents
    }

    /// Resolve a library URL and factory name to a filter factory.
    pub fn create_factory(
        &self,
        library: &str,
        factory: &str,
        props: &Arc<PropertyCollection>,
    ) -> Result<FilterFactory> {
        if let Some(ident) = library.strip_prefix("entry_point://") {
            return self
                .registry
                .read()
                .unwrap()
                .get(ident)
                .cloned()
                .ok_or_else(|| {
                    NexxTError::Plugin(format!(
                        "requested creation func '{}' not found in {}",
                        factory, library
                    ))
                });
        }
        if let Some(path) = library.strip_prefix("binary://") {
            return self.binary_factory(library, path, factory, props);
        }
        if library.starts_with("pyfile://") || library.starts_with("pymod://") {
            return Err(NexxTError::UnknownPluginType(format!(
                "{} (script module backends are not available)",
                library
            )));
        }
        Err(NexxTError::UnknownPluginType(library.to_string()))
    }

    fn binary_factory(
        &self,
        url: &str,
        path: &str,
        factory: &str,
        props: &Arc<PropertyCollection>,
    ) -> Result<FilterFactory> {
        let lib = {
            let mut libraries = self.libraries.lock().unwrap();
            match libraries.get(url) {
                Some(lib) => *lib,
                None => {
                    let resolved = resolve_binary_path(&props.evalpath(path));
                    tracing::debug!("loading binary plugin from file '{}'", resolved.display());
                    let lib = unsafe { libloading::Library::new(&resolved) }.map_err(|e| {
                        NexxTError::Plugin(format!(
                            "failed to load library {}: {}",
                            resolved.display(),
                            e
                        ))
                    })?;
                    // libraries stay loaded for the process lifetime,
                    // unloading while filters hold references is unsafe
                    let lib: &'static libloading::Library = Box::leak(Box::new(lib));
                    libraries.insert(url.to_string(), lib);
                    lib
                }
            }
        };
        let raw: RawFilterFactory = unsafe {
            lib.get::<RawFilterFactory>(factory.as_bytes())
                .map(|sym| *sym)
                .map_err(|e| {
                    NexxTError::Plugin(format!(
                        "requested creation func '{}' not found in {} ({})",
                        factory, url, e
                    ))
                })?
        };
        Ok(Arc::new(
            move |ctx: &mut FilterCreationContext| raw(ctx),
        ))
    }

    /// Forget all cached library handles. The libraries themselves stay
    /// loaded; unload is deferred indefinitely.
    pub fn unload_all(&self) {
        self.libraries.lock().unwrap().clear();
    }
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Search an extra directory list (`NEXXT_CEXT_PATH`) for relative
/// library paths.
fn resolve_binary_path(path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() || p.exists() {
        return p.to_path_buf();
    }
    if let Ok(search) = std::env::var("NEXXT_CEXT_PATH") {
        for dir in std::env::split_paths(&search) {
            let candidate = dir.join(p);
            if candidate.exists() {
                return candidate;
            }
        }
    }
    p.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;
    impl Filter for Nop {}

    fn nop_factory() -> FilterFactory {
        Arc::new(|_ctx: &mut FilterCreationContext| Ok(Box::new(Nop) as Box<dyn Filter>))
    }

    #[test]
    fn test_entry_point_resolution() {
        let mgr = PluginManager::new();
        mgr.register_entry_point("tests.Nop", nop_factory());
        let props = PropertyCollection::new_root("root");
        assert!(mgr
            .create_factory("entry_point://tests.Nop", "Nop", &props)
            .is_ok());
        assert!(mgr
            .create_factory("entry_point://tests.Missing", "Nop", &props)
            .is_err());
        assert_eq!(mgr.entry_points(), vec!["tests.Nop".to_string()]);
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        let mgr = PluginManager::new();
        let props = PropertyCollection::new_root("root");
        assert!(matches!(
            mgr.create_factory("ftp://x", "f", &props),
            Err(NexxTError::UnknownPluginType(_))
        ));
        assert!(matches!(
            mgr.create_factory("pyfile:///a/b.py", "f", &props),
            Err(NexxTError::UnknownPluginType(_))
        ));
    }

    #[test]
    fn test_missing_binary_fails_to_load() {
        let mgr = PluginManager::new();
        let props = PropertyCollection::new_root("root");
        assert!(matches!(
            mgr.create_factory("binary:///does/not/exist.so", "f", &props),
            Err(NexxTError::Plugin(_))
        ));
    }
}
