//! Configuration file handling: JSON main file plus a `.guistate`
//! sidecar.
//!
//! The sidecar keeps UI-only state out of the main file so that the main
//! file stays diff-friendly. On load the sidecar is merged back into the
//! document; unreadable sidecars are ignored with a warning.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::config::configuration::Configuration;
use crate::error::{NexxTError, Result};

/// Loads and saves configurations using a JSON format.
pub struct ConfigFileLoader;

impl ConfigFileLoader {
    /// Load a configuration from file, merging the `.guistate` sidecar if
    /// present.
    pub fn load(config: &mut Configuration, file: impl AsRef<Path>) -> Result<()> {
        Self::load_with_focus(config, file, None)
    }

    /// Like [`ConfigFileLoader::load`], but when `focus` names an
    /// application, all other applications are discarded from the loaded
    /// document to save memory.
    pub fn load_with_focus(
        config: &mut Configuration,
        file: impl AsRef<Path>,
        focus: Option<&str>,
    ) -> Result<()> {
        let file = file.as_ref();
        let text = std::fs::read_to_string(file)?;
        let mut cfg: Value = serde_json::from_str(&text)?;
        if let Some(focus) = focus {
            if let Some(apps) = cfg.get_mut("applications").and_then(|v| v.as_array_mut()) {
                apps.retain(|a| a.get("name").and_then(|v| v.as_str()) == Some(focus));
            }
        }
        let absolute = file
            .canonicalize()
            .unwrap_or_else(|_| file.to_path_buf());
        cfg.as_object_mut()
            .ok_or_else(|| NexxTError::Config("config file is not a JSON object".into()))?
            .insert(
                "CFGFILE".into(),
                Value::String(absolute.to_string_lossy().into_owned()),
            );
        let guistate_file = Self::guistate_path(file);
        if guistate_file.exists() {
            match std::fs::read_to_string(&guistate_file)
                .map_err(NexxTError::from)
                .and_then(|t| serde_json::from_str::<Value>(&t).map_err(NexxTError::from))
            {
                Ok(guistate) => Self::merge(&mut cfg, &guistate),
                Err(e) => {
                    tracing::warn!(
                        "ignoring error while loading {}: {}",
                        guistate_file.display(),
                        e
                    );
                }
            }
        } else {
            tracing::info!("no gui state file for config, using default values.");
        }
        config.load(&cfg)
    }

    /// Save the configuration, splitting gui state into the sidecar file.
    pub fn save(config: &mut Configuration, file: Option<&Path>) -> Result<()> {
        let mut cfg = config.save(file.map(|f| f.to_string_lossy().into_owned()).as_deref())?;
        let target: PathBuf = match file {
            Some(f) => f.to_path_buf(),
            None => PathBuf::from(
                cfg.get("CFGFILE")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| NexxTError::Config("no config file name given".into()))?,
            ),
        };
        if let Some(obj) = cfg.as_object_mut() {
            obj.remove("CFGFILE");
        }
        let guistate = Self::split(&mut cfg);
        std::fs::write(&target, serde_json::to_string_pretty(&cfg)? + "\n")?;
        let guistate_file = Self::guistate_path(&target);
        std::fs::write(
            &guistate_file,
            serde_json::to_string_pretty(&guistate)? + "\n",
        )?;
        Ok(())
    }

    fn guistate_path(file: &Path) -> PathBuf {
        let mut name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(".guistate");
        file.with_file_name(name)
    }

    /// Merge gui state from the sidecar document into the main document.
    fn merge(cfg: &mut Value, guistate: &Value) {
        if let Some(gs) = guistate.get("_guiState") {
            if let Some(obj) = cfg.as_object_mut() {
                obj.insert("_guiState".into(), gs.clone());
            }
        }
        for key in ["composite_filters", "applications"] {
            let Some(gs_list) = guistate.get(key).and_then(|v| v.as_array()) else {
                continue;
            };
            let Some(cfg_list) = cfg.get_mut(key).and_then(|v| v.as_array_mut()) else {
                continue;
            };
            for entry in cfg_list {
                let name = entry.get("name").and_then(|v| v.as_str()).map(String::from);
                let Some(name) = name else { continue };
                let matching = gs_list
                    .iter()
                    .find(|g| g.get("name").and_then(|v| v.as_str()) == Some(&name));
                if let (Some(m), Some(obj)) = (matching, entry.as_object_mut()) {
                    if let Some(gs) = m.get("_guiState") {
                        obj.insert("_guiState".into(), gs.clone());
                    }
                }
            }
        }
    }

    /// Extract gui state out of the main document, returning the sidecar
    /// document. The main document keeps empty placeholders.
    fn split(cfg: &mut Value) -> Value {
        let mut sidecar = Map::new();
        if let Some(obj) = cfg.as_object_mut() {
            if let Some(gs) = obj.insert("_guiState".into(), Value::Object(Map::new())) {
                sidecar.insert("_guiState".into(), gs);
            }
        }
        for key in ["composite_filters", "applications"] {
            let mut entries = Vec::new();
            if let Some(list) = cfg.get_mut(key).and_then(|v| v.as_array_mut()) {
                for entry in list {
                    let Some(obj) = entry.as_object_mut() else { continue };
                    let name = obj.get("name").cloned().unwrap_or(Value::Null);
                    if let Some(gs) = obj.insert("_guiState".into(), Value::Object(Map::new())) {
                        let mut e = Map::new();
                        e.insert("name".into(), name);
                        e.insert("_guiState".into(), gs);
                        entries.push(Value::Object(e));
                    }
                }
            }
            sidecar.insert(key.into(), Value::Array(entries));
        }
        Value::Object(sidecar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_guistate_path() {
        assert_eq!(
            ConfigFileLoader::guistate_path(Path::new("/a/b/conf.json")),
            PathBuf::from("/a/b/conf.json.guistate")
        );
    }

    #[test]
    fn test_split_and_merge_round_trip() {
        let mut cfg = json!({
            "_guiState": {"main": {"w": 100}},
            "composite_filters": [],
            "applications": [
                {"name": "app", "_guiState": {"zoom": 2}, "nodes": [], "connections": []}
            ]
        });
        let original = cfg.clone();
        let sidecar = ConfigFileLoader::split(&mut cfg);
        // main document now carries empty placeholders
        assert_eq!(cfg["_guiState"], json!({}));
        assert_eq!(cfg["applications"][0]["_guiState"], json!({}));
        ConfigFileLoader::merge(&mut cfg, &sidecar);
        assert_eq!(cfg, original);
    }
}
