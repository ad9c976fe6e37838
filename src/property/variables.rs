//! Hierarchical variables for deferred substitution in property values.
//!
//! Variables are arranged in a tree; lookups walk up the parent chain.
//! Names are case insensitive (canonicalized to upper case). Reading a
//! variable substitutes `${NAME}` references recursively; a raw value of
//! the exact shape `${!expr}` is evaluated as a rhai expression whose
//! string result is substituted again. Unresolved references stay literal.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::error::{NexxTError, Result};

/// Bound on recursive substitution, guarding against cyclic definitions.
const MAX_SUBST_DEPTH: usize = 50;

type ChangeHook = Box<dyn Fn() + Send + Sync>;

/// A collection of variables suitable for substitution in filter
/// properties.
pub struct Variables {
    self_weak: Weak<Variables>,
    parent: RwLock<Option<Arc<Variables>>>,
    vars: RwLock<BTreeMap<String, String>>,
    readonly: RwLock<HashSet<String>>,
    change_hooks: Mutex<Vec<ChangeHook>>,
}

impl Variables {
    /// Create a scope, optionally inheriting from a parent scope.
    pub fn new(parent: Option<Arc<Variables>>) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            parent: RwLock::new(parent),
            vars: RwLock::new(BTreeMap::new()),
            readonly: RwLock::new(HashSet::new()),
            change_hooks: Mutex::new(Vec::new()),
        })
    }

    /// Create a copy of this scope with a new parent.
    pub fn copy_and_reparent(&self, new_parent: Option<Arc<Variables>>) -> Arc<Self> {
        let res = Variables::new(new_parent);
        *res.vars.write().unwrap() = self.vars.read().unwrap().clone();
        *res.readonly.write().unwrap() = self.readonly.read().unwrap().clone();
        res
    }

    /// Reparent the scope (for lookups of unknown variables).
    pub fn set_parent(&self, parent: Option<Arc<Variables>>) {
        *self.parent.write().unwrap() = parent;
    }

    /// Register a hook invoked on every set/delete (used for dirty
    /// tracking).
    pub fn on_change(&self, hook: ChangeHook) {
        self.change_hooks.lock().unwrap().push(hook);
    }

    fn notify_change(&self) {
        for hook in self.change_hooks.lock().unwrap().iter() {
            hook();
        }
    }

    /// The variable names defined in this scope (not including parents).
    pub fn keys(&self) -> Vec<String> {
        self.vars.read().unwrap().keys().cloned().collect()
    }

    /// The raw, non-substituted value of a variable in this scope.
    pub fn getraw(&self, key: &str) -> Result<String> {
        let key = key.to_uppercase();
        self.vars
            .read()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or(NexxTError::VariableNotFound(key))
    }

    /// Whether a variable is defined in this scope.
    pub fn contains(&self, key: &str) -> bool {
        self.vars.read().unwrap().contains_key(&key.to_uppercase())
    }

    /// Set a variable. Modifying a readonly variable to a different value
    /// is an error.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_uppercase();
        if self.is_readonly(&key) {
            let unchanged = self.vars.read().unwrap().get(&key).map(|v| v == value) == Some(true);
            if !unchanged {
                return Err(NexxTError::ReadonlyVariable(key));
            }
            return Ok(());
        }
        self.vars.write().unwrap().insert(key, value.to_string());
        self.notify_change();
        Ok(())
    }

    /// Delete a variable from this scope.
    pub fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_uppercase();
        if self.vars.write().unwrap().remove(&key).is_none() {
            return Err(NexxTError::VariableNotFound(key));
        }
        self.notify_change();
        Ok(())
    }

    /// Set the given variables as readonly, returning the previous set.
    pub fn set_readonly<I, S>(&self, keys: I) -> HashSet<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let new: HashSet<String> = keys
            .into_iter()
            .map(|k| k.as_ref().to_uppercase())
            .collect();
        std::mem::replace(&mut self.readonly.write().unwrap(), new)
    }

    /// Whether the given variable is readonly in this scope.
    pub fn is_readonly(&self, key: &str) -> bool {
        self.readonly
            .read()
            .unwrap()
            .contains(&key.to_uppercase())
    }

    /// The substituted value of a variable, searching up the parent chain.
    pub fn get(&self, key: &str) -> Result<String> {
        let key = key.to_uppercase();
        match self.lookup(&key, 0)? {
            Some(value) => Ok(value),
            None => Err(NexxTError::VariableNotFound(key)),
        }
    }

    /// Recursively substitute `${NAME}` references in the given content.
    /// Unknown names stay literal; `$$` escapes a dollar sign.
    pub fn subst(&self, content: &str) -> Result<String> {
        self.subst_impl(content, 0)
    }

    fn lookup(&self, key: &str, depth: usize) -> Result<Option<String>> {
        if depth > MAX_SUBST_DEPTH {
            return Err(NexxTError::RecursionLimit(key.to_string()));
        }
        let raw = self.vars.read().unwrap().get(key).cloned();
        match raw {
            Some(raw) => {
                let expanded = if raw.starts_with("${!") && raw.ends_with('}') {
                    self.eval_expression(key, &raw[3..raw.len() - 1])
                } else {
                    raw
                };
                Ok(Some(self.subst_impl(&expanded, depth + 1)?))
            }
            None => {
                let parent = self.parent.read().unwrap().clone();
                match parent {
                    Some(parent) => parent.lookup(key, depth + 1),
                    None => Ok(None),
                }
            }
        }
    }

    fn subst_impl(&self, content: &str, depth: usize) -> Result<String> {
        if depth > MAX_SUBST_DEPTH {
            return Err(NexxTError::RecursionLimit(content.to_string()));
        }
        let mut out = String::with_capacity(content.len());
        let mut chars = content.char_indices().peekable();
        while let Some((idx, c)) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            match chars.peek() {
                Some((_, '$')) => {
                    chars.next();
                    out.push('$');
                }
                Some((_, '{')) => {
                    let rest = &content[idx..];
                    match rest.find('}') {
                        Some(end) => {
                            let name = &rest[2..end];
                            match self.lookup(&name.to_uppercase(), depth + 1)? {
                                Some(value) => out.push_str(&value),
                                None => out.push_str(&rest[..=end]),
                            }
                            // skip the consumed reference
                            for _ in 0..end {
                                chars.next();
                            }
                        }
                        None => out.push(c),
                    }
                }
                Some((next_idx, nc)) if nc.is_ascii_alphabetic() || *nc == '_' => {
                    let rest = &content[*next_idx..];
                    let end = rest
                        .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                        .unwrap_or(rest.len());
                    let name = &rest[..end];
                    match self.lookup(&name.to_uppercase(), depth + 1)? {
                        Some(value) => out.push_str(&value),
                        None => {
                            out.push('$');
                            out.push_str(name);
                        }
                    }
                    for _ in 0..end {
                        chars.next();
                    }
                }
                _ => out.push(c),
            }
        }
        Ok(out)
    }

    /// Evaluate a `${!expr}` expression. Errors substitute the error text
    /// and log a warning.
    fn eval_expression(&self, key: &str, expr: &str) -> String {
        let mut engine = rhai::Engine::new();
        let subst_weak = self.self_weak.clone();
        engine.register_fn("subst", move |s: &str| -> String {
            subst_weak
                .upgrade()
                .and_then(|v| v.subst(s).ok())
                .unwrap_or_else(|| s.to_string())
        });
        engine.register_fn("parent_dir", |s: &str| -> String {
            Path::new(s)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        engine.register_fn("env_or", |name: &str, default: &str| -> String {
            std::env::var(name).unwrap_or_else(|_| default.to_string())
        });
        match engine.eval::<rhai::Dynamic>(expr) {
            Ok(value) => value.to_string(),
            Err(e) => {
                tracing::warn!(
                    "An error occurred while substituting '{}' evaluating to code '{}': {}",
                    key,
                    expr,
                    e
                );
                format!("<{}>", e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_substitution() {
        let vars = Variables::new(None);
        vars.set("CFG_DIR", "/x").unwrap();
        vars.set("NAME", "demo").unwrap();
        vars.set("P", "${CFG_DIR}/${NAME}.log").unwrap();
        assert_eq!(vars.get("P").unwrap(), "/x/demo.log");

        vars.set("NAME", "prod").unwrap();
        assert_eq!(vars.get("P").unwrap(), "/x/prod.log");
    }

    #[test]
    fn test_case_insensitive_names() {
        let vars = Variables::new(None);
        vars.set("name", "value").unwrap();
        assert_eq!(vars.get("NAME").unwrap(), "value");
        assert_eq!(vars.get("Name").unwrap(), "value");
        assert_eq!(vars.subst("${name}").unwrap(), "value");
    }

    #[test]
    fn test_unknown_names_stay_literal() {
        let vars = Variables::new(None);
        assert_eq!(vars.subst("${UNKNOWN}/x").unwrap(), "${UNKNOWN}/x");
        assert!(vars.get("UNKNOWN").is_err());
    }

    #[test]
    fn test_parent_lookup() {
        let root = Variables::new(None);
        root.set("BASE", "/data").unwrap();
        let child = Variables::new(Some(root));
        child.set("FILE", "${BASE}/rec.h5").unwrap();
        assert_eq!(child.get("FILE").unwrap(), "/data/rec.h5");
    }

    #[test]
    fn test_cycle_raises_recursion_error() {
        let vars = Variables::new(None);
        vars.set("A", "${B}").unwrap();
        vars.set("B", "${A}").unwrap();
        assert!(matches!(
            vars.get("A"),
            Err(NexxTError::RecursionLimit(_))
        ));
    }

    #[test]
    fn test_readonly_enforcement() {
        let vars = Variables::new(None);
        vars.set("CFGFILE", "/a/b.json").unwrap();
        let old = vars.set_readonly(["CFGFILE"]);
        assert!(old.is_empty());
        assert!(vars.set("CFGFILE", "/other.json").is_err());
        // equal-value writes pass
        vars.set("CFGFILE", "/a/b.json").unwrap();
        let old = vars.set_readonly(Vec::<String>::new());
        assert!(old.contains("CFGFILE"));
        vars.set("CFGFILE", "/other.json").unwrap();
    }

    #[test]
    fn test_expression_evaluation() {
        let vars = Variables::new(None);
        vars.set("CFGFILE", "/some/dir/conf.json").unwrap();
        vars.set("CFG_DIR", "${!parent_dir(subst(\"${CFGFILE}\"))}")
            .unwrap();
        assert_eq!(vars.get("CFG_DIR").unwrap(), "/some/dir");
    }

    #[test]
    fn test_expression_error_substitutes_error_text() {
        let vars = Variables::new(None);
        vars.set("X", "${!this is not valid rhai((}").unwrap();
        let value = vars.get("X").unwrap();
        assert!(value.starts_with('<') && value.ends_with('>'));
    }

    #[test]
    fn test_dollar_escape() {
        let vars = Variables::new(None);
        vars.set("A", "1").unwrap();
        assert_eq!(vars.subst("$$${A}").unwrap(), "$1");
    }

    #[test]
    fn test_subst_equals_get_for_keys() {
        let vars = Variables::new(None);
        vars.set("K", "literal-${INNER}").unwrap();
        vars.set("INNER", "42").unwrap();
        assert_eq!(vars.subst("${K}").unwrap(), vars.get("K").unwrap());
    }

    #[test]
    fn test_copy_and_reparent() {
        let root = Variables::new(None);
        root.set("ROOTVAR", "r").unwrap();
        let scope = Variables::new(None);
        scope.set("LOCAL", "${ROOTVAR}").unwrap();
        scope.set_readonly(["LOCAL"]);
        let copied = scope.copy_and_reparent(Some(root));
        assert_eq!(copied.get("LOCAL").unwrap(), "r");
        assert!(copied.is_readonly("local"));
    }
}
