//! Layered key/value property context handed down flow trees.
//!
//! A `Props` is a flat string map that may sit on top of a parent layer;
//! lookups fall through to the parent, writes always land in the local
//! layer. Flow nodes compare incoming props by flattened content, so two
//! independently-built layerings with the same visible entries are equal.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// An immutable-by-convention layered property set.
#[derive(Debug, Clone, Default)]
pub struct Props {
    parent: Option<Arc<Props>>,
    local: BTreeMap<String, String>,
}

impl Props {
    /// Create an empty property set with no parent.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a property set from a flat map.
    pub fn from_map(map: BTreeMap<String, String>) -> Self {
        Self {
            parent: None,
            local: map,
        }
    }

    /// Layer `local` on top of `parent`. Entries in `local` shadow the
    /// parent's entries of the same key.
    pub fn layered(parent: &Props, local: &Props) -> Self {
        Self {
            parent: Some(Arc::new(parent.clone())),
            local: local.flatten(),
        }
    }

    /// Look a key up, falling through to the parent layer.
    pub fn get(&self, key: &str) -> Option<&str> {
        match self.local.get(key) {
            Some(v) => Some(v.as_str()),
            None => self.parent.as_ref().and_then(|p| p.get(key)),
        }
    }

    /// Insert into the local layer.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.local.insert(key.into(), value.into());
    }

    /// The full visible view, parent entries shadowed by local ones.
    pub fn flatten(&self) -> BTreeMap<String, String> {
        let mut out = match &self.parent {
            Some(p) => p.flatten(),
            None => BTreeMap::new(),
        };
        for (k, v) in &self.local {
            out.insert(k.clone(), v.clone());
        }
        out
    }

    /// All visible keys.
    pub fn keys(&self) -> Vec<String> {
        self.flatten().into_keys().collect()
    }

    /// Content equality on the flattened view.
    pub fn equals_props(&self, other: &Props) -> bool {
        self.flatten() == other.flatten()
    }

    /// True when no key is visible through any layer.
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.parent.as_ref().map_or(true, |p| p.is_empty())
    }

    /// A copy with the given keys removed from the visible view.
    pub fn without_keys(&self, keys: &[&str]) -> Props {
        let mut flat = self.flatten();
        for key in keys {
            flat.remove(*key);
        }
        Props::from_map(flat)
    }
}

impl PartialEq for Props {
    fn eq(&self, other: &Self) -> bool {
        self.equals_props(other)
    }
}

impl Eq for Props {}

impl fmt::Display for Props {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flat = self.flatten();
        write!(f, "{{")?;
        for (i, (k, v)) in flat.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{k}={v}")?;
        }
        write!(f, "}}")
    }
}
