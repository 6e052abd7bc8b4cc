//! Registry of concrete permissions known to the system

use parking_lot::RwLock;
use std::collections::BTreeSet;

use crate::error::Result;
use crate::resolver::validate_permission;

/// Concrete permissions that pre-expansion can expand grants into.
///
/// Guards register every permission they can ask about when they are
/// built. The version moves whenever the set grows, and pre-expanded
/// snapshots computed against an older version are reloaded.
#[derive(Debug, Default)]
pub struct PermissionRegistry {
    inner: RwLock<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    known: BTreeSet<String>,
    version: u64,
}

impl PermissionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with an initial catalogue
    pub fn with_permissions<I, S>(permissions: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let registry = Self::new();
        registry.register(permissions)?;
        Ok(registry)
    }

    /// Adds permissions; returns how many were new
    pub fn register<I, S>(&self, permissions: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let permissions: Vec<S> = permissions.into_iter().collect();
        for permission in &permissions {
            validate_permission(permission.as_ref())?;
        }

        let mut state = self.inner.write();
        let mut added = 0;
        for permission in permissions {
            if state.known.insert(permission.as_ref().to_string()) {
                added += 1;
            }
        }
        if added > 0 {
            state.version += 1;
        }

        Ok(added)
    }

    pub fn contains(&self, permission: &str) -> bool {
        self.inner.read().known.contains(permission)
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    pub fn len(&self) -> usize {
        self.inner.read().known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().known.is_empty()
    }

    /// Runs `f` against a consistent view of the set and its version
    pub fn with_known<R>(&self, f: impl FnOnce(&BTreeSet<String>, u64) -> R) -> R {
        let state = self.inner.read();
        f(&state.known, state.version)
    }
}
