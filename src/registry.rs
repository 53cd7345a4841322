//! The endpoint registry: path → handler descriptor.
//!
//! Owned and mutated exclusively by the hub worker. At most one entry per
//! path; a duplicate registration is a conflict at *this* hub regardless of
//! what ancestors hold.

use std::{collections::HashMap, fmt};

use crate::{
    error::HubError,
    hub::HubHandle,
    message::{meta, ApiHandler, ClientId, Metadata},
};

/// What actually serves a registered path.
#[derive(Clone)]
pub enum HandlerRef {
    /// A callable living in this process.
    Local(ApiHandler),
    /// A connected peer (remote node, or a child hub speaking over a
    /// channel) that serves the path. Weak: the entry dies with the client.
    Remote(ClientId),
    /// A child hub in this process that announced the path.
    Descendant(HubHandle),
}

impl fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerRef::Local(_) => f.write_str("Local(..)"),
            HandlerRef::Remote(id) => write!(f, "Remote({id})"),
            HandlerRef::Descendant(h) => write!(f, "Descendant({})", h.hub_id()),
        }
    }
}

/// One registered endpoint.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// The handler descriptor.
    pub handler: HandlerRef,
    /// Registration metadata (fallback declarations, `local_only`, ...).
    pub metadata: Metadata,
    /// The participant that owns the registration.
    pub owner: ClientId,
    /// True while the parent hub has not acknowledged the registration
    /// notice for this entry. Retried on the hub's sync tick.
    pub parent_unsynced: bool,
}

/// Path-keyed endpoint table with a fallback-hint side table.
///
/// Fallback hints outlive their entries: deregistering a path keeps its
/// declared fallback, so callers of a vacated versioned path still reach the
/// alternate. Re-registering the path replaces the hint.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<String, RegistryEntry>,
    fallbacks: HashMap<String, String>,
}

impl Registry {
    /// Insert an entry. Fails with [`HubError::Conflict`] if the path is
    /// already present in this registry.
    pub fn insert(
        &mut self,
        path: &str,
        handler: HandlerRef,
        metadata: Metadata,
        owner: ClientId,
        parent_unsynced: bool,
    ) -> Result<(), HubError> {
        if self.entries.contains_key(path) {
            return Err(HubError::Conflict(path.to_string()));
        }
        match metadata.get(meta::FALLBACK) {
            Some(fallback) => {
                self.fallbacks.insert(path.to_string(), fallback.clone());
            }
            None => {
                self.fallbacks.remove(path);
            }
        }
        self.entries.insert(
            path.to_string(),
            RegistryEntry {
                handler,
                metadata,
                owner,
                parent_unsynced,
            },
        );
        Ok(())
    }

    /// Remove an entry, keeping its fallback hint. Idempotent.
    pub fn remove(&mut self, path: &str) -> Option<RegistryEntry> {
        self.entries.remove(path)
    }

    /// The entry for an exact path, if any.
    pub fn get(&self, path: &str) -> Option<&RegistryEntry> {
        self.entries.get(path)
    }

    /// The declared fallback for `path`, whether or not the entry survives.
    pub fn fallback_for(&self, path: &str) -> Option<&str> {
        self.fallbacks.get(path).map(String::as_str)
    }

    /// All registered paths, unordered.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Remove every entry owned by `owner`, returning the removed paths so
    /// deregistration notices can go upward.
    pub fn remove_owned_by(&mut self, owner: ClientId) -> Vec<String> {
        let removed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.owner == owner)
            .map(|(p, _)| p.clone())
            .collect();
        for path in &removed {
            self.entries.remove(path);
        }
        removed
    }

    /// Remove every entry routed through the given descendant hub.
    pub fn remove_descendant(&mut self, hub_id: crate::message::HubId) -> Vec<String> {
        let removed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| matches!(&e.handler, HandlerRef::Descendant(h) if h.hub_id() == hub_id))
            .map(|(p, _)| p.clone())
            .collect();
        for path in &removed {
            self.entries.remove(path);
        }
        removed
    }

    /// Mark the entry at `path` as acknowledged by the parent.
    pub fn mark_synced(&mut self, path: &str) {
        if let Some(entry) = self.entries.get_mut(path) {
            entry.parent_unsynced = false;
        }
    }

    /// Mark every announceable entry as unsynced, e.g. after the parent
    /// link reconnected and its cache is gone.
    pub fn mark_all_unsynced(&mut self) {
        for entry in self.entries.values_mut() {
            if !entry.metadata.contains_key(meta::LOCAL_ONLY) {
                entry.parent_unsynced = true;
            }
        }
    }

    /// Paths whose registration notice is still owed to the parent.
    pub fn unsynced(&self) -> Vec<(String, Metadata)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.parent_unsynced && !e.metadata.contains_key(meta::LOCAL_ONLY))
            .map(|(p, e)| (p.clone(), e.metadata.clone()))
            .collect()
    }

    /// Number of registered endpoints.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no endpoints are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::handler;

    fn noop() -> HandlerRef {
        HandlerRef::Local(handler(|_req| async { Ok(Vec::new()) }))
    }

    #[test]
    fn duplicate_paths_conflict() {
        let mut reg = Registry::default();
        let owner = ClientId::new();
        reg.insert("/a", noop(), Metadata::new(), owner, false).unwrap();
        let err = reg
            .insert("/a", noop(), Metadata::new(), owner, false)
            .unwrap_err();
        assert!(matches!(err, HubError::Conflict(p) if p == "/a"));
    }

    #[test]
    fn register_then_deregister_restores_prior_state() {
        let mut reg = Registry::default();
        let owner = ClientId::new();
        reg.insert("/a", noop(), Metadata::new(), owner, false).unwrap();
        assert!(reg.remove("/a").is_some());
        assert!(reg.remove("/a").is_none());
        assert!(reg.is_empty());
        // Re-registration after removal is allowed again.
        reg.insert("/a", noop(), Metadata::new(), owner, false).unwrap();
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn fallback_hint_survives_removal() {
        let mut reg = Registry::default();
        let owner = ClientId::new();
        let mut md = Metadata::new();
        md.insert(meta::FALLBACK.into(), "/api/v1/users".into());
        reg.insert("/api/v2/users", noop(), md, owner, false).unwrap();
        reg.remove("/api/v2/users");
        assert_eq!(reg.fallback_for("/api/v2/users"), Some("/api/v1/users"));

        // Re-registering without a fallback replaces the hint.
        reg.insert("/api/v2/users", noop(), Metadata::new(), owner, false)
            .unwrap();
        assert_eq!(reg.fallback_for("/api/v2/users"), None);
    }

    #[test]
    fn parent_sync_bookkeeping_skips_local_only_entries() {
        let mut reg = Registry::default();
        let owner = ClientId::new();
        reg.insert("/a", noop(), Metadata::new(), owner, true).unwrap();
        let mut hidden = Metadata::new();
        hidden.insert(meta::LOCAL_ONLY.into(), "true".into());
        reg.insert("/hidden", noop(), hidden, owner, false).unwrap();

        let owed: Vec<String> = reg.unsynced().into_iter().map(|(p, _)| p).collect();
        assert_eq!(owed, vec!["/a".to_string()]);

        reg.mark_synced("/a");
        assert!(reg.unsynced().is_empty());

        // A reconnect owes every announceable entry again.
        reg.mark_all_unsynced();
        let owed: Vec<String> = reg.unsynced().into_iter().map(|(p, _)| p).collect();
        assert_eq!(owed, vec!["/a".to_string()]);
    }

    #[test]
    fn owner_sweep_removes_only_their_entries() {
        let mut reg = Registry::default();
        let a = ClientId::new();
        let b = ClientId::new();
        reg.insert("/a1", noop(), Metadata::new(), a, false).unwrap();
        reg.insert("/a2", noop(), Metadata::new(), a, false).unwrap();
        reg.insert("/b1", noop(), Metadata::new(), b, false).unwrap();

        let mut removed = reg.remove_owned_by(a);
        removed.sort();
        assert_eq!(removed, vec!["/a1".to_string(), "/a2".to_string()]);
        assert_eq!(reg.len(), 1);
        assert!(reg.get("/b1").is_some());
    }
}
