//! Resources hosted by this process.
//!
//! Entries are found by location, by class (or declared interface) in
//! registration order, or by class plus ordinal index. A location whose name
//! is an index, like `/Camera/0`, resolves to the n-th object of that class
//! unless an object was registered under that exact name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::error::RegistryError;
use crate::location::Name;
use crate::object::{ObjectContext, RemoteObject};
use crate::Location;

/// One hosted object and what the broker knows about it.
#[derive(Clone)]
pub struct ResourceEntry {
    pub location: Location,
    pub object: Arc<dyn RemoteObject>,
    pub class: String,
    pub interfaces: Vec<String>,
    pub context: ObjectContext,
    pub created: Instant,
    pub sequence: u64,
}

impl ResourceEntry {
    pub fn new(location: Location, object: Arc<dyn RemoteObject>, context: ObjectContext) -> Self {
        Self {
            class: location.class().to_string(),
            location,
            object,
            interfaces: Vec::new(),
            context,
            created: Instant::now(),
            sequence: 0,
        }
    }

    pub fn with_interfaces(mut self, interfaces: Vec<String>) -> Self {
        self.interfaces = interfaces;
        self
    }

    /// Whether this entry is of `class`, directly or through an interface.
    pub fn provides(&self, class: &str) -> bool {
        self.class == class || self.interfaces.iter().any(|i| i == class)
    }
}

impl std::fmt::Debug for ResourceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceEntry")
            .field("location", &self.location)
            .field("class", &self.class)
            .field("interfaces", &self.interfaces)
            .field("sequence", &self.sequence)
            .finish()
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Location, ResourceEntry>,
    next_sequence: u64,
}

impl Inner {
    fn by_class(&self, class: &str) -> Vec<&ResourceEntry> {
        let mut found: Vec<&ResourceEntry> = self.entries.values().filter(|e| e.provides(class)).collect();
        found.sort_by_key(|e| e.sequence);
        found
    }

    fn resolve(&self, location: &Location) -> Option<&ResourceEntry> {
        if let Some(entry) = self.entries.get(location) {
            return Some(entry);
        }
        match location.name() {
            Name::Index(index) => self.by_class(location.class()).get(*index).copied(),
            Name::Named(_) => None,
        }
    }
}

/// Thread-safe table of hosted objects.
#[derive(Default)]
pub struct ResourceRegistry {
    inner: RwLock<Inner>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entry`. Returns its index among objects of the same class.
    pub fn add(&self, mut entry: ResourceEntry) -> Result<usize, RegistryError> {
        let mut inner = self.inner.write();
        if inner.entries.contains_key(&entry.location) {
            return Err(RegistryError::AlreadyRegistered(entry.location.to_string()));
        }

        entry.sequence = inner.next_sequence;
        inner.next_sequence += 1;

        let class = entry.class.clone();
        tracing::debug!("Registered {} ({})", entry.location, class);
        inner.entries.insert(entry.location.clone(), entry);

        Ok(inner.by_class(&class).len() - 1)
    }

    /// Unregister the object at exactly `location`.
    pub fn remove(&self, location: &Location) -> Result<ResourceEntry, RegistryError> {
        self.inner
            .write()
            .entries
            .remove(location)
            .ok_or_else(|| RegistryError::NotRegistered(location.to_string()))
    }

    pub fn get(&self, location: &Location) -> Option<ResourceEntry> {
        self.inner.read().resolve(location).cloned()
    }

    /// Objects of `class` or implementing it, oldest first.
    pub fn get_by_class(&self, class: &str) -> Vec<ResourceEntry> {
        self.inner
            .read()
            .by_class(class)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn get_by_index(&self, class: &str, index: usize) -> Option<ResourceEntry> {
        self.inner.read().by_class(class).get(index).map(|e| (*e).clone())
    }

    pub fn contains(&self, location: &Location) -> bool {
        self.inner.read().resolve(location).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every entry, oldest first.
    pub fn entries(&self) -> Vec<ResourceEntry> {
        let inner = self.inner.read();
        let mut entries: Vec<ResourceEntry> = inner.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.sequence);
        entries
    }

    /// Every location, oldest first.
    pub fn locations(&self) -> Vec<Location> {
        self.entries().into_iter().map(|e| e.location).collect()
    }

    pub fn clear(&self) {
        self.inner.write().entries.clear();
    }
}
