use std::collections::HashSet;
use std::fmt;

use indexmap::IndexMap;
use uuid::Uuid;

use super::observable::{Observable, SubscriptionId};

/// A record that can live in a [`Collection`].
pub trait Entity {
    /// What an `item-changed` event reports as having changed.
    type Field: Clone + fmt::Debug + Send + 'static;

    /// Prefix for generated ids.
    const ID_PREFIX: &'static str;

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);

    /// Builtin items survive [`Collection::reconcile`].
    fn builtin(&self) -> bool {
        false
    }

    /// Identifier of the remote object this entity mirrors, if any.
    fn remote_id(&self) -> Option<&str> {
        None
    }

    /// Drain the fields written since the last call.
    fn take_changes(&mut self) -> Vec<Self::Field> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionEvent<F> {
    Added { id: String },
    Removed { id: String, remote_id: Option<String> },
    Changed { id: String, field: F },
    /// Everything was dropped at once; observers discard what they cached.
    Cleared,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CollectionError {
    #[error("an item with id {0} is already in the collection")]
    DuplicateId(String),
}

/// Length of the random part of a generated id.
pub const GENERATED_ID_LEN: usize = 64;

fn generate_id(prefix: &str) -> String {
    format!(
        "{}-{}{}",
        prefix,
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// Keyed, observable container. Iteration follows insertion order.
pub struct Collection<T: Entity> {
    items: IndexMap<String, T>,
    events: Observable<CollectionEvent<T::Field>>,
}

impl<T: Entity> Collection<T> {
    pub fn new() -> Self {
        Self {
            items: IndexMap::new(),
            events: Observable::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.items.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    /// Snapshot of the current ids, safe to walk while mutating the collection.
    pub fn ids(&self) -> Vec<String> {
        self.items.keys().cloned().collect()
    }

    pub fn find(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<&T> {
        self.items.values().find(|item| predicate(*item))
    }

    pub fn find_by_remote_id(&self, remote_id: &str) -> Option<&T> {
        self.find(|item| item.remote_id() == Some(remote_id))
    }

    /// Insert `item`, generating an id when it has none. Returns the id.
    pub fn add(&mut self, mut item: T) -> Result<String, CollectionError> {
        let id = if item.id().is_empty() {
            let id = loop {
                let candidate = generate_id(T::ID_PREFIX);
                if !self.items.contains_key(&candidate) {
                    break candidate;
                }
            };
            item.set_id(id.clone());
            id
        } else if self.items.contains_key(item.id()) {
            return Err(CollectionError::DuplicateId(item.id().to_string()));
        } else {
            item.id().to_string()
        };

        item.take_changes();
        self.items.insert(id.clone(), item);
        self.events.emit(&CollectionEvent::Added { id: id.clone() });
        Ok(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        let item = self.items.shift_remove(id)?;
        self.events.emit(&CollectionEvent::Removed {
            id: id.to_string(),
            remote_id: item.remote_id().map(str::to_string),
        });
        Some(item)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.events.emit(&CollectionEvent::Cleared);
    }

    /// Mutate one item in place, then announce every field it recorded as changed.
    pub fn update<R>(&mut self, id: &str, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let item = self.items.get_mut(id)?;
        let result = f(item);
        let changes = item.take_changes();
        for field in changes {
            self.events.emit(&CollectionEvent::Changed {
                id: id.to_string(),
                field,
            });
        }
        Some(result)
    }

    /// Make the collection hold exactly the ids in `new_items`, keeping
    /// builtin items regardless. Items already present are kept as they are,
    /// not replaced. Returns what was removed.
    pub fn reconcile(&mut self, new_items: Vec<T>) -> Vec<T> {
        let wanted: HashSet<String> = new_items
            .iter()
            .filter(|item| !item.id().is_empty())
            .map(|item| item.id().to_string())
            .collect();

        let mut removed = Vec::new();
        for id in self.ids() {
            let keep = wanted.contains(&id) || self.items.get(&id).is_some_and(T::builtin);
            if !keep {
                if let Some(item) = self.remove(&id) {
                    removed.push(item);
                }
            }
        }

        for item in new_items {
            if item.id().is_empty() || !self.items.contains_key(item.id()) {
                if let Err(e) = self.add(item) {
                    log::warn!("Skipping item during reconcile: {}", e);
                }
            }
        }

        removed
    }

    pub fn subscribe(
        &mut self,
        callback: impl FnMut(&CollectionEvent<T::Field>) + Send + 'static,
    ) -> SubscriptionId {
        self.events.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }
}

impl<T: Entity> Default for Collection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity + fmt::Debug> fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("items", &self.items)
            .field("events", &self.events)
            .finish()
    }
}
