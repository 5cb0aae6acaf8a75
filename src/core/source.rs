use std::collections::{BTreeMap, BTreeSet};

use super::collection::{Collection, CollectionError, CollectionEvent};
use super::observable::{Observable, SubscriptionId};
use super::task::Task;
use super::task_list::{NewTask, TaskList, TaskListField};

/// Remote objects deleted locally whose deletion the server has not confirmed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tombstones {
    lists: BTreeSet<String>,
    /// Keyed by the remote id of the parent list.
    tasks: BTreeMap<String, BTreeSet<String>>,
}

impl Tombstones {
    pub fn is_empty(&self) -> bool {
        self.lists.is_empty() && self.tasks.is_empty()
    }

    pub fn add_list(&mut self, remote_id: impl Into<String>) {
        self.lists.insert(remote_id.into());
    }

    pub fn contains_list(&self, remote_id: &str) -> bool {
        self.lists.contains(remote_id)
    }

    pub fn clear_list(&mut self, remote_id: &str) -> bool {
        self.lists.remove(remote_id)
    }

    pub fn lists(&self) -> impl Iterator<Item = &str> {
        self.lists.iter().map(String::as_str)
    }

    pub fn add_task(&mut self, list_remote_id: impl Into<String>, remote_id: impl Into<String>) {
        self.tasks
            .entry(list_remote_id.into())
            .or_default()
            .insert(remote_id.into());
    }

    pub fn contains_task(&self, list_remote_id: &str, remote_id: &str) -> bool {
        self.tasks
            .get(list_remote_id)
            .is_some_and(|ids| ids.contains(remote_id))
    }

    pub fn clear_task(&mut self, list_remote_id: &str, remote_id: &str) -> bool {
        let Some(ids) = self.tasks.get_mut(list_remote_id) else {
            return false;
        };
        let removed = ids.remove(remote_id);
        if ids.is_empty() {
            self.tasks.remove(list_remote_id);
        }
        removed
    }

    /// `(list remote id, task remote id)` pairs.
    pub fn tasks(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tasks.iter().flat_map(|(list, ids)| {
            ids.iter().map(move |id| (list.as_str(), id.as_str()))
        })
    }
}

/// Non-fatal problems a Source reports to its observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    LoadError(String),
    SaveError(String),
    SyncError(String),
}

/// A backend (remote account or local storage) and the task lists it owns.
#[derive(Debug)]
pub struct Source {
    id: String,
    name: String,
    icon: String,
    online: bool,
    pub lists: Collection<TaskList>,
    pub tombstones: Tombstones,
    events: Observable<SourceEvent>,
}

impl Source {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        icon: impl Into<String>,
        online: bool,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            icon: icon.into(),
            online,
            lists: Collection::new(),
            tombstones: Tombstones::default(),
            events: Observable::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn icon(&self) -> &str {
        &self.icon
    }

    /// True for sources backed by a remote service.
    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn list(&self, id: &str) -> Option<&TaskList> {
        self.lists.get(id)
    }

    pub fn create_task_list(&mut self, title: impl Into<String>) -> String {
        // Fresh lists have no id, so insertion cannot collide.
        self.lists.add(TaskList::new(title)).unwrap_or_default()
    }

    pub fn rename_task_list(&mut self, id: &str, title: impl Into<String>) -> bool {
        let title = title.into();
        self.lists.update(id, |list| list.set_title(title)).is_some()
    }

    pub fn delete_task_list(&mut self, id: &str) -> bool {
        self.lists.remove(id).is_some()
    }

    pub fn create_task(&mut self, list_id: &str, new: NewTask) -> Option<String> {
        self.lists.update(list_id, |list| list.create_task(new))
    }

    pub fn update_task<R>(
        &mut self,
        list_id: &str,
        task_id: &str,
        f: impl FnOnce(&mut Task) -> R,
    ) -> Option<R> {
        self.lists
            .update(list_id, |list| list.update_task(task_id, f))
            .flatten()
    }

    pub fn delete_task(&mut self, list_id: &str, task_id: &str) -> bool {
        self.lists
            .update(list_id, |list| list.delete_task(task_id).is_some())
            .unwrap_or(false)
    }

    /// Swap in freshly loaded contents: one `Cleared`, then one `Added` per list.
    pub fn replace_contents(
        &mut self,
        lists: Vec<TaskList>,
        tombstones: Tombstones,
    ) -> Result<(), CollectionError> {
        self.lists.clear();
        for list in lists {
            self.lists.add(list)?;
        }
        self.tombstones = tombstones;
        Ok(())
    }

    pub fn subscribe_lists(
        &mut self,
        callback: impl FnMut(&CollectionEvent<TaskListField>) + Send + 'static,
    ) -> SubscriptionId {
        self.lists.subscribe(callback)
    }

    pub fn subscribe_events(
        &mut self,
        callback: impl FnMut(&SourceEvent) + Send + 'static,
    ) -> SubscriptionId {
        self.events.subscribe(callback)
    }

    pub fn unsubscribe_events(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn report(&mut self, event: SourceEvent) {
        match &event {
            SourceEvent::LoadError(message) => {
                log::error!("Source {}: load failed: {}", self.name, message)
            }
            SourceEvent::SaveError(message) => {
                log::error!("Source {}: save failed: {}", self.name, message)
            }
            SourceEvent::SyncError(message) => {
                log::warn!("Source {}: sync error: {}", self.name, message)
            }
        }
        self.events.emit(&event);
    }

    pub fn task_count(&self) -> usize {
        self.lists.iter().map(|list| list.tasks().len()).sum()
    }
}
