use chrono::{DateTime, Utc};

use super::collection::{Collection, CollectionError, CollectionEvent, Entity};
use super::observable::SubscriptionId;
use super::remote::RemoteObject;
use super::task::{Task, TaskField, bumped};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskListField {
    Title,
    /// A task in the list was added, removed or changed.
    Tasks,
}

/// Fields for a task created through [`TaskList::create_task`].
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub completed: Option<DateTime<Utc>>,
    pub due: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl NewTask {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }
}

/// A named collection of tasks. Every task mutation goes through the list so
/// `updated` tracks its contents.
#[derive(Debug)]
pub struct TaskList {
    id: String,
    title: String,
    updated: DateTime<Utc>,
    tasks: Collection<Task>,
    remote: Option<RemoteObject>,
    changes: Vec<TaskListField>,
}

impl TaskList {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            title: title.into(),
            updated: Utc::now(),
            tasks: Collection::new(),
            remote: None,
            changes: Vec::new(),
        }
    }

    /// Rebuild a list from stored fields without recording any change.
    pub fn restore(id: String, title: String, updated: DateTime<Utc>) -> Self {
        Self {
            id,
            title,
            updated,
            tasks: Collection::new(),
            remote: None,
            changes: Vec::new(),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn updated(&self) -> DateTime<Utc> {
        self.updated
    }

    pub fn remote(&self) -> Option<&RemoteObject> {
        self.remote.as_ref()
    }

    pub fn tasks(&self) -> &Collection<Task> {
        &self.tasks
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        let title = title.into();
        if self.title != title {
            self.title = title;
            self.touch(TaskListField::Title);
        }
    }

    /// Replace the remote mirror. Bookkeeping only: no change is recorded.
    pub fn set_remote(&mut self, remote: Option<RemoteObject>) {
        self.remote = remote;
    }

    pub fn create_task(&mut self, new: NewTask) -> String {
        let mut task = Task::new(new.title);
        task.set_completed(new.completed);
        task.set_due(new.due);
        task.set_notes(new.notes);
        // Fresh tasks have no id, so insertion cannot collide.
        self.add_task(task).unwrap_or_default()
    }

    pub fn add_task(&mut self, task: Task) -> Result<String, CollectionError> {
        let id = self.tasks.add(task)?;
        self.touch(TaskListField::Tasks);
        Ok(id)
    }

    /// Insert a task read back from storage; `updated` is left alone.
    pub fn restore_task(&mut self, task: Task) -> Result<String, CollectionError> {
        self.tasks.add(task)
    }

    pub fn delete_task(&mut self, id: &str) -> Option<Task> {
        let task = self.tasks.remove(id)?;
        self.touch(TaskListField::Tasks);
        Some(task)
    }

    /// Mutate one task. Returns `None` when the task does not exist.
    pub fn update_task<R>(&mut self, id: &str, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        let mut changed = false;
        let result = self.tasks.update(id, |task| {
            let result = f(task);
            changed = task.has_changes();
            result
        })?;
        if changed {
            self.touch(TaskListField::Tasks);
        }
        Some(result)
    }

    pub fn subscribe_tasks(
        &mut self,
        callback: impl FnMut(&CollectionEvent<TaskField>) + Send + 'static,
    ) -> SubscriptionId {
        self.tasks.subscribe(callback)
    }

    pub fn unsubscribe_tasks(&mut self, id: SubscriptionId) -> bool {
        self.tasks.unsubscribe(id)
    }

    fn touch(&mut self, field: TaskListField) {
        self.updated = bumped(self.updated);
        if !self.changes.contains(&field) {
            self.changes.push(field);
        }
    }
}

impl Entity for TaskList {
    type Field = TaskListField;
    const ID_PREFIX: &'static str = "tasklist";

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn remote_id(&self) -> Option<&str> {
        self.remote.as_ref().and_then(RemoteObject::id)
    }

    fn take_changes(&mut self) -> Vec<TaskListField> {
        std::mem::take(&mut self.changes)
    }
}
