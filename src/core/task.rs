use chrono::{DateTime, Utc};

use super::collection::Entity;
use super::remote::RemoteObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskField {
    Title,
    Completed,
    Due,
    Notes,
}

/// Current time, never earlier than `previous`.
pub(crate) fn bumped(previous: DateTime<Utc>) -> DateTime<Utc> {
    previous.max(Utc::now())
}

#[derive(Debug, Clone)]
pub struct Task {
    id: String,
    title: String,
    completed: Option<DateTime<Utc>>,
    due: Option<DateTime<Utc>>,
    notes: Option<String>,
    updated: DateTime<Utc>,
    remote: Option<RemoteObject>,
    changes: Vec<TaskField>,
}

impl Task {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            title: title.into(),
            completed: None,
            due: None,
            notes: None,
            updated: Utc::now(),
            remote: None,
            changes: Vec::new(),
        }
    }

    /// Rebuild a task from stored fields without recording any change.
    pub fn restore(
        id: Option<String>,
        title: String,
        completed: Option<DateTime<Utc>>,
        due: Option<DateTime<Utc>>,
        notes: Option<String>,
        updated: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.unwrap_or_default(),
            title,
            completed,
            due,
            notes,
            updated,
            remote: None,
            changes: Vec::new(),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn completed(&self) -> Option<DateTime<Utc>> {
        self.completed
    }

    pub fn is_completed(&self) -> bool {
        self.completed.is_some()
    }

    pub fn due(&self) -> Option<DateTime<Utc>> {
        self.due
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn updated(&self) -> DateTime<Utc> {
        self.updated
    }

    pub fn remote(&self) -> Option<&RemoteObject> {
        self.remote.as_ref()
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        let title = title.into();
        if self.title != title {
            self.title = title;
            self.touch(TaskField::Title);
        }
    }

    pub fn set_completed(&mut self, completed: Option<DateTime<Utc>>) {
        if self.completed != completed {
            self.completed = completed;
            self.touch(TaskField::Completed);
        }
    }

    pub fn complete(&mut self) {
        if self.completed.is_none() {
            self.set_completed(Some(Utc::now()));
        }
    }

    pub fn set_due(&mut self, due: Option<DateTime<Utc>>) {
        if self.due != due {
            self.due = due;
            self.touch(TaskField::Due);
        }
    }

    /// Empty notes are stored as no notes.
    pub fn set_notes(&mut self, notes: Option<String>) {
        let notes = notes.filter(|n| !n.is_empty());
        if self.notes != notes {
            self.notes = notes;
            self.touch(TaskField::Notes);
        }
    }

    /// Replace the remote mirror. Bookkeeping only: no change is recorded.
    pub fn set_remote(&mut self, remote: Option<RemoteObject>) {
        self.remote = remote;
    }

    pub(crate) fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    fn touch(&mut self, field: TaskField) {
        self.updated = bumped(self.updated);
        if !self.changes.contains(&field) {
            self.changes.push(field);
        }
    }
}

impl Entity for Task {
    type Field = TaskField;
    const ID_PREFIX: &'static str = "task";

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn remote_id(&self) -> Option<&str> {
        self.remote.as_ref().and_then(RemoteObject::id)
    }

    fn take_changes(&mut self) -> Vec<TaskField> {
        std::mem::take(&mut self.changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn setters_record_changes_and_bump_updated() {
        let old = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let mut task = Task::restore(None, "Buy milk".into(), None, None, None, old);

        task.set_title("Buy oat milk");
        task.set_notes(Some("2 litres".into()));
        task.set_title("Buy oat milk again");

        assert!(task.updated() > old);
        assert_eq!(task.take_changes(), vec![TaskField::Title, TaskField::Notes]);
        assert!(task.take_changes().is_empty());
    }

    #[test]
    fn unchanged_writes_are_ignored() {
        let old = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let mut task = Task::restore(None, "Same".into(), None, None, None, old);

        task.set_title("Same");
        task.set_due(None);
        task.set_notes(Some(String::new()));

        assert_eq!(task.updated(), old);
        assert!(task.take_changes().is_empty());
    }

    #[test]
    fn updated_never_goes_backwards() {
        let future = Utc::now() + chrono::Duration::days(365);
        let mut task = Task::restore(None, "Later".into(), None, None, None, future);
        task.complete();
        assert_eq!(task.updated(), future);
        assert!(task.is_completed());
    }

    #[test]
    fn remote_mirror_brokers_identity() {
        let mut task = Task::new("Mirrored");
        assert_eq!(task.remote_id(), None);
        task.set_remote(Some(RemoteObject::new().with("id", "T1")));
        assert_eq!(task.remote_id(), Some("T1"));
        assert!(task.take_changes().is_empty());
    }
}
