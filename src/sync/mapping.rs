//! Translation between local tasks/lists and Google Tasks JSON objects.
//!
//! Google stores `due` as a date (the time part is always midnight UTC) and
//! returns timestamps with millisecond precision, so comparisons here are
//! deliberately coarse: `due` by calendar date, everything else by second.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::core::remote::RemoteObject;
use crate::core::task::Task;
use crate::core::task_list::TaskList;

pub const STATUS_NEEDS_ACTION: &str = "needsAction";
pub const STATUS_COMPLETED: &str = "completed";

/// The synchronized fields of a task, detached from any local bookkeeping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFields {
    pub title: String,
    pub completed: Option<DateTime<Utc>>,
    pub due: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl TaskFields {
    pub fn from_task(task: &Task) -> Self {
        Self {
            title: task.title().to_string(),
            completed: task.completed(),
            due: task.due(),
            notes: task.notes().map(str::to_string),
        }
    }

    pub fn from_remote(remote: &RemoteObject) -> Self {
        let completed = if remote.str("status") == Some(STATUS_COMPLETED) {
            Some(
                remote
                    .timestamp("completed")
                    .or_else(|| remote.timestamp("updated"))
                    .unwrap_or(DateTime::UNIX_EPOCH),
            )
        } else {
            None
        };
        Self {
            title: remote.str("title").unwrap_or_default().to_string(),
            completed,
            due: remote.timestamp("due"),
            notes: remote
                .str("notes")
                .filter(|n| !n.is_empty())
                .map(str::to_string),
        }
    }

    /// Field-by-field equality at the precision the server keeps.
    pub fn same_as(&self, other: &TaskFields) -> bool {
        self.title == other.title
            && self.notes == other.notes
            && same_day(self.due, other.due)
            && same_instant(self.completed, other.completed)
    }
}

pub fn same_instant(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    a.map(|t| t.timestamp()) == b.map(|t| t.timestamp())
}

pub fn same_day(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    a.map(|t| t.date_naive()) == b.map(|t| t.date_naive())
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn format_due(due: DateTime<Utc>) -> String {
    format!("{}T00:00:00.000Z", due.date_naive())
}

fn optional(value: Option<String>) -> Value {
    value.map(Value::String).unwrap_or(Value::Null)
}

fn insert_status(object: &mut RemoteObject, completed: Option<DateTime<Utc>>) {
    match completed {
        Some(ts) => {
            object.insert("status", STATUS_COMPLETED);
            object.insert("completed", format_timestamp(ts));
        }
        None => {
            object.insert("status", STATUS_NEEDS_ACTION);
            object.insert("completed", Value::Null);
        }
    }
}

/// Creation body for a task. Unset fields are left out.
pub fn task_to_remote(task: &Task) -> RemoteObject {
    let fields = TaskFields::from_task(task);
    let mut body = RemoteObject::new().with("title", fields.title);
    if let Some(notes) = fields.notes {
        body.insert("notes", notes);
    }
    if let Some(due) = fields.due {
        body.insert("due", format_due(due));
    }
    match fields.completed {
        Some(ts) => {
            body.insert("status", STATUS_COMPLETED);
            body.insert("completed", format_timestamp(ts));
        }
        None => body.insert("status", STATUS_NEEDS_ACTION),
    }
    body
}

/// Build a local task from a remote object. The object becomes its mirror.
pub fn task_from_remote(remote: &RemoteObject) -> Task {
    let fields = TaskFields::from_remote(remote);
    let mut task = Task::new(fields.title);
    task.set_completed(fields.completed);
    task.set_due(fields.due);
    task.set_notes(fields.notes);
    task.set_remote(Some(remote.clone()));
    task
}

/// Only the fields where `task` differs from `mirror`, or `None` when they agree.
/// Cleared values are sent as `null`.
pub fn task_patch(task: &Task, mirror: &RemoteObject) -> Option<RemoteObject> {
    let local = TaskFields::from_task(task);
    let remote = TaskFields::from_remote(mirror);
    let mut patch = RemoteObject::new();

    if local.title != remote.title {
        patch.insert("title", local.title);
    }
    if local.notes != remote.notes {
        patch.insert("notes", optional(local.notes));
    }
    if !same_day(local.due, remote.due) {
        patch.insert("due", optional(local.due.map(format_due)));
    }
    if !same_instant(local.completed, remote.completed) {
        insert_status(&mut patch, local.completed);
    }

    (!patch.is_empty()).then_some(patch)
}

pub fn list_to_remote(list: &TaskList) -> RemoteObject {
    RemoteObject::new().with("title", list.title())
}

pub fn list_patch(list: &TaskList, mirror: &RemoteObject) -> Option<RemoteObject> {
    if mirror.str("title") == Some(list.title()) {
        None
    } else {
        Some(list_to_remote(list))
    }
}
