use chrono::{DateTime, Utc};

use super::mapping::{TaskFields, same_day, same_instant};
use crate::core::remote::RemoteObject;
use crate::core::task::Task;

/// Merge a locally-changed task with a remotely-changed version.
///
/// `base` is the mirror saved at the last sync. When both sides changed the
/// same field, the remote version wins (server-authoritative tiebreak).
pub fn merge_tasks(local: &TaskFields, remote: &TaskFields, base: &TaskFields) -> TaskFields {
    TaskFields {
        title: merge_field(&local.title, &remote.title, &base.title, |a, b| a == b),
        completed: merge_field(&local.completed, &remote.completed, &base.completed, |a, b| {
            same_instant(*a, *b)
        }),
        due: merge_field(&local.due, &remote.due, &base.due, |a, b| same_day(*a, *b)),
        notes: merge_field(&local.notes, &remote.notes, &base.notes, |a, b| a == b),
    }
}

fn merge_field<T: Clone>(local: &T, remote: &T, base: &T, same: impl Fn(&T, &T) -> bool) -> T {
    if !same(remote, base) {
        remote.clone()
    } else {
        local.clone()
    }
}

/// Fold a freshly pulled object into a local task. The object becomes the new
/// mirror. A task without a mirror takes the remote values wholesale.
pub fn apply_remote_task(task: &mut Task, remote: &RemoteObject) {
    let local = TaskFields::from_task(task);
    let incoming = TaskFields::from_remote(remote);
    let merged = match task.remote() {
        Some(mirror) => merge_tasks(&local, &incoming, &TaskFields::from_remote(mirror)),
        None => incoming,
    };

    task.set_title(merged.title);
    if !same_instant(task.completed(), merged.completed) {
        task.set_completed(merged.completed);
    }
    if !same_day(task.due(), merged.due) {
        task.set_due(keep_time_of_day(task.due(), merged.due));
    }
    task.set_notes(merged.notes);
    task.set_remote(Some(remote.clone()));
}

// Google only keeps the date, so a local due time survives a date change.
fn keep_time_of_day(
    local: Option<DateTime<Utc>>,
    merged: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (local, merged) {
        (Some(local), Some(merged)) => merged
            .date_naive()
            .and_time(local.time())
            .and_local_timezone(Utc)
            .single()
            .or(Some(merged)),
        (_, merged) => merged,
    }
}
