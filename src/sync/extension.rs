use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::collection::Entity;
use crate::core::remote::RemoteObject;
use crate::core::source::{Source, Tombstones};
use crate::core::task_list::TaskList;
use crate::store::codec::{CodecError, DocumentContents, DocumentExtension};

pub const EXTENSION_KEY: &str = "gtasks";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceState {
    #[serde(default)]
    deleted_task_lists: Vec<String>,
    /// Parent list remote id to task remote ids.
    #[serde(default)]
    deleted_tasks: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskListState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remote: Option<RemoteObject>,
    /// Local task id to the task's mirror.
    #[serde(default)]
    tasks: BTreeMap<String, RemoteObject>,
}

/// Persists what the Google Tasks sync needs across restarts: the remote
/// mirrors of lists and tasks, and tombstones for unconfirmed deletions.
#[derive(Debug, Default, Clone, Copy)]
pub struct MirrorExtension;

fn insert_state<T: Serialize>(doc: &mut Map<String, Value>, state: &T) {
    match serde_json::to_value(state) {
        Ok(value) => {
            doc.insert(EXTENSION_KEY.to_string(), value);
        }
        Err(e) => log::error!("Could not encode {} data: {}", EXTENSION_KEY, e),
    }
}

fn read_state<T: Default + for<'de> Deserialize<'de>>(
    doc: &Map<String, Value>,
) -> Result<T, CodecError> {
    match doc.get(EXTENSION_KEY) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| CodecError::Extension {
            key: EXTENSION_KEY.to_string(),
            message: e.to_string(),
        }),
    }
}

impl DocumentExtension for MirrorExtension {
    fn write_source(&self, source: &Source, doc: &mut Map<String, Value>) {
        let mut state = SourceState {
            deleted_task_lists: source.tombstones.lists().map(str::to_string).collect(),
            ..Default::default()
        };
        for (list, task) in source.tombstones.tasks() {
            state
                .deleted_tasks
                .entry(list.to_string())
                .or_default()
                .push(task.to_string());
        }
        insert_state(doc, &state);
    }

    fn write_task_list(&self, list: &TaskList, doc: &mut Map<String, Value>) {
        let state = TaskListState {
            remote: list.remote().cloned(),
            tasks: list
                .tasks()
                .iter()
                .filter_map(|task| Some((task.id().to_string(), task.remote()?.clone())))
                .collect(),
        };
        insert_state(doc, &state);
    }

    fn read_source(
        &self,
        doc: &Map<String, Value>,
        contents: &mut DocumentContents,
    ) -> Result<(), CodecError> {
        let state: SourceState = read_state(doc)?;
        let mut tombstones = Tombstones::default();
        for list in state.deleted_task_lists {
            tombstones.add_list(list);
        }
        for (list, tasks) in state.deleted_tasks {
            for task in tasks {
                tombstones.add_task(list.clone(), task);
            }
        }
        contents.tombstones = tombstones;
        Ok(())
    }

    fn read_task_list(
        &self,
        doc: &Map<String, Value>,
        list: &mut TaskList,
    ) -> Result<(), CodecError> {
        let state: TaskListState = read_state(doc)?;
        list.set_remote(state.remote);
        for (task_id, mirror) in state.tasks {
            if list.update_task(&task_id, |task| task.set_remote(Some(mirror))).is_none() {
                log::warn!("Dropping mirror for unknown task {} in list {}", task_id, list.id());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task_list::NewTask;
    use crate::store::codec::{self, PlainDocument};
    use serde_json::json;

    fn mirrored_source() -> (Source, String, String) {
        let mut source = Source::new("acct-1", "Work", "google", true);
        let list_id = source.create_task_list("Groceries");
        let task_id = source.create_task(&list_id, NewTask::titled("Milk")).unwrap();
        source.lists.update(&list_id, |list| {
            list.set_remote(Some(RemoteObject::new().with("id", "L1").with("title", "Groceries")));
            list.update_task(&task_id, |task| {
                task.set_remote(Some(RemoteObject::new().with("id", "T1").with("etag", "\"e1\"")))
            });
        });
        source.tombstones.add_list("L9");
        source.tombstones.add_task("L1", "T7");
        (source, list_id, task_id)
    }

    #[test]
    fn mirrors_and_tombstones_survive_a_round_trip() {
        let (source, list_id, task_id) = mirrored_source();
        let text = codec::encode_string(&source, &MirrorExtension).unwrap();

        let mut reloaded = Source::new("acct-1", "Work", "google", true);
        codec::load_into(&mut reloaded, &text, &MirrorExtension).unwrap();

        let list = reloaded.list(&list_id).unwrap();
        assert_eq!(list.remote_id(), Some("L1"));
        let task = list.task(&task_id).unwrap();
        assert_eq!(task.remote().and_then(|r| r.str("etag")), Some("\"e1\""));
        assert!(reloaded.tombstones.contains_list("L9"));
        assert!(reloaded.tombstones.contains_task("L1", "T7"));
    }

    #[test]
    fn extension_data_sits_beside_the_generic_fields() {
        let (source, _, task_id) = mirrored_source();
        let doc = codec::encode(&source, &MirrorExtension).unwrap();

        assert_eq!(
            doc["gtasks"],
            json!({"deletedTaskLists": ["L9"], "deletedTasks": {"L1": ["T7"]}})
        );
        assert_eq!(doc["taskLists"][0]["gtasks"]["remote"]["id"], "L1");
        assert_eq!(doc["taskLists"][0]["gtasks"]["tasks"][&task_id]["id"], "T1");
        assert_eq!(doc["taskLists"][0]["title"], "Groceries");
    }

    #[test]
    fn plain_reader_ignores_extension_keys() {
        let (source, list_id, task_id) = mirrored_source();
        let text = codec::encode_string(&source, &MirrorExtension).unwrap();

        let contents = codec::decode(&text, &PlainDocument).unwrap();
        let list = contents.lists.iter().find(|l| l.id() == list_id).unwrap();
        assert!(list.remote().is_none());
        assert!(list.task(&task_id).unwrap().remote().is_none());
        assert!(contents.tombstones.is_empty());
    }

    #[test]
    fn bad_extension_data_rejects_the_document() {
        let text = json!({
            "kind": "wick#source",
            "id": "acct-1",
            "gtasks": {"deletedTaskLists": "L1"},
            "taskLists": []
        })
        .to_string();

        let mut source = Source::new("acct-1", "Work", "google", true);
        source.create_task_list("Existing");
        let err = codec::load_into(&mut source, &text, &MirrorExtension).unwrap_err();
        assert!(matches!(err, CodecError::Extension { .. }));
        assert_eq!(source.lists.len(), 1);
    }
}
