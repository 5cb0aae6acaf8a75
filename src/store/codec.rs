//! JSON document format for a Source and everything it owns.
//!
//! The generic envelope only knows about lists and tasks. Anything a backend
//! needs to remember across restarts (remote mirrors, tombstones) goes in
//! through a [`DocumentExtension`], which may add its own keys next to the
//! generic ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::collection::{CollectionError, Entity};
use crate::core::source::{Source, Tombstones};
use crate::core::task::Task;
use crate::core::task_list::TaskList;

pub const SOURCE_KIND: &str = "wick#source";
pub const TASK_LIST_KIND: &str = "wick#taskList";
pub const TASK_KIND: &str = "wick#task";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a {expected} object, found {found:?}")]
    Kind {
        expected: &'static str,
        found: String,
    },
    #[error("{0}")]
    Duplicate(#[from] CollectionError),
    #[error("invalid {key} data: {message}")]
    Extension { key: String, message: String },
}

/// Backend hooks around the generic envelope. Every hook defaults to doing nothing.
pub trait DocumentExtension: Send + Sync {
    fn write_source(&self, _source: &Source, _doc: &mut Map<String, Value>) {}

    fn write_task_list(&self, _list: &TaskList, _doc: &mut Map<String, Value>) {}

    /// Runs after the generic fields of every list have been read.
    fn read_source(
        &self,
        _doc: &Map<String, Value>,
        _contents: &mut DocumentContents,
    ) -> Result<(), CodecError> {
        Ok(())
    }

    /// Runs after the list's own tasks have been restored.
    fn read_task_list(
        &self,
        _doc: &Map<String, Value>,
        _list: &mut TaskList,
    ) -> Result<(), CodecError> {
        Ok(())
    }
}

/// Extension for sources with no backend state of their own.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainDocument;

impl DocumentExtension for PlainDocument {}

/// A decoded document, not yet applied to any Source.
#[derive(Debug, Default)]
pub struct DocumentContents {
    pub id: String,
    pub lists: Vec<TaskList>,
    pub tombstones: Tombstones,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceDoc {
    kind: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    task_lists: Vec<Map<String, Value>>,
}

#[derive(Serialize, Deserialize)]
struct TaskListDoc {
    kind: String,
    #[serde(default)]
    id: String,
    #[serde(default = "Utc::now")]
    updated: DateTime<Utc>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    tasks: Vec<Map<String, Value>>,
}

#[derive(Serialize, Deserialize)]
struct TaskDoc {
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default = "Utc::now")]
    updated: DateTime<Utc>,
    #[serde(default)]
    title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    due: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    notes: Option<String>,
}

fn to_map<T: Serialize>(doc: &T) -> Result<Map<String, Value>, CodecError> {
    match serde_json::to_value(doc)? {
        Value::Object(map) => Ok(map),
        other => Err(CodecError::Kind {
            expected: "JSON",
            found: other.to_string(),
        }),
    }
}

fn check_kind(expected: &'static str, found: &str) -> Result<(), CodecError> {
    if found == expected {
        Ok(())
    } else {
        Err(CodecError::Kind {
            expected,
            found: found.to_string(),
        })
    }
}

fn encode_task(task: &Task) -> Result<Map<String, Value>, CodecError> {
    to_map(&TaskDoc {
        kind: TASK_KIND.to_string(),
        id: Some(task.id().to_string()),
        updated: task.updated(),
        title: task.title().to_string(),
        completed: task.completed(),
        due: task.due(),
        notes: task.notes().map(str::to_string),
    })
}

fn encode_task_list(
    list: &TaskList,
    extension: &dyn DocumentExtension,
) -> Result<Map<String, Value>, CodecError> {
    let tasks = list
        .tasks()
        .iter()
        .map(encode_task)
        .collect::<Result<Vec<_>, _>>()?;
    let mut doc = to_map(&TaskListDoc {
        kind: TASK_LIST_KIND.to_string(),
        id: list.id().to_string(),
        updated: list.updated(),
        title: list.title().to_string(),
        tasks,
    })?;
    extension.write_task_list(list, &mut doc);
    Ok(doc)
}

pub fn encode(source: &Source, extension: &dyn DocumentExtension) -> Result<Value, CodecError> {
    let task_lists = source
        .lists
        .iter()
        .map(|list| encode_task_list(list, extension))
        .collect::<Result<Vec<_>, _>>()?;
    let mut doc = to_map(&SourceDoc {
        kind: SOURCE_KIND.to_string(),
        id: source.id().to_string(),
        task_lists,
    })?;
    extension.write_source(source, &mut doc);
    Ok(Value::Object(doc))
}

pub fn encode_string(source: &Source, extension: &dyn DocumentExtension) -> Result<String, CodecError> {
    Ok(serde_json::to_string_pretty(&encode(source, extension)?)?)
}

fn decode_task(doc: Map<String, Value>) -> Result<Task, CodecError> {
    let doc: TaskDoc = serde_json::from_value(Value::Object(doc))?;
    check_kind(TASK_KIND, &doc.kind)?;
    Ok(Task::restore(
        doc.id.filter(|id| !id.is_empty()),
        doc.title,
        doc.completed,
        doc.due,
        doc.notes,
        doc.updated,
    ))
}

fn decode_task_list(
    raw: Map<String, Value>,
    extension: &dyn DocumentExtension,
) -> Result<TaskList, CodecError> {
    let doc: TaskListDoc = serde_json::from_value(Value::Object(raw.clone()))?;
    check_kind(TASK_LIST_KIND, &doc.kind)?;

    let mut list = TaskList::restore(doc.id, doc.title, doc.updated);
    for task in doc.tasks {
        list.restore_task(decode_task(task)?)?;
    }
    extension.read_task_list(&raw, &mut list)?;
    Ok(list)
}

/// Parse a document without touching any Source. Nothing is returned unless
/// the whole document, extension data included, is valid.
pub fn decode(text: &str, extension: &dyn DocumentExtension) -> Result<DocumentContents, CodecError> {
    let raw: Map<String, Value> = serde_json::from_str(text)?;
    let doc: SourceDoc = serde_json::from_value(Value::Object(raw.clone()))?;
    check_kind(SOURCE_KIND, &doc.kind)?;

    let mut contents = DocumentContents {
        id: doc.id,
        ..Default::default()
    };
    for list in doc.task_lists {
        let list = decode_task_list(list, extension)?;
        if !list.id().is_empty() && contents.lists.iter().any(|l| l.id() == list.id()) {
            return Err(CollectionError::DuplicateId(list.id().to_string()).into());
        }
        contents.lists.push(list);
    }
    extension.read_source(&raw, &mut contents)?;
    Ok(contents)
}

/// Decode `text` and, only if that succeeds, replace the Source's contents with it.
pub fn load_into(
    source: &mut Source,
    text: &str,
    extension: &dyn DocumentExtension,
) -> Result<(), CodecError> {
    let contents = decode(text, extension)?;
    if !contents.id.is_empty() && contents.id != source.id() {
        log::warn!(
            "Document for source {} loaded into source {}",
            contents.id,
            source.id()
        );
    }
    source.replace_contents(contents.lists, contents.tombstones)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task_list::NewTask;
    use serde_json::json;

    fn sample_document() -> Value {
        json!({
            "kind": "wick#source",
            "id": "acct-1",
            "taskLists": [
                {
                    "kind": "wick#taskList",
                    "id": "tasklist-a",
                    "updated": "2026-03-01T10:00:00Z",
                    "title": "Groceries",
                    "tasks": [
                        {
                            "kind": "wick#task",
                            "id": "task-1",
                            "updated": "2026-03-01T09:00:00Z",
                            "title": "Milk",
                            "completed": "2026-03-01T09:30:00Z"
                        },
                        {
                            "kind": "wick#task",
                            "id": "task-2",
                            "updated": "2026-03-01T09:05:00Z",
                            "title": "Bread",
                            "due": "2026-03-02T00:00:00Z",
                            "notes": "sourdough"
                        }
                    ]
                },
                {
                    "kind": "wick#taskList",
                    "id": "tasklist-b",
                    "updated": "2026-02-01T08:00:00Z",
                    "title": "Empty",
                    "tasks": []
                }
            ]
        })
    }

    #[test]
    fn round_trip_reproduces_the_document() {
        let doc = sample_document();
        let mut source = Source::new("acct-1", "Work", "google", false);
        load_into(&mut source, &doc.to_string(), &PlainDocument).unwrap();

        assert_eq!(source.lists.len(), 2);
        assert_eq!(encode(&source, &PlainDocument).unwrap(), doc);
    }

    #[test]
    fn optional_fields_are_omitted() {
        let mut source = Source::new("local", "Local", "computer", false);
        let list_id = source.create_task_list("Chores");
        source.create_task(&list_id, NewTask::titled("Dishes"));

        let doc = encode(&source, &PlainDocument).unwrap();
        let task = &doc["taskLists"][0]["tasks"][0];
        assert_eq!(task["kind"], "wick#task");
        assert_eq!(task["title"], "Dishes");
        assert!(task.get("completed").is_none());
        assert!(task.get("due").is_none());
        assert!(task.get("notes").is_none());
    }

    #[test]
    fn tasks_without_ids_get_fresh_ones() {
        let text = json!({
            "kind": "wick#source",
            "id": "local",
            "taskLists": [{
                "kind": "wick#taskList", "id": "tasklist-a",
                "updated": "2026-03-01T10:00:00Z", "title": "Old",
                "tasks": [{ "kind": "wick#task", "updated": "2026-03-01T10:00:00Z", "title": "No id" }]
            }]
        })
        .to_string();

        let contents = decode(&text, &PlainDocument).unwrap();
        let task = contents.lists[0].tasks().iter().next().unwrap();
        assert!(task.id().starts_with("task-"));
    }

    #[test]
    fn malformed_documents_apply_nothing() {
        let mut source = Source::new("acct-1", "Work", "google", false);
        source.create_task_list("Existing");

        for text in [
            "{ not json",
            r#"{"kind": "other#thing", "id": "acct-1"}"#,
            r#"{"kind": "wick#source", "taskLists": [{"kind": "wick#taskList", "id": "x", "title": "A"}, {"kind": "wick#taskList", "id": "x", "title": "B"}]}"#,
            r#"{"kind": "wick#source", "taskLists": [{"kind": "wick#taskList", "title": "A", "tasks": [{"kind": "wick#list"}]}]}"#,
        ] {
            assert!(load_into(&mut source, text, &PlainDocument).is_err(), "{text}");
            assert_eq!(source.lists.len(), 1);
        }
    }
}
