use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::core::remote::RemoteObject;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("not authenticated: {0}")]
    Auth(String),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::Status { status: 404 | 410, .. })
    }
}

/// One remote task list together with the tasks it contains.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTaskList {
    pub list: RemoteObject,
    pub tasks: Vec<RemoteObject>,
}

/// A remote task service. Every call is independent; implementations handle
/// their own authentication.
pub trait TaskService: Send + Sync {
    /// All task lists, delivered one at a time as they are fetched. The end
    /// of the stream means there are no more lists. An error item ends the
    /// listing.
    fn list_task_lists(&self) -> BoxStream<'_, Result<RemoteTaskList, RemoteError>>;

    fn create_task_list<'a>(
        &'a self,
        body: &'a RemoteObject,
    ) -> BoxFuture<'a, Result<RemoteObject, RemoteError>>;

    fn patch_task_list<'a>(
        &'a self,
        list_id: &'a str,
        patch: &'a RemoteObject,
    ) -> BoxFuture<'a, Result<RemoteObject, RemoteError>>;

    /// Deleting something that is already gone counts as success.
    fn delete_task_list<'a>(&'a self, list_id: &'a str) -> BoxFuture<'a, Result<(), RemoteError>>;

    fn create_task<'a>(
        &'a self,
        list_id: &'a str,
        body: &'a RemoteObject,
    ) -> BoxFuture<'a, Result<RemoteObject, RemoteError>>;

    fn patch_task<'a>(
        &'a self,
        list_id: &'a str,
        task_id: &'a str,
        patch: &'a RemoteObject,
    ) -> BoxFuture<'a, Result<RemoteObject, RemoteError>>;

    fn delete_task<'a>(
        &'a self,
        list_id: &'a str,
        task_id: &'a str,
    ) -> BoxFuture<'a, Result<(), RemoteError>>;
}
