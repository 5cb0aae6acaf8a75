use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;

use super::service::{RemoteError, RemoteTaskList, TaskService};
use crate::core::remote::RemoteObject;

pub const GTASKS_URL: &str = "https://www.googleapis.com/tasks/v1/";

/// One page of a Google Tasks collection listing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page {
    #[serde(default)]
    items: Vec<RemoteObject>,
    next_page_token: Option<String>,
}

/// Where a lazy list-of-lists walk currently is.
enum Listing {
    Start,
    Lists(std::vec::IntoIter<RemoteObject>),
    Done,
}

/// Google Tasks v1 REST client authenticated with an OAuth2 bearer token.
#[derive(Clone)]
pub struct GTasksClient {
    base_url: String,
    access_token: String,
    http: Client,
}

impl GTasksClient {
    pub fn new(access_token: &str) -> Result<Self, RemoteError> {
        Self::with_base_url(GTASKS_URL, access_token)
    }

    pub fn with_base_url(base_url: &str, access_token: &str) -> Result<Self, RemoteError> {
        if access_token.trim().is_empty() {
            return Err(RemoteError::Auth("no access token".to_string()));
        }
        let http = Client::builder().build()?;
        Ok(Self {
            base_url: format!("{}/", base_url.trim_end_matches('/')),
            access_token: access_token.to_string(),
            http,
        })
    }

    /// Every task list of the account, following pagination.
    pub async fn list_lists(&self) -> Result<Vec<RemoteObject>, RemoteError> {
        self.get_all("users/@me/lists", &[]).await
    }

    /// Every task of one list, including completed and hidden ones.
    pub async fn list_tasks(&self, list_id: &str) -> Result<Vec<RemoteObject>, RemoteError> {
        self.get_all(
            &format!("lists/{}/tasks", list_id),
            &[("showCompleted", "true"), ("showHidden", "true")],
        )
        .await
    }

    // --- Private helpers ---

    async fn get_all(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<RemoteObject>, RemoteError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut req = self.request(Method::GET, path).query(query);
            if let Some(token) = &page_token {
                req = req.query(&[("pageToken", token.as_str())]);
            }
            let page = parse_page(&send(req).await?)?;
            items.extend(page.items);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        log::debug!("GET {}: {} items", path, items.len());
        Ok(items)
    }

    async fn write(
        &self,
        method: Method,
        path: &str,
        body: &RemoteObject,
    ) -> Result<RemoteObject, RemoteError> {
        let req = self.request(method, path).json(body);
        parse_object(&send(req).await?)
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        match send(self.request(Method::DELETE, path)).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                log::debug!("DELETE {}: already gone", path);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, self.url(path))
            .bearer_auth(&self.access_token)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }
}

async fn send(req: RequestBuilder) -> Result<String, RemoteError> {
    let resp = req.send().await?;
    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        return Err(RemoteError::Status {
            status: status.as_u16(),
            body: text,
        });
    }
    Ok(text)
}

fn parse_page(text: &str) -> Result<Page, RemoteError> {
    Ok(serde_json::from_str(text)?)
}

fn parse_object(text: &str) -> Result<RemoteObject, RemoteError> {
    let object: RemoteObject = serde_json::from_str(text)?;
    if object.id().is_none() {
        return Err(RemoteError::Malformed("response object has no id".to_string()));
    }
    Ok(object)
}

impl TaskService for GTasksClient {
    fn list_task_lists(&self) -> BoxStream<'_, Result<RemoteTaskList, RemoteError>> {
        stream::unfold(Listing::Start, move |state| async move {
            let mut lists = match state {
                Listing::Start => match self.list_lists().await {
                    Ok(lists) => lists.into_iter(),
                    Err(e) => return Some((Err(e), Listing::Done)),
                },
                Listing::Lists(lists) => lists,
                Listing::Done => return None,
            };

            let list = lists.next()?;
            let Some(list_id) = list.id().map(str::to_string) else {
                let err = RemoteError::Malformed("task list without id".to_string());
                return Some((Err(err), Listing::Done));
            };
            match self.list_tasks(&list_id).await {
                Ok(tasks) => Some((Ok(RemoteTaskList { list, tasks }), Listing::Lists(lists))),
                Err(e) => Some((Err(e), Listing::Done)),
            }
        })
        .boxed()
    }

    fn create_task_list<'a>(
        &'a self,
        body: &'a RemoteObject,
    ) -> BoxFuture<'a, Result<RemoteObject, RemoteError>> {
        Box::pin(self.write(Method::POST, "users/@me/lists", body))
    }

    fn patch_task_list<'a>(
        &'a self,
        list_id: &'a str,
        patch: &'a RemoteObject,
    ) -> BoxFuture<'a, Result<RemoteObject, RemoteError>> {
        Box::pin(async move {
            self.write(Method::PATCH, &format!("users/@me/lists/{}", list_id), patch)
                .await
        })
    }

    fn delete_task_list<'a>(&'a self, list_id: &'a str) -> BoxFuture<'a, Result<(), RemoteError>> {
        Box::pin(async move { self.delete(&format!("users/@me/lists/{}", list_id)).await })
    }

    fn create_task<'a>(
        &'a self,
        list_id: &'a str,
        body: &'a RemoteObject,
    ) -> BoxFuture<'a, Result<RemoteObject, RemoteError>> {
        Box::pin(async move {
            self.write(Method::POST, &format!("lists/{}/tasks", list_id), body)
                .await
        })
    }

    fn patch_task<'a>(
        &'a self,
        list_id: &'a str,
        task_id: &'a str,
        patch: &'a RemoteObject,
    ) -> BoxFuture<'a, Result<RemoteObject, RemoteError>> {
        Box::pin(async move {
            self.write(
                Method::PATCH,
                &format!("lists/{}/tasks/{}", list_id, task_id),
                patch,
            )
            .await
        })
    }

    fn delete_task<'a>(
        &'a self,
        list_id: &'a str,
        task_id: &'a str,
    ) -> BoxFuture<'a, Result<(), RemoteError>> {
        Box::pin(async move {
            self.delete(&format!("lists/{}/tasks/{}", list_id, task_id))
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_with_continuation() {
        let page = parse_page(
            r#"{"kind": "tasks#taskLists", "nextPageToken": "p2",
                "items": [{"id": "L1", "title": "Groceries"}, {"id": "L2", "title": "Work"}]}"#,
        )
        .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[1].str("title"), Some("Work"));
        assert_eq!(page.next_page_token.as_deref(), Some("p2"));
    }

    #[test]
    fn empty_list_has_no_items_key() {
        let page = parse_page(r#"{"kind": "tasks#tasks"}"#).unwrap();
        assert!(page.items.is_empty());
        assert!(page.next_page_token.is_none());
    }

    #[test]
    fn objects_need_an_id() {
        assert!(parse_object(r#"{"id": "T1", "title": "x"}"#).is_ok());
        assert!(matches!(
            parse_object(r#"{"title": "x"}"#),
            Err(RemoteError::Malformed(_))
        ));
        assert!(matches!(parse_object("<html>"), Err(RemoteError::Decode(_))));
    }

    #[test]
    fn urls_join_cleanly() {
        let client = GTasksClient::with_base_url("http://localhost:8080/tasks/v1", "token").unwrap();
        assert_eq!(
            client.url("/users/@me/lists"),
            "http://localhost:8080/tasks/v1/users/@me/lists"
        );
        assert_eq!(
            GTasksClient::new("token").unwrap().url("lists/L1/tasks"),
            "https://www.googleapis.com/tasks/v1/lists/L1/tasks"
        );
    }

    #[test]
    fn missing_token_is_an_auth_error() {
        assert!(matches!(
            GTasksClient::new("  "),
            Err(RemoteError::Auth(_))
        ));
    }

    #[test]
    fn gone_counts_as_not_found() {
        let gone = RemoteError::Status {
            status: 410,
            body: String::new(),
        };
        assert!(gone.is_not_found());
        let denied = RemoteError::Status {
            status: 403,
            body: String::new(),
        };
        assert!(!denied.is_not_found());
    }
}
