pub mod extension;
pub mod gtasks;
pub mod keyring;
pub mod mapping;
pub mod merge;
pub mod service;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use futures::StreamExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::core::collection::{CollectionEvent, Entity};
use crate::core::observable::SubscriptionId;
use crate::core::remote::RemoteObject;
use crate::core::source::{Source, SourceEvent, Tombstones};
use crate::core::task::TaskField;
use crate::core::task_list::{TaskList, TaskListField};
use service::{RemoteError, RemoteTaskList, TaskService};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("the source worker has stopped")]
    WorkerGone,
}

/// Result of a sync operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Remote lists delivered by the pull.
    pub lists_pulled: usize,
    /// Local lists created from remote ones.
    pub lists_created: usize,
    /// Local lists dropped because the server no longer has them.
    pub lists_removed: usize,
    pub tasks_pulled: usize,
    pub tasks_created: usize,
    pub tasks_removed: usize,
    /// Remote creates and patches confirmed.
    pub pushed: usize,
    /// Tombstoned deletions the server confirmed.
    pub deletions_confirmed: usize,
    /// Non-fatal errors encountered during sync.
    pub errors: Vec<String>,
}

/// A local change heard from the Source, in mutation order.
#[derive(Debug, Clone)]
enum PushEvent {
    List(CollectionEvent<TaskListField>),
    Task {
        list_id: String,
        event: CollectionEvent<TaskField>,
    },
}

/// One unit of remote work. Named by local ids and resolved against the
/// Source only when it is about to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Job {
    CreateList { list_id: String },
    PatchList { list_id: String },
    DeleteList { remote_id: String },
    CreateTask { list_id: String, task_id: String },
    PatchTask { list_id: String, task_id: String },
    DeleteTask { list_remote_id: String, remote_id: String },
    /// Fetch everything for the sync run at the front of `runs`.
    Pull,
    /// Expands into creates and patches for whatever differs from its mirror.
    PushUnsynced,
    /// Ends the sync run at the front of `runs`.
    Finish,
}

/// A job resolved into owned request data.
enum Outgoing {
    CreateList(RemoteObject),
    PatchList(String, RemoteObject),
    DeleteList(String),
    CreateTask(String, RemoteObject),
    PatchTask(String, String, RemoteObject),
    DeleteTask(String, String),
    Pull,
}

enum Response {
    Written(Result<RemoteObject, RemoteError>),
    Deleted(Result<(), RemoteError>),
    Listed(Result<Vec<RemoteTaskList>, RemoteError>),
}

/// The answer to one request, to be applied with [`SyncEngine::complete`].
pub struct Completion {
    job: Job,
    response: Response,
}

/// A request in flight. It borrows nothing from the Source.
pub type Request = BoxFuture<'static, Completion>;

pub enum Step {
    /// Drive this to completion, then hand its output to [`SyncEngine::complete`].
    Send(Request),
    /// The oldest sync run is over.
    Finished(Result<SyncSummary, SyncError>),
    /// Nothing left to send.
    Idle,
}

#[derive(Default)]
struct SyncRun {
    summary: SyncSummary,
    failure: Option<RemoteError>,
}

/// Keeps one Source consistent with a remote task service.
///
/// While attached, every local change is queued by
/// [`queue_changes`](Self::queue_changes) as a job. Jobs are sent one at a
/// time: [`start_next`](Self::start_next) resolves the next job into a
/// self-contained [`Request`], and [`complete`](Self::complete) applies the
/// answer. The Source is only touched in those synchronous steps, so its
/// owner stays free to serve other work while a request is in flight.
///
/// Pulled data is applied with the listeners detached, so merged remote data
/// is never echoed back to the server.
pub struct SyncEngine {
    service: Arc<dyn TaskService>,
    sender: UnboundedSender<PushEvent>,
    receiver: UnboundedReceiver<PushEvent>,
    list_subscription: Option<SubscriptionId>,
    task_subscriptions: HashMap<String, SubscriptionId>,
    queue: VecDeque<Job>,
    runs: VecDeque<SyncRun>,
    unsaved_tombstones: bool,
}

impl SyncEngine {
    pub fn new(service: Arc<dyn TaskService>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            service,
            sender,
            receiver,
            list_subscription: None,
            task_subscriptions: HashMap::new(),
            queue: VecDeque::new(),
            runs: VecDeque::new(),
            unsaved_tombstones: false,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.list_subscription.is_some()
    }

    /// Start queueing local changes. Lists added since the last call get
    /// their task listener here too.
    pub fn attach(&mut self, source: &mut Source) {
        if self.list_subscription.is_none() {
            let sender = self.sender.clone();
            self.list_subscription = Some(source.subscribe_lists(move |event| {
                let _ = sender.send(PushEvent::List(event.clone()));
            }));
        }

        for list_id in source.lists.ids() {
            if self.task_subscriptions.contains_key(&list_id) {
                continue;
            }
            let sender = self.sender.clone();
            let owner = list_id.clone();
            let subscription = source.lists.update(&list_id, |list| {
                list.subscribe_tasks(move |event| {
                    let _ = sender.send(PushEvent::Task {
                        list_id: owner.clone(),
                        event: event.clone(),
                    });
                })
            });
            if let Some(subscription) = subscription {
                self.task_subscriptions.insert(list_id, subscription);
            }
        }
    }

    /// Stop queueing local changes.
    pub fn detach(&mut self, source: &mut Source) {
        if let Some(subscription) = self.list_subscription.take() {
            source.lists.unsubscribe(subscription);
        }
        for (list_id, subscription) in self.task_subscriptions.drain() {
            source
                .lists
                .update(&list_id, |list| list.unsubscribe_tasks(subscription));
        }
    }

    /// True while jobs are waiting to be sent.
    pub fn has_work(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Turn heard local changes into jobs. Deleting a mirrored object writes
    /// its tombstone right here, before any request for it exists; check
    /// [`take_unsaved_tombstones`](Self::take_unsaved_tombstones) afterwards.
    pub fn queue_changes(&mut self, source: &mut Source) {
        while let Ok(event) = self.receiver.try_recv() {
            match event {
                PushEvent::List(CollectionEvent::Added { id }) => {
                    self.enqueue(Job::CreateList { list_id: id })
                }
                PushEvent::List(CollectionEvent::Changed {
                    id,
                    field: TaskListField::Title,
                }) => self.enqueue(Job::PatchList { list_id: id }),
                PushEvent::List(CollectionEvent::Removed { id, remote_id }) => {
                    self.task_subscriptions.remove(&id);
                    if let Some(remote_id) = remote_id {
                        source.tombstones.add_list(remote_id.clone());
                        self.unsaved_tombstones = true;
                        self.enqueue(Job::DeleteList { remote_id });
                    }
                }
                PushEvent::List(CollectionEvent::Cleared) => self.task_subscriptions.clear(),
                PushEvent::List(_) => {}
                PushEvent::Task { list_id, event } => self.queue_task_change(source, list_id, event),
            }
        }
        if self.is_attached() {
            self.attach(source);
        }
    }

    fn queue_task_change(
        &mut self,
        source: &mut Source,
        list_id: String,
        event: CollectionEvent<TaskField>,
    ) {
        let Some(list_remote_id) = source
            .list(&list_id)
            .and_then(|list| list.remote_id())
            .map(str::to_string)
        else {
            // Unmirrored lists push their tasks once the list is created.
            return;
        };
        match event {
            CollectionEvent::Added { id } => self.enqueue(Job::CreateTask {
                list_id,
                task_id: id,
            }),
            CollectionEvent::Changed { id, .. } => self.enqueue(Job::PatchTask {
                list_id,
                task_id: id,
            }),
            CollectionEvent::Removed {
                remote_id: Some(remote_id),
                ..
            } => {
                source
                    .tombstones
                    .add_task(list_remote_id.clone(), remote_id.clone());
                self.unsaved_tombstones = true;
                self.enqueue(Job::DeleteTask {
                    list_remote_id,
                    remote_id,
                });
            }
            _ => {}
        }
    }

    fn enqueue(&mut self, job: Job) {
        if !self.queue.contains(&job) {
            self.queue.push_back(job);
        }
    }

    /// True once after tombstones were written. The Source has to be
    /// persisted before the next request goes out.
    pub fn take_unsaved_tombstones(&mut self) -> bool {
        std::mem::take(&mut self.unsaved_tombstones)
    }

    /// Queue a full round trip behind the pending jobs: unconfirmed
    /// deletions, a pull, then creates and patches for whatever the server
    /// lacks. Its result comes out of [`start_next`](Self::start_next) as
    /// [`Step::Finished`], in the order runs were begun.
    pub fn begin_sync(&mut self, source: &Source) {
        self.runs.push_back(SyncRun::default());
        let lists: Vec<String> = source.tombstones.lists().map(str::to_string).collect();
        for remote_id in lists {
            self.enqueue(Job::DeleteList { remote_id });
        }
        let tasks: Vec<(String, String)> = source
            .tombstones
            .tasks()
            .map(|(list, task)| (list.to_string(), task.to_string()))
            .collect();
        for (list_remote_id, remote_id) in tasks {
            self.enqueue(Job::DeleteTask {
                list_remote_id,
                remote_id,
            });
        }
        self.queue.push_back(Job::Pull);
        self.queue.push_back(Job::PushUnsynced);
        self.queue.push_back(Job::Finish);
    }

    /// Resolve the next job against the current state of `source`. Jobs with
    /// nothing left to send are dropped on the way.
    pub fn start_next(&mut self, source: &Source) -> Step {
        while let Some(job) = self.queue.pop_front() {
            if job == Job::Finish {
                return Step::Finished(self.finish_run(source));
            }
            if let Some(outgoing) = self.prepare(source, &job) {
                return Step::Send(send(Arc::clone(&self.service), job, outgoing));
            }
        }
        Step::Idle
    }

    fn prepare(&mut self, source: &Source, job: &Job) -> Option<Outgoing> {
        match job {
            Job::CreateList { list_id } => source
                .list(list_id)
                .filter(|list| list.remote().is_none())
                .map(|list| Outgoing::CreateList(mapping::list_to_remote(list))),
            Job::PatchList { list_id } => {
                let list = source.list(list_id)?;
                let mirror = list.remote()?;
                Some(Outgoing::PatchList(
                    mirror.id()?.to_string(),
                    mapping::list_patch(list, mirror)?,
                ))
            }
            Job::DeleteList { remote_id } => source
                .tombstones
                .contains_list(remote_id)
                .then(|| Outgoing::DeleteList(remote_id.clone())),
            Job::CreateTask { list_id, task_id } => {
                let list = source.list(list_id)?;
                let task = list.task(task_id).filter(|task| task.remote().is_none())?;
                Some(Outgoing::CreateTask(
                    list.remote_id()?.to_string(),
                    mapping::task_to_remote(task),
                ))
            }
            Job::PatchTask { list_id, task_id } => {
                let list = source.list(list_id)?;
                let task = list.task(task_id)?;
                let mirror = task.remote()?;
                Some(Outgoing::PatchTask(
                    list.remote_id()?.to_string(),
                    mirror.id()?.to_string(),
                    mapping::task_patch(task, mirror)?,
                ))
            }
            Job::DeleteTask {
                list_remote_id,
                remote_id,
            } => source
                .tombstones
                .contains_task(list_remote_id, remote_id)
                .then(|| Outgoing::DeleteTask(list_remote_id.clone(), remote_id.clone())),
            Job::Pull => Some(Outgoing::Pull),
            Job::PushUnsynced => {
                if self.runs.front().is_none_or(|run| run.failure.is_none()) {
                    self.queue_unsynced(source);
                }
                None
            }
            Job::Finish => None,
        }
    }

    /// The new jobs go to the front so they finish before the run does.
    fn queue_unsynced(&mut self, source: &Source) {
        let mut jobs = Vec::new();
        for list in source.lists.iter() {
            let list_id = list.id().to_string();
            if list.remote().is_none() {
                jobs.push(Job::CreateList { list_id });
                continue;
            }
            jobs.push(Job::PatchList {
                list_id: list_id.clone(),
            });
            for task in list.tasks().iter() {
                let task_id = task.id().to_string();
                let list_id = list_id.clone();
                jobs.push(match task.remote() {
                    None => Job::CreateTask { list_id, task_id },
                    Some(_) => Job::PatchTask { list_id, task_id },
                });
            }
        }
        for job in jobs.into_iter().rev() {
            self.queue.push_front(job);
        }
    }

    fn finish_run(&mut self, source: &Source) -> Result<SyncSummary, SyncError> {
        let run = self.runs.pop_front().unwrap_or_default();
        if let Some(e) = run.failure {
            log::warn!("Sync of {} failed: {}", source.name(), e);
            return Err(e.into());
        }
        log::info!(
            "Synced {}: {} lists pulled, {} pushed, {} errors",
            source.name(),
            run.summary.lists_pulled,
            run.summary.pushed,
            run.summary.errors.len()
        );
        Ok(run.summary)
    }

    /// Apply the answer to a request. Returns the number of remote writes it
    /// confirmed.
    pub fn complete(&mut self, source: &mut Source, completion: Completion) -> usize {
        let Completion { job, response } = completion;
        match (job, response) {
            (Job::Pull, Response::Listed(Ok(lists))) => {
                self.detach(source);
                let mut scratch = SyncSummary::default();
                let summary = match self.runs.front_mut() {
                    Some(run) => &mut run.summary,
                    None => &mut scratch,
                };
                apply_pull(source, lists, summary);
                self.attach(source);
                0
            }
            (Job::Pull, Response::Listed(Err(e))) => {
                match self.runs.front_mut() {
                    Some(run) => run.failure = Some(e),
                    None => log::warn!("Pull for {} failed: {}", source.name(), e),
                }
                0
            }

            (Job::CreateList { list_id }, Response::Written(result)) => {
                match result.and_then(|created| Ok((created_id(&created)?, created))) {
                    Ok((remote_id, created)) => {
                        log::info!("Created remote list {} for {}", remote_id, list_id);
                        let found = source
                            .lists
                            .update(&list_id, |list| list.set_remote(Some(created)))
                            .is_some();
                        if found {
                            self.queue_list_tasks(source, &list_id);
                        } else {
                            // Deleted locally while the create was in flight.
                            source.tombstones.add_list(remote_id.clone());
                            self.unsaved_tombstones = true;
                            self.enqueue(Job::DeleteList { remote_id });
                        }
                        self.wrote()
                    }
                    Err(e) => self.fail(source, format!("Failed to create list {}: {}", list_id, e)),
                }
            }
            (Job::CreateTask { list_id, task_id }, Response::Written(result)) => {
                match result.and_then(|created| Ok((created_id(&created)?, created))) {
                    Ok((remote_id, created)) => {
                        let found = source
                            .update_task(&list_id, &task_id, |task| task.set_remote(Some(created)))
                            .is_some();
                        let list_remote_id = source
                            .list(&list_id)
                            .and_then(|list| list.remote_id())
                            .map(str::to_string);
                        if let (false, Some(list_remote_id)) = (found, list_remote_id) {
                            source
                                .tombstones
                                .add_task(list_remote_id.clone(), remote_id.clone());
                            self.unsaved_tombstones = true;
                            self.enqueue(Job::DeleteTask {
                                list_remote_id,
                                remote_id,
                            });
                        }
                        self.wrote()
                    }
                    Err(e) => self.fail(source, format!("Failed to create task {}: {}", task_id, e)),
                }
            }
            (Job::PatchList { list_id }, Response::Written(result)) => match result {
                Ok(updated) => {
                    source
                        .lists
                        .update(&list_id, |list| list.set_remote(Some(updated)));
                    self.wrote()
                }
                Err(e) => self.fail(source, format!("Failed to rename list {}: {}", list_id, e)),
            },
            (Job::PatchTask { list_id, task_id }, Response::Written(result)) => match result {
                Ok(updated) => {
                    source.update_task(&list_id, &task_id, |task| task.set_remote(Some(updated)));
                    self.wrote()
                }
                Err(e) => self.fail(source, format!("Failed to update task {}: {}", task_id, e)),
            },

            (Job::DeleteList { remote_id }, Response::Deleted(result)) => match result {
                Ok(()) => {
                    if source.tombstones.clear_list(&remote_id) {
                        log::info!("Deleted remote list {}", remote_id);
                        self.confirmed();
                    }
                    0
                }
                Err(e) => self.fail(source, format!("Failed to delete list {}: {}", remote_id, e)),
            },
            (
                Job::DeleteTask {
                    list_remote_id,
                    remote_id,
                },
                Response::Deleted(result),
            ) => match result {
                Ok(()) => {
                    if source.tombstones.clear_task(&list_remote_id, &remote_id) {
                        log::debug!("Deleted remote task {} in {}", remote_id, list_remote_id);
                        self.confirmed();
                    }
                    0
                }
                Err(e) => self.fail(source, format!("Failed to delete task {}: {}", remote_id, e)),
            },

            (job, _) => {
                log::warn!("Unexpected answer for {:?}", job);
                0
            }
        }
    }

    /// Create the list's unmirrored tasks before anything queued later.
    fn queue_list_tasks(&mut self, source: &Source, list_id: &str) {
        let Some(list) = source.list(list_id) else {
            return;
        };
        let pending: Vec<Job> = list
            .tasks()
            .iter()
            .filter(|task| task.remote().is_none())
            .map(|task| Job::CreateTask {
                list_id: list_id.to_string(),
                task_id: task.id().to_string(),
            })
            .collect();
        for job in pending.into_iter().rev() {
            self.queue.push_front(job);
        }
    }

    fn wrote(&mut self) -> usize {
        if let Some(run) = self.runs.front_mut() {
            run.summary.pushed += 1;
        }
        1
    }

    fn confirmed(&mut self) {
        if let Some(run) = self.runs.front_mut() {
            run.summary.deletions_confirmed += 1;
        }
    }

    /// Failed requests are left for the next sync.
    fn fail(&mut self, source: &mut Source, message: String) -> usize {
        if let Some(run) = self.runs.front_mut() {
            run.summary.errors.push(message.clone());
        }
        source.report(SourceEvent::SyncError(message));
        0
    }

    /// Send every queued change and wait for the answers. Tombstones are not
    /// persisted in between; a worker drives the steps itself for that.
    pub async fn push_pending(&mut self, source: &mut Source) -> usize {
        self.queue_changes(source);
        self.drive(source).await.0
    }

    /// One full round trip, waiting until it is over.
    pub async fn sync(&mut self, source: &mut Source) -> Result<SyncSummary, SyncError> {
        self.queue_changes(source);
        self.begin_sync(source);
        let (_, finished) = self.drive(source).await;
        finished
            .into_iter()
            .last()
            .unwrap_or_else(|| Ok(SyncSummary::default()))
    }

    async fn drive(&mut self, source: &mut Source) -> (usize, Vec<Result<SyncSummary, SyncError>>) {
        let mut pushed = 0;
        let mut finished = Vec::new();
        loop {
            match self.start_next(source) {
                Step::Send(request) => {
                    let completion = request.await;
                    pushed += self.complete(source, completion);
                }
                Step::Finished(result) => finished.push(result),
                Step::Idle => return (pushed, finished),
            }
        }
    }
}

fn created_id(object: &RemoteObject) -> Result<String, RemoteError> {
    object
        .id()
        .map(str::to_string)
        .ok_or_else(|| RemoteError::Malformed("created object has no id".to_string()))
}

fn send(service: Arc<dyn TaskService>, job: Job, outgoing: Outgoing) -> Request {
    Box::pin(async move {
        let response = match outgoing {
            Outgoing::CreateList(body) => Response::Written(service.create_task_list(&body).await),
            Outgoing::PatchList(id, patch) => {
                Response::Written(service.patch_task_list(&id, &patch).await)
            }
            Outgoing::DeleteList(id) => Response::Deleted(service.delete_task_list(&id).await),
            Outgoing::CreateTask(list_id, body) => {
                Response::Written(service.create_task(&list_id, &body).await)
            }
            Outgoing::PatchTask(list_id, task_id, patch) => {
                Response::Written(service.patch_task(&list_id, &task_id, &patch).await)
            }
            Outgoing::DeleteTask(list_id, task_id) => {
                Response::Deleted(service.delete_task(&list_id, &task_id).await)
            }
            Outgoing::Pull => Response::Listed(fetch_all(service.as_ref()).await),
        };
        Completion { job, response }
    })
}

/// The whole listing, or the first error.
async fn fetch_all(service: &dyn TaskService) -> Result<Vec<RemoteTaskList>, RemoteError> {
    let mut stream = service.list_task_lists();
    let mut lists = Vec::new();
    while let Some(item) = stream.next().await {
        lists.push(item?);
    }
    Ok(lists)
}

// --- Pull ---

fn apply_pull(source: &mut Source, lists: Vec<RemoteTaskList>, summary: &mut SyncSummary) {
    let mut reported = HashSet::new();

    for RemoteTaskList { list, tasks } in lists {
        let Some(remote_id) = list.id().map(str::to_string) else {
            log::warn!("Ignoring remote task list without an id");
            continue;
        };
        if list.is_deleted() || source.tombstones.contains_list(&remote_id) {
            continue;
        }
        reported.insert(remote_id.clone());
        summary.lists_pulled += 1;

        let tombstones = &source.tombstones;
        let local_id = source
            .lists
            .find_by_remote_id(&remote_id)
            .map(|local| local.id().to_string());
        match local_id {
            Some(local_id) => {
                source.lists.update(&local_id, |local| {
                    apply_remote_list(local, list);
                    merge_remote_tasks(local, &remote_id, tasks, tombstones, summary);
                });
            }
            None => {
                let mut local = TaskList::new(list.str("title").unwrap_or_default());
                local.set_remote(Some(list));
                merge_remote_tasks(&mut local, &remote_id, tasks, tombstones, summary);
                if let Err(e) = source.lists.add(local) {
                    summary.errors.push(e.to_string());
                    continue;
                }
                summary.lists_created += 1;
            }
        }
    }

    let gone: Vec<String> = source
        .lists
        .iter()
        .filter(|list| list.remote_id().is_some_and(|id| !reported.contains(id)))
        .map(|list| list.id().to_string())
        .collect();
    for list_id in gone {
        log::info!("List {} was deleted remotely", list_id);
        source.lists.remove(&list_id);
        summary.lists_removed += 1;
    }
}

fn apply_remote_list(list: &mut TaskList, remote: RemoteObject) {
    let title = remote.str("title").unwrap_or_default().to_string();
    let base = list.remote().and_then(|mirror| mirror.str("title"));
    if base != Some(title.as_str()) {
        list.set_title(title);
    }
    list.set_remote(Some(remote));
}

/// Reconcile a list's tasks with what the server reported, by remote id.
fn merge_remote_tasks(
    list: &mut TaskList,
    list_remote_id: &str,
    tasks: Vec<RemoteObject>,
    tombstones: &Tombstones,
    summary: &mut SyncSummary,
) {
    let mut reported = HashSet::new();
    for remote in tasks {
        let Some(remote_id) = remote.id().map(str::to_string) else {
            continue;
        };
        if remote.is_deleted() || tombstones.contains_task(list_remote_id, &remote_id) {
            continue;
        }

        let local_id = list
            .tasks()
            .find_by_remote_id(&remote_id)
            .map(|task| task.id().to_string());
        match local_id {
            Some(task_id) => {
                list.update_task(&task_id, |task| merge::apply_remote_task(task, &remote));
                summary.tasks_pulled += 1;
            }
            None => match list.add_task(mapping::task_from_remote(&remote)) {
                Ok(_) => summary.tasks_created += 1,
                Err(e) => summary.errors.push(e.to_string()),
            },
        }
        reported.insert(remote_id);
    }

    let gone: Vec<String> = list
        .tasks()
        .iter()
        .filter(|task| task.remote_id().is_some_and(|id| !reported.contains(id)))
        .map(|task| task.id().to_string())
        .collect();
    for task_id in gone {
        list.delete_task(&task_id);
        summary.tasks_removed += 1;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory task service for engine and worker tests.

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use futures::future::{self, BoxFuture};
    use futures::stream::{self, BoxStream};

    use super::*;

    #[derive(Default)]
    struct State {
        lists: Vec<RemoteTaskList>,
        next_id: usize,
        patches: Vec<RemoteObject>,
    }

    #[derive(Default)]
    pub struct FakeService {
        state: Mutex<State>,
        pub fail_listing: AtomicBool,
        pub fail_deletes: AtomicBool,
        pub hang_deletes: AtomicBool,
    }

    fn not_found() -> RemoteError {
        RemoteError::Status {
            status: 404,
            body: "Not Found".to_string(),
        }
    }

    fn server_error() -> RemoteError {
        RemoteError::Status {
            status: 503,
            body: "Backend Error".to_string(),
        }
    }

    fn merge_into(target: &mut RemoteObject, patch: &RemoteObject) {
        for (key, value) in patch.as_map() {
            target.insert(key.clone(), value.clone());
        }
    }

    impl FakeService {
        pub fn with_list(self, list: serde_json::Value, tasks: Vec<serde_json::Value>) -> Self {
            self.state.lock().unwrap().lists.push(RemoteTaskList {
                list: RemoteObject::try_from(list).unwrap(),
                tasks: tasks
                    .into_iter()
                    .map(|t| RemoteObject::try_from(t).unwrap())
                    .collect(),
            });
            self
        }

        pub fn lists(&self) -> Vec<RemoteTaskList> {
            self.state.lock().unwrap().lists.clone()
        }

        pub fn list(&self, id: &str) -> Option<RemoteTaskList> {
            self.lists().into_iter().find(|l| l.list.id() == Some(id))
        }

        pub fn patches(&self) -> Vec<RemoteObject> {
            self.state.lock().unwrap().patches.clone()
        }

        /// Simulate an edit made by another client.
        pub fn edit_task(&self, list_id: &str, task_id: &str, patch: serde_json::Value) {
            let patch = RemoteObject::try_from(patch).unwrap();
            let mut state = self.state.lock().unwrap();
            let list = state.lists.iter_mut().find(|l| l.list.id() == Some(list_id)).unwrap();
            let task = list.tasks.iter_mut().find(|t| t.id() == Some(task_id)).unwrap();
            merge_into(task, &patch);
        }

        pub fn drop_task(&self, list_id: &str, task_id: &str) {
            let mut state = self.state.lock().unwrap();
            let list = state.lists.iter_mut().find(|l| l.list.id() == Some(list_id)).unwrap();
            list.tasks.retain(|t| t.id() != Some(task_id));
        }

        pub fn drop_list(&self, list_id: &str) {
            self.state
                .lock()
                .unwrap()
                .lists
                .retain(|l| l.list.id() != Some(list_id));
        }

        fn delete_outcome(&self) -> Option<Result<(), RemoteError>> {
            if self.hang_deletes.load(Ordering::SeqCst) {
                None
            } else if self.fail_deletes.load(Ordering::SeqCst) {
                Some(Err(server_error()))
            } else {
                Some(Ok(()))
            }
        }
    }

    fn respond<'a, T: Send + 'a>(outcome: Option<Result<T, RemoteError>>) -> BoxFuture<'a, Result<T, RemoteError>> {
        match outcome {
            Some(result) => Box::pin(future::ready(result)),
            None => Box::pin(future::pending()),
        }
    }

    impl TaskService for FakeService {
        fn list_task_lists(&self) -> BoxStream<'_, Result<RemoteTaskList, RemoteError>> {
            if self.fail_listing.load(Ordering::SeqCst) {
                return Box::pin(stream::iter(vec![Err(server_error())]));
            }
            Box::pin(stream::iter(self.lists().into_iter().map(Ok)))
        }

        fn create_task_list<'a>(
            &'a self,
            body: &'a RemoteObject,
        ) -> BoxFuture<'a, Result<RemoteObject, RemoteError>> {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            let created = body.clone().with("id", format!("R{}", state.next_id));
            state.lists.push(RemoteTaskList {
                list: created.clone(),
                tasks: Vec::new(),
            });
            respond(Some(Ok(created)))
        }

        fn patch_task_list<'a>(
            &'a self,
            list_id: &'a str,
            patch: &'a RemoteObject,
        ) -> BoxFuture<'a, Result<RemoteObject, RemoteError>> {
            let mut state = self.state.lock().unwrap();
            state.patches.push(patch.clone());
            let outcome = match state.lists.iter_mut().find(|l| l.list.id() == Some(list_id)) {
                Some(list) => {
                    merge_into(&mut list.list, patch);
                    Ok(list.list.clone())
                }
                None => Err(not_found()),
            };
            respond(Some(outcome))
        }

        fn delete_task_list<'a>(&'a self, list_id: &'a str) -> BoxFuture<'a, Result<(), RemoteError>> {
            let outcome = self.delete_outcome();
            if let Some(Ok(())) = outcome {
                self.drop_list(list_id);
            }
            respond(outcome)
        }

        fn create_task<'a>(
            &'a self,
            list_id: &'a str,
            body: &'a RemoteObject,
        ) -> BoxFuture<'a, Result<RemoteObject, RemoteError>> {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            let created = body.clone().with("id", format!("T{}", state.next_id));
            let outcome = match state.lists.iter_mut().find(|l| l.list.id() == Some(list_id)) {
                Some(list) => {
                    list.tasks.push(created.clone());
                    Ok(created)
                }
                None => Err(not_found()),
            };
            respond(Some(outcome))
        }

        fn patch_task<'a>(
            &'a self,
            list_id: &'a str,
            task_id: &'a str,
            patch: &'a RemoteObject,
        ) -> BoxFuture<'a, Result<RemoteObject, RemoteError>> {
            let mut state = self.state.lock().unwrap();
            state.patches.push(patch.clone());
            let outcome = state
                .lists
                .iter_mut()
                .find(|l| l.list.id() == Some(list_id))
                .and_then(|l| l.tasks.iter_mut().find(|t| t.id() == Some(task_id)))
                .map(|task| {
                    merge_into(task, patch);
                    task.clone()
                })
                .ok_or_else(not_found);
            respond(Some(outcome))
        }

        fn delete_task<'a>(
            &'a self,
            list_id: &'a str,
            task_id: &'a str,
        ) -> BoxFuture<'a, Result<(), RemoteError>> {
            let outcome = self.delete_outcome();
            if let Some(Ok(())) = outcome {
                let mut state = self.state.lock().unwrap();
                if let Some(list) = state.lists.iter_mut().find(|l| l.list.id() == Some(list_id)) {
                    list.tasks.retain(|t| t.id() != Some(task_id));
                }
            }
            respond(outcome)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use serde_json::json;
    use tempfile::TempDir;

    use super::testing::FakeService;
    use super::*;
    use crate::core::task_list::NewTask;
    use crate::store::SourceStore;
    use crate::sync::extension::MirrorExtension;

    fn account() -> Source {
        Source::new("acct-1", "Work", "google", true)
    }

    fn engine_for(service: &Arc<FakeService>) -> SyncEngine {
        SyncEngine::new(service.clone())
    }

    fn groceries() -> FakeService {
        FakeService::default().with_list(
            json!({"id": "L1", "title": "Groceries"}),
            vec![
                json!({"id": "T1", "title": "Milk", "status": "needsAction"}),
                json!({"id": "T2", "title": "Bread", "status": "needsAction", "notes": "white"}),
            ],
        )
    }

    fn local_list_id(source: &Source, remote_id: &str) -> String {
        source
            .lists
            .find_by_remote_id(remote_id)
            .map(|l| l.id().to_string())
            .unwrap()
    }

    fn local_task_id(source: &Source, list_id: &str, remote_id: &str) -> String {
        source
            .list(list_id)
            .and_then(|l| l.tasks().find_by_remote_id(remote_id))
            .map(|t| t.id().to_string())
            .unwrap()
    }

    #[tokio::test]
    async fn pull_materializes_a_remote_list() {
        let service = Arc::new(
            FakeService::default().with_list(json!({"id": "L1", "title": "Groceries"}), vec![]),
        );
        let mut engine = engine_for(&service);
        let mut source = account();

        let summary = engine.sync(&mut source).await.unwrap();

        assert_eq!(source.lists.len(), 1);
        let list = source.lists.iter().next().unwrap();
        assert_eq!(list.title(), "Groceries");
        assert_eq!(list.remote_id(), Some("L1"));
        assert_eq!(summary.lists_created, 1);

        engine.sync(&mut source).await.unwrap();
        assert_eq!(source.lists.len(), 1);
    }

    #[tokio::test]
    async fn created_list_takes_the_server_id() {
        let service = Arc::new(FakeService::default());
        let mut engine = engine_for(&service);
        let mut source = account();
        engine.attach(&mut source);

        let list_id = source.create_task_list("Work");
        source.create_task(&list_id, NewTask::titled("Quarterly report"));
        let pushed = engine.push_pending(&mut source).await;

        assert_eq!(pushed, 2);
        let list = source.list(&list_id).unwrap();
        assert_eq!(list.remote_id(), Some("R1"));
        assert!(list.tasks().iter().all(|t| t.remote().is_some()));
        let remote = service.list("R1").unwrap();
        assert_eq!(remote.list.str("title"), Some("Work"));
        assert_eq!(remote.tasks[0].str("title"), Some("Quarterly report"));
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_is_tombstoned_before_the_server_answers() {
        let service = Arc::new(groceries());
        let mut engine = engine_for(&service);
        let mut source = account();
        engine.sync(&mut source).await.unwrap();
        let list_id = local_list_id(&source, "L1");

        service.hang_deletes.store(true, Ordering::SeqCst);
        source.delete_task_list(&list_id);
        let push = tokio::time::timeout(Duration::from_secs(5), engine.push_pending(&mut source)).await;
        assert!(push.is_err());
        assert!(source.tombstones.contains_list("L1"));

        service.hang_deletes.store(false, Ordering::SeqCst);
        let summary = engine.sync(&mut source).await.unwrap();
        assert_eq!(summary.deletions_confirmed, 1);
        assert!(!source.tombstones.contains_list("L1"));
        assert!(service.list("L1").is_none());
        assert!(source.lists.is_empty());
    }

    #[tokio::test]
    async fn confirmed_task_deletion_clears_its_tombstone() {
        let service = Arc::new(groceries());
        let mut engine = engine_for(&service);
        let mut source = account();
        engine.sync(&mut source).await.unwrap();
        let list_id = local_list_id(&source, "L1");
        let task_id = local_task_id(&source, &list_id, "T2");

        source.delete_task(&list_id, &task_id);
        engine.push_pending(&mut source).await;

        assert!(source.tombstones.is_empty());
        assert_eq!(service.list("L1").unwrap().tasks.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tombstones_outlive_a_crash_and_block_resurrection() {
        let dir = TempDir::new().unwrap();
        let store = SourceStore::new(dir.path(), "acct-1", Box::new(MirrorExtension));
        let service = Arc::new(groceries());
        let mut source = account();
        {
            let mut engine = engine_for(&service);
            engine.sync(&mut source).await.unwrap();
            let list_id = local_list_id(&source, "L1");
            service.hang_deletes.store(true, Ordering::SeqCst);
            source.delete_task_list(&list_id);
            engine.queue_changes(&mut source);
            assert!(engine.take_unsaved_tombstones());
            store.save(&source).unwrap();
            let Step::Send(request) = engine.start_next(&source) else {
                panic!("expected the list delete to be sent");
            };
            assert!(tokio::time::timeout(Duration::from_secs(5), request).await.is_err());
        }

        // Restart with a server that still refuses deletes.
        service.hang_deletes.store(false, Ordering::SeqCst);
        service.fail_deletes.store(true, Ordering::SeqCst);
        let mut restarted = account();
        assert!(store.load(&mut restarted).unwrap());
        assert!(restarted.tombstones.contains_list("L1"));
        let mut engine = engine_for(&service);
        let summary = engine.sync(&mut restarted).await.unwrap();
        assert_eq!(summary.errors.len(), 1);
        assert!(restarted.lists.is_empty());
        assert!(restarted.tombstones.contains_list("L1"));

        service.fail_deletes.store(false, Ordering::SeqCst);
        engine.sync(&mut restarted).await.unwrap();
        assert!(restarted.tombstones.is_empty());
        assert!(service.lists().is_empty());
    }

    #[tokio::test]
    async fn tombstoned_task_is_not_pulled_back() {
        let service = Arc::new(groceries());
        let mut engine = engine_for(&service);
        let mut source = account();
        engine.sync(&mut source).await.unwrap();
        let list_id = local_list_id(&source, "L1");
        let bread = local_task_id(&source, &list_id, "T2");

        service.fail_deletes.store(true, Ordering::SeqCst);
        source.delete_task(&list_id, &bread);
        engine.push_pending(&mut source).await;
        assert_eq!(service.list("L1").unwrap().tasks.len(), 2);

        let summary = engine.sync(&mut source).await.unwrap();

        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.tasks_created, 0);
        let list = source.list(&list_id).unwrap();
        assert_eq!(list.tasks().len(), 1);
        assert!(list.tasks().find_by_remote_id("T2").is_none());
        assert!(source.tombstones.contains_task("L1", "T2"));
    }

    #[tokio::test]
    async fn list_deleted_during_its_create_is_deleted_remotely() {
        let service = Arc::new(FakeService::default());
        let mut engine = engine_for(&service);
        let mut source = account();
        engine.attach(&mut source);

        let list_id = source.create_task_list("Short lived");
        engine.queue_changes(&mut source);
        let Step::Send(request) = engine.start_next(&source) else {
            panic!("expected the list create to be sent");
        };
        source.delete_task_list(&list_id);
        engine.queue_changes(&mut source);
        assert!(!engine.take_unsaved_tombstones());

        let completion = request.await;
        assert_eq!(engine.complete(&mut source, completion), 1);
        assert!(engine.take_unsaved_tombstones());
        assert!(source.tombstones.contains_list("R1"));

        engine.push_pending(&mut source).await;
        assert!(service.lists().is_empty());
        assert!(source.tombstones.is_empty());
    }

    #[tokio::test]
    async fn failed_pull_still_reattaches_listeners() {
        let service = Arc::new(FakeService::default());
        service.fail_listing.store(true, Ordering::SeqCst);
        let mut engine = engine_for(&service);
        let mut source = account();
        engine.attach(&mut source);

        let err = engine.sync(&mut source).await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(RemoteError::Status { status: 503, .. })));
        assert!(engine.is_attached());

        source.create_task_list("After the outage");
        assert_eq!(engine.push_pending(&mut source).await, 1);
        assert_eq!(service.lists().len(), 1);
    }

    #[tokio::test]
    async fn edits_patch_only_changed_fields() {
        let service = Arc::new(groceries());
        let mut engine = engine_for(&service);
        let mut source = account();
        engine.sync(&mut source).await.unwrap();
        let list_id = local_list_id(&source, "L1");
        let task_id = local_task_id(&source, &list_id, "T2");

        source.update_task(&list_id, &task_id, |t| t.set_notes(Some("sourdough".into())));
        assert_eq!(engine.push_pending(&mut source).await, 1);

        let patches = service.patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].keys().collect::<Vec<_>>(), vec!["notes"]);
        let remote = service.list("L1").unwrap();
        assert_eq!(remote.tasks[1].str("notes"), Some("sourdough"));
    }

    #[tokio::test]
    async fn renaming_a_list_patches_its_title() {
        let service = Arc::new(groceries());
        let mut engine = engine_for(&service);
        let mut source = account();
        engine.sync(&mut source).await.unwrap();
        let list_id = local_list_id(&source, "L1");

        source.rename_task_list(&list_id, "Food");
        assert_eq!(engine.push_pending(&mut source).await, 1);
        assert_eq!(service.list("L1").unwrap().list.str("title"), Some("Food"));
    }

    #[tokio::test]
    async fn pull_merges_and_drops_what_the_server_dropped() {
        let service = Arc::new(groceries());
        let mut engine = engine_for(&service);
        let mut source = account();
        engine.sync(&mut source).await.unwrap();
        let list_id = local_list_id(&source, "L1");
        let milk = local_task_id(&source, &list_id, "T1");

        // Detached so the local edit is only pushed by the sync itself.
        engine.detach(&mut source);
        source.update_task(&list_id, &milk, |t| t.set_notes(Some("oat".into())));
        engine.attach(&mut source);
        service.edit_task("L1", "T1", json!({"title": "Oat milk"}));
        service.drop_task("L1", "T2");

        let summary = engine.sync(&mut source).await.unwrap();

        let list = source.list(&list_id).unwrap();
        assert_eq!(list.tasks().len(), 1);
        let task = list.task(&milk).unwrap();
        assert_eq!(task.title(), "Oat milk");
        assert_eq!(task.notes(), Some("oat"));
        assert_eq!(summary.tasks_removed, 1);
        assert_eq!(summary.pushed, 1);
        assert_eq!(service.list("L1").unwrap().tasks[0].str("notes"), Some("oat"));
    }

    #[tokio::test]
    async fn lists_deleted_on_the_server_are_removed() {
        let service = Arc::new(groceries());
        let mut engine = engine_for(&service);
        let mut source = account();
        engine.sync(&mut source).await.unwrap();
        engine.detach(&mut source);
        let local_only = source.create_task_list("Not yet pushed");

        service.drop_list("L1");
        let summary = engine.sync(&mut source).await.unwrap();

        assert_eq!(summary.lists_removed, 1);
        assert!(source.lists.find_by_remote_id("L1").is_none());
        // The unpushed list is created by the same sync.
        assert!(source.list(&local_only).unwrap().remote_id().is_some());
    }
}
