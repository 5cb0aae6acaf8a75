//! One tokio task per Source.
//!
//! The worker owns the Source, its store, its sync engine and its save
//! scheduler outright; everything else talks to it through a
//! [`SourceHandle`]. Commands are answered as soon as the Source has changed.
//! Remote requests go out one at a time in the background, so a hanging
//! server never holds up a reply, a save or a shutdown. A sync requested
//! while another is running is queued behind it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::context::AppContext;
use crate::core::collection::{CollectionEvent, Entity};
use crate::core::observable::SubscriptionId;
use crate::core::source::{Source, SourceEvent};
use crate::core::task::Task;
use crate::core::task_list::{NewTask, TaskListField};
use crate::store::SourceStore;
use crate::store::debounce::SaveScheduler;
use crate::sync::{Completion, Request, Step, SyncEngine, SyncError, SyncSummary};

/// Field edits for one task. `None` leaves a field alone; for the optional
/// fields `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub completed: Option<Option<DateTime<Utc>>>,
    pub due: Option<Option<DateTime<Utc>>>,
    pub notes: Option<Option<String>>,
}

impl TaskUpdate {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn completed(at: Option<DateTime<Utc>>) -> Self {
        Self {
            completed: Some(at),
            ..Default::default()
        }
    }

    pub fn apply(self, task: &mut Task) {
        if let Some(title) = self.title {
            task.set_title(title);
        }
        if let Some(completed) = self.completed {
            task.set_completed(completed);
        }
        if let Some(due) = self.due {
            task.set_due(due);
        }
        if let Some(notes) = self.notes {
            task.set_notes(notes);
        }
    }
}

type ListCallback = Box<dyn FnMut(&CollectionEvent<TaskListField>) + Send>;

enum Command {
    CreateTaskList {
        title: String,
        reply: oneshot::Sender<String>,
    },
    RenameTaskList {
        id: String,
        title: String,
        reply: oneshot::Sender<bool>,
    },
    DeleteTaskList {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    CreateTask {
        list_id: String,
        task: NewTask,
        reply: oneshot::Sender<Option<String>>,
    },
    UpdateTask {
        list_id: String,
        task_id: String,
        update: TaskUpdate,
        reply: oneshot::Sender<bool>,
    },
    DeleteTask {
        list_id: String,
        task_id: String,
        reply: oneshot::Sender<bool>,
    },
    Sync {
        reply: oneshot::Sender<Result<SyncSummary, SyncError>>,
    },
    Save {
        reply: oneshot::Sender<()>,
    },
    Read(Box<dyn FnOnce(&Source) + Send>),
    SubscribeLists {
        callback: ListCallback,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Shutdown {
        save: bool,
        reply: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable access to a running Source.
#[derive(Clone)]
pub struct SourceHandle {
    id: String,
    name: String,
    icon: String,
    builtin: bool,
    commands: mpsc::UnboundedSender<Command>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SourceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn icon(&self) -> &str {
        &self.icon
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, SyncError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| SyncError::WorkerGone)?;
        response.await.map_err(|_| SyncError::WorkerGone)
    }

    pub async fn create_task_list(&self, title: impl Into<String>) -> Result<String, SyncError> {
        let title = title.into();
        self.request(|reply| Command::CreateTaskList { title, reply })
            .await
    }

    pub async fn rename_task_list(
        &self,
        id: &str,
        title: impl Into<String>,
    ) -> Result<bool, SyncError> {
        let (id, title) = (id.to_string(), title.into());
        self.request(|reply| Command::RenameTaskList { id, title, reply })
            .await
    }

    pub async fn delete_task_list(&self, id: &str) -> Result<bool, SyncError> {
        let id = id.to_string();
        self.request(|reply| Command::DeleteTaskList { id, reply }).await
    }

    /// Returns `None` when the list does not exist.
    pub async fn create_task(
        &self,
        list_id: &str,
        task: NewTask,
    ) -> Result<Option<String>, SyncError> {
        let list_id = list_id.to_string();
        self.request(|reply| Command::CreateTask {
            list_id,
            task,
            reply,
        })
        .await
    }

    pub async fn update_task(
        &self,
        list_id: &str,
        task_id: &str,
        update: TaskUpdate,
    ) -> Result<bool, SyncError> {
        let (list_id, task_id) = (list_id.to_string(), task_id.to_string());
        self.request(|reply| Command::UpdateTask {
            list_id,
            task_id,
            update,
            reply,
        })
        .await
    }

    pub async fn delete_task(&self, list_id: &str, task_id: &str) -> Result<bool, SyncError> {
        let (list_id, task_id) = (list_id.to_string(), task_id.to_string());
        self.request(|reply| Command::DeleteTask {
            list_id,
            task_id,
            reply,
        })
        .await
    }

    pub async fn sync(&self) -> Result<SyncSummary, SyncError> {
        self.request(|reply| Command::Sync { reply }).await?
    }

    /// Save right away. Failures go to the notifier like any other save.
    pub async fn save(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Save { reply }).await
    }

    /// Run `f` against the Source inside the worker and return its result.
    pub async fn read<R: Send + 'static>(
        &self,
        f: impl FnOnce(&Source) -> R + Send + 'static,
    ) -> Result<R, SyncError> {
        self.request(|reply| {
            Command::Read(Box::new(move |source: &Source| {
                let _ = reply.send(f(source));
            }))
        })
        .await
    }

    /// The callback runs on the worker task.
    pub async fn subscribe_lists(
        &self,
        callback: impl FnMut(&CollectionEvent<TaskListField>) + Send + 'static,
    ) -> Result<SubscriptionId, SyncError> {
        let callback: ListCallback = Box::new(callback);
        self.request(|reply| Command::SubscribeLists { callback, reply })
            .await
    }

    /// Stop the worker, optionally saving first, and wait for it to finish.
    pub async fn shutdown(&self, save: bool) -> Result<(), SyncError> {
        let result = self.request(|reply| Command::Shutdown { save, reply }).await;
        let worker = self.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                log::error!("Worker for {} ended abnormally: {}", self.name, e);
            }
        }
        result
    }
}

impl Entity for SourceHandle {
    type Field = ();
    const ID_PREFIX: &'static str = "source";

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn builtin(&self) -> bool {
        self.builtin
    }
}

pub struct SourceWorker {
    source: Source,
    store: SourceStore,
    engine: Option<SyncEngine>,
    saves: SaveScheduler,
    commands: mpsc::UnboundedReceiver<Command>,
    in_flight: Option<Request>,
    sync_replies: VecDeque<oneshot::Sender<Result<SyncSummary, SyncError>>>,
}

impl SourceWorker {
    /// Start a worker on the current runtime. Sources without an engine are
    /// local only.
    pub fn spawn(
        mut source: Source,
        store: SourceStore,
        engine: Option<SyncEngine>,
        ctx: &AppContext,
        builtin: bool,
    ) -> SourceHandle {
        let (sender, commands) = mpsc::unbounded_channel();
        let notify = ctx.clone();
        let name = source.name().to_string();
        source.subscribe_events(move |event| notify.notify(&name, event));

        let handle = SourceHandle {
            id: source.id().to_string(),
            name: source.name().to_string(),
            icon: source.icon().to_string(),
            builtin,
            commands: sender,
            worker: Arc::new(Mutex::new(None)),
        };
        let worker = SourceWorker {
            source,
            store,
            engine,
            saves: SaveScheduler::new(ctx.config.save_delay()),
            commands,
            in_flight: None,
            sync_replies: VecDeque::new(),
        };
        let task = tokio::spawn(worker.run());
        if let Ok(mut slot) = handle.worker.lock() {
            *slot = Some(task);
        }
        handle
    }

    async fn run(mut self) {
        if let Err(e) = self.store.load(&mut self.source) {
            self.source.report(SourceEvent::LoadError(e.to_string()));
        }
        if let Some(engine) = self.engine.as_mut() {
            engine.attach(&mut self.source);
        }
        log::debug!("Worker for {} started", self.source.name());

        loop {
            self.pump();
            let deadline = self.saves.deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { save, reply }) => {
                        self.stop(save);
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        let save = self.saves.is_pending();
                        self.stop(save);
                        break;
                    }
                },
                completion = next_completion(&mut self.in_flight) => {
                    if let Some(engine) = self.engine.as_mut() {
                        engine.complete(&mut self.source, completion);
                    }
                    self.saves.schedule(Instant::now());
                }
                _ = save_deadline(deadline) => {
                    if self.saves.take_due(Instant::now()) {
                        self.save_now();
                    }
                }
            }
        }
        log::debug!("Worker for {} stopped", self.source.name());
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::CreateTaskList { title, reply } => {
                let id = self.source.create_task_list(title);
                self.after_mutation();
                let _ = reply.send(id);
            }
            Command::RenameTaskList { id, title, reply } => {
                let renamed = self.source.rename_task_list(&id, title);
                self.after_mutation();
                let _ = reply.send(renamed);
            }
            Command::DeleteTaskList { id, reply } => {
                let deleted = self.source.delete_task_list(&id);
                self.after_mutation();
                let _ = reply.send(deleted);
            }
            Command::CreateTask {
                list_id,
                task,
                reply,
            } => {
                let id = self.source.create_task(&list_id, task);
                self.after_mutation();
                let _ = reply.send(id);
            }
            Command::UpdateTask {
                list_id,
                task_id,
                update,
                reply,
            } => {
                let found = self
                    .source
                    .update_task(&list_id, &task_id, |task| update.apply(task))
                    .is_some();
                self.after_mutation();
                let _ = reply.send(found);
            }
            Command::DeleteTask {
                list_id,
                task_id,
                reply,
            } => {
                let deleted = self.source.delete_task(&list_id, &task_id);
                self.after_mutation();
                let _ = reply.send(deleted);
            }
            Command::Sync { reply } => match self.engine.as_mut() {
                Some(engine) => {
                    engine.queue_changes(&mut self.source);
                    engine.begin_sync(&self.source);
                    self.sync_replies.push_back(reply);
                }
                None => {
                    let _ = reply.send(Ok(SyncSummary::default()));
                }
            },
            Command::Save { reply } => {
                self.saves.cancel();
                self.save_now();
                let _ = reply.send(());
            }
            Command::Read(f) => f(&self.source),
            Command::SubscribeLists { mut callback, reply } => {
                let id = self.source.subscribe_lists(move |event| callback(event));
                let _ = reply.send(id);
            }
            // Handled by the run loop.
            Command::Shutdown { reply, .. } => {
                let _ = reply.send(());
            }
        }
    }

    /// Tombstones reach the disk before the reply, and so before the delete
    /// they stand for is sent.
    fn after_mutation(&mut self) {
        if self.queue_changes() {
            self.saves.cancel();
            self.save_now();
        } else {
            self.saves.schedule(Instant::now());
        }
    }

    /// Returns true when tombstones were written and not yet saved.
    fn queue_changes(&mut self) -> bool {
        match self.engine.as_mut() {
            Some(engine) => {
                engine.queue_changes(&mut self.source);
                engine.take_unsaved_tombstones()
            }
            None => false,
        }
    }

    /// Send the next request unless one is already out. Finished sync runs
    /// are answered on the way.
    fn pump(&mut self) {
        if self.queue_changes() {
            self.saves.cancel();
            self.save_now();
        }
        while self.in_flight.is_none() {
            let Some(engine) = self.engine.as_mut() else {
                return;
            };
            match engine.start_next(&self.source) {
                Step::Send(request) => self.in_flight = Some(request),
                Step::Finished(result) => {
                    // Confirmed deletions are saved even when the pull failed.
                    self.saves.schedule(Instant::now());
                    if let Some(reply) = self.sync_replies.pop_front() {
                        let _ = reply.send(result);
                    }
                }
                Step::Idle => break,
            }
        }
    }

    /// A request already on the wire is left to finish on its own. Its
    /// tombstone, if any, is already on disk and is retried on the next sync.
    fn stop(&mut self, save: bool) {
        if let Some(request) = self.in_flight.take() {
            log::debug!("Detaching in-flight request for {}", self.source.name());
            tokio::spawn(request);
        }
        self.saves.cancel();
        if save {
            self.save_now();
        }
    }

    fn save_now(&mut self) {
        if let Err(e) = self.store.save(&self.source) {
            self.source.report(SourceEvent::SaveError(e.to_string()));
        }
    }
}

/// Resolves with the answer to the request in `slot`, emptying it. Never
/// resolves while the slot is empty.
async fn next_completion(slot: &mut Option<Request>) -> Completion {
    match slot.as_mut() {
        Some(request) => {
            let completion = request.await;
            *slot = None;
            completion
        }
        None => futures::future::pending().await,
    }
}

async fn save_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}
