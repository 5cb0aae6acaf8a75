pub mod account;
pub mod worker;

use std::sync::Arc;

use futures::future::join_all;

use crate::context::{AppContext, Notification, NotificationKind};
use crate::core::collection::{Collection, CollectionEvent, Entity};
use crate::core::observable::SubscriptionId;
use crate::core::source::Source;
use crate::store::SourceStore;
use crate::store::codec::PlainDocument;
use crate::sync::extension::MirrorExtension;
use crate::sync::gtasks::GTasksClient;
use crate::sync::service::{RemoteError, TaskService};
use crate::sync::{SyncEngine, SyncError, SyncSummary};
use account::{Account, AccountEvent};
use worker::{SourceHandle, SourceWorker};

pub const LOCAL_SOURCE_ID: &str = "local";

/// Builds the remote service for an account.
pub type Connector =
    Box<dyn Fn(&Account) -> Result<Arc<dyn TaskService>, RemoteError> + Send + Sync>;

/// Connects through the Google Tasks REST API at the configured base URL.
pub fn google_connector(base_url: String) -> Connector {
    Box::new(move |account: &Account| {
        let token = account.token.as_deref().unwrap_or_default();
        let client = GTasksClient::with_base_url(&base_url, token)?;
        Ok(Arc::new(client) as Arc<dyn TaskService>)
    })
}

/// Tracks one running Source per valid account, plus the builtin local one.
pub struct SourceManager {
    ctx: AppContext,
    sources: Collection<SourceHandle>,
    connector: Connector,
}

impl SourceManager {
    pub fn new(ctx: AppContext) -> Self {
        let connector = google_connector(ctx.config.api_base_url.clone());
        Self::with_connector(ctx, connector)
    }

    pub fn with_connector(ctx: AppContext, connector: Connector) -> Self {
        let mut manager = Self {
            ctx,
            sources: Collection::new(),
            connector,
        };
        manager.add_local_source();
        manager
    }

    fn add_local_source(&mut self) {
        let source = Source::new(
            LOCAL_SOURCE_ID,
            self.ctx.config.local_source_name.as_str(),
            "computer",
            false,
        );
        let store = SourceStore::new(
            &self.ctx.config.data_directory,
            LOCAL_SOURCE_ID,
            Box::new(PlainDocument),
        );
        let handle = SourceWorker::spawn(source, store, None, &self.ctx, true);
        if let Err(e) = self.sources.add(handle) {
            log::error!("Could not register the local source: {}", e);
        }
    }

    pub fn sources(&self) -> &Collection<SourceHandle> {
        &self.sources
    }

    pub fn source(&self, id: &str) -> Option<&SourceHandle> {
        self.sources.get(id)
    }

    pub fn local_source(&self) -> Option<&SourceHandle> {
        self.sources.get(LOCAL_SOURCE_ID)
    }

    pub fn subscribe(
        &mut self,
        callback: impl FnMut(&CollectionEvent<()>) + Send + 'static,
    ) -> SubscriptionId {
        self.sources.subscribe(callback)
    }

    fn spawn_account(&self, account: &Account) -> Option<SourceHandle> {
        let service = match (self.connector)(account) {
            Ok(service) => service,
            Err(e) => {
                log::warn!("Cannot connect account {}: {}", account.id, e);
                return None;
            }
        };
        let source = Source::new(
            account.id.as_str(),
            account.provider_name.as_str(),
            account.provider_icon.as_str(),
            true,
        );
        let store = SourceStore::new(
            &self.ctx.config.data_directory,
            &account.id,
            Box::new(MirrorExtension),
        );
        log::info!("Starting source for account {}", account.id);
        Some(SourceWorker::spawn(
            source,
            store,
            Some(SyncEngine::new(service)),
            &self.ctx,
            false,
        ))
    }

    /// Start a source for a valid account not seen before.
    pub fn add_account(&mut self, account: &Account) -> bool {
        if !account.is_valid() || self.sources.contains(&account.id) {
            return false;
        }
        let Some(handle) = self.spawn_account(account) else {
            return false;
        };
        match self.sources.add(handle) {
            Ok(_) => true,
            Err(e) => {
                log::error!("Could not register account {}: {}", account.id, e);
                false
            }
        }
    }

    /// Drop a source without saving it. The builtin local source stays.
    pub async fn remove_source(&mut self, id: &str) -> bool {
        if self.sources.get(id).is_none_or(|handle| handle.builtin()) {
            return false;
        }
        let Some(handle) = self.sources.remove(id) else {
            return false;
        };
        log::info!("Removing source {}", id);
        if let Err(e) = handle.shutdown(false).await {
            log::error!("Source {} did not stop cleanly: {}", id, e);
        }
        true
    }

    pub async fn handle_account_event(&mut self, event: AccountEvent) {
        match event {
            AccountEvent::Added(account) => {
                self.add_account(&account);
            }
            AccountEvent::Removed(id) => {
                self.remove_source(&id).await;
            }
            AccountEvent::Changed(account) => {
                if self.sources.contains(&account.id) {
                    if !account.is_valid() {
                        self.remove_source(&account.id).await;
                    }
                } else if account.is_valid() {
                    self.add_account(&account);
                }
            }
        }
    }

    /// Make the running sources match `accounts`: start the new valid ones,
    /// stop the rest. The local source is never touched.
    pub async fn reconcile_accounts(&mut self, accounts: &[Account]) {
        let wanted: Vec<SourceHandle> = accounts
            .iter()
            .filter(|account| account.is_valid())
            .filter_map(|account| match self.sources.get(&account.id) {
                Some(existing) => Some(existing.clone()),
                None => self.spawn_account(account),
            })
            .collect();

        let removed = self.sources.reconcile(wanted);
        stop_all(&removed, false).await;
    }

    /// Sync every source at once. Failures are passed to the notifier.
    pub async fn sync_all(&self) -> Vec<(String, Result<SyncSummary, SyncError>)> {
        let results = join_all(self.sources.iter().map(|handle| async move {
            (handle.id().to_string(), handle.name().to_string(), handle.sync().await)
        }))
        .await;

        results
            .into_iter()
            .map(|(id, name, result)| {
                if let Err(e) = &result {
                    self.ctx.notifier.notify(Notification {
                        source: name,
                        message: e.to_string(),
                        kind: NotificationKind::SyncError,
                    });
                }
                (id, result)
            })
            .collect()
    }

    /// Save every source and wait for all workers to stop.
    pub async fn shutdown(&mut self) {
        let handles: Vec<SourceHandle> = self.sources.iter().cloned().collect();
        stop_all(&handles, true).await;
        self.sources.clear();
        log::info!("All sources stopped");
    }
}

async fn stop_all(handles: &[SourceHandle], save: bool) {
    let results = join_all(handles.iter().map(|handle| handle.shutdown(save))).await;
    for (handle, result) in handles.iter().zip(results) {
        if let Err(e) = result {
            log::error!("Source {} did not stop cleanly: {}", handle.id(), e);
        }
    }
}
