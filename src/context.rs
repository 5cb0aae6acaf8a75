use std::sync::Arc;

use crate::config::WickConfig;
use crate::core::source::SourceEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    LoadError,
    SaveError,
    SyncError,
}

/// Something the user should hear about, tagged with the source it concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub source: String,
    pub message: String,
    pub kind: NotificationKind,
}

impl Notification {
    pub fn from_event(source: &str, event: &SourceEvent) -> Self {
        let (kind, message) = match event {
            SourceEvent::LoadError(message) => (NotificationKind::LoadError, message),
            SourceEvent::SaveError(message) => (NotificationKind::SaveError, message),
            SourceEvent::SyncError(message) => (NotificationKind::SyncError, message),
        };
        Self {
            source: source.to_string(),
            message: message.clone(),
            kind,
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Default sink: notifications only reach the journal.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        match notification.kind {
            NotificationKind::LoadError => log::error!(
                "[{}] could not load: {}",
                notification.source,
                notification.message
            ),
            NotificationKind::SaveError => log::error!(
                "[{}] could not save: {}",
                notification.source,
                notification.message
            ),
            NotificationKind::SyncError => log::warn!(
                "[{}] sync failed: {}",
                notification.source,
                notification.message
            ),
        }
    }
}

/// Settings and the notification sink, handed to every component that needs them.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<WickConfig>,
    pub notifier: Arc<dyn Notifier>,
}

impl AppContext {
    pub fn new(config: WickConfig) -> Self {
        Self::with_notifier(config, Arc::new(LogNotifier))
    }

    pub fn with_notifier(config: WickConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config: Arc::new(config),
            notifier,
        }
    }

    pub fn notify(&self, source: &str, event: &SourceEvent) {
        self.notifier.notify(Notification::from_event(source, event));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Keeps every notification for later inspection.
    #[derive(Default)]
    pub struct RecordingNotifier {
        seen: Mutex<Vec<Notification>>,
    }

    impl RecordingNotifier {
        pub fn seen(&self) -> Vec<Notification> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, notification: Notification) {
            self.seen.lock().unwrap().push(notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;

    #[test]
    fn source_events_carry_the_source_name() {
        let recorder = Arc::new(RecordingNotifier::default());
        let ctx = AppContext::with_notifier(WickConfig::default(), recorder.clone());

        ctx.notify("Work", &SourceEvent::SyncError("503 Backend Error".into()));

        assert_eq!(
            recorder.seen(),
            vec![Notification {
                source: "Work".into(),
                message: "503 Backend Error".into(),
                kind: NotificationKind::SyncError,
            }]
        );
    }
}
