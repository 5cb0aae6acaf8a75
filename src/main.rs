use wick::config::{WickConfig, default_config_path};
use wick::context::AppContext;
use wick::core::collection::Entity;
use wick::sources::SourceManager;
use wick::sources::account::discover_accounts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Daemon,
    Once,
    Status,
}

struct FilteredJournal {
    inner: systemd_journal_logger::JournalLog,
}

impl log::Log for FilteredJournal {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        if metadata.target().starts_with("wick") {
            let max = if wick::debug_logging() {
                log::LevelFilter::Debug
            } else {
                log::LevelFilter::Info
            };
            metadata.level() <= max
        } else {
            metadata.level() <= log::LevelFilter::Warn
        }
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            self.inner.log(record);
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Log to the systemd user journal (`journalctl --user -t wick -f`).
fn init_logging() {
    let journal = match systemd_journal_logger::JournalLog::new() {
        Ok(journal) => journal.with_syslog_identifier("wick".to_string()),
        Err(e) => {
            eprintln!("wick: journal unavailable, logging disabled: {e}");
            return;
        }
    };
    if let Err(e) = log::set_boxed_logger(Box::new(FilteredJournal { inner: journal })) {
        eprintln!("wick: could not install logger: {e}");
        return;
    }
    // Debug must pass the global gate so the toggle can take effect.
    log::set_max_level(log::LevelFilter::Debug);
}

async fn print_status(manager: &SourceManager) {
    for handle in manager.sources().iter() {
        let counts = handle
            .read(|source| (source.lists.len(), source.task_count()))
            .await;
        match counts {
            Ok((lists, tasks)) => println!(
                "{:<24} {:<32} {} lists, {} tasks",
                handle.id(),
                handle.name(),
                lists,
                tasks
            ),
            Err(e) => println!("{:<24} {:<32} {}", handle.id(), handle.name(), e),
        }
    }
}

async fn sync_once(manager: &SourceManager) {
    for (id, result) in manager.sync_all().await {
        match result {
            Ok(summary) if !summary.errors.is_empty() => {
                log::warn!("{}: {} sync errors", id, summary.errors.len())
            }
            Ok(_) => {}
            Err(e) => log::warn!("{}: {}", id, e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config = WickConfig::load()?;
    wick::set_debug_logging(config.debug_logging);
    log::info!("Config loaded from {}", default_config_path().display());

    let mode = {
        let args: Vec<String> = std::env::args().collect();
        if args.iter().any(|a| a == "--status") {
            RunMode::Status
        } else if args.iter().any(|a| a == "--once") {
            RunMode::Once
        } else {
            RunMode::Daemon
        }
    };

    let accounts = discover_accounts(&config).await;
    let interval = config.sync_interval();
    let mut manager = SourceManager::new(AppContext::new(config));
    manager.reconcile_accounts(&accounts).await;

    match mode {
        RunMode::Status => print_status(&manager).await,
        RunMode::Once => sync_once(&manager).await,
        RunMode::Daemon => {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => sync_once(&manager).await,
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            log::error!("Could not listen for Ctrl-C: {}", e);
                        }
                        break;
                    }
                }
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}
