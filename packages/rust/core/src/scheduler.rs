//! Adaptive scheduler: runs the collection pass on a timer whose period
//! follows `collector.interval_hours`, rescheduling when the config changes.
//!
//! **State machine:** `Unconfigured → Scheduled` on [`Scheduler::start`],
//! `Scheduled → Scheduled` on a config change with a new interval. The timer
//! task is aborted when the scheduler is dropped.
//!
//! Every firing runs in its own task. Replacing the timer therefore only
//! affects future firings; a pass already running is never interrupted. A
//! firing that arrives while a pass is still running is skipped.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use mcpinsider_shared::{CollectorConfig, InsiderError, Result, load_config};

const SECS_PER_HOUR: u64 = 3_600;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// The work a firing performs.
#[async_trait]
pub trait PassRunner: Send + Sync {
    async fn run(&self, config: &CollectorConfig) -> Result<()>;
}

/// Where the scheduler reads its collector config from.
#[async_trait]
pub trait CollectorConfigSource: Send + Sync {
    async fn load(&self) -> Result<CollectorConfig>;
}

/// Reads `[collector]` from the TOML config file on every call.
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CollectorConfigSource for FileConfigSource {
    async fn load(&self) -> Result<CollectorConfig> {
        Ok(load_config(&self.path)?.collector)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Observable scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Unconfigured,
    Scheduled { interval_hours: u32 },
}

enum State {
    Unconfigured,
    Scheduled {
        interval_hours: u32,
        timer: JoinHandle<()>,
    },
}

/// Shared pieces a firing needs.
#[derive(Clone)]
struct Firing {
    source: Arc<dyn CollectorConfigSource>,
    runner: Arc<dyn PassRunner>,
    in_flight: Arc<Mutex<()>>,
}

impl Firing {
    fn spawn(&self) {
        let firing = self.clone();
        tokio::spawn(async move { firing.fire().await });
    }

    async fn fire(&self) {
        let config = match self.source.load().await {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "cannot read collector config, skipping run");
                return;
            }
        };
        if !config.enabled {
            info!("collector is disabled, skipping scheduled run");
            return;
        }

        let Ok(_guard) = self.in_flight.try_lock() else {
            warn!("previous pass still running, skipping this firing");
            return;
        };

        info!(interval_hours = config.interval_hours, "starting scheduled pass");
        if let Err(e) = self.runner.run(&config).await {
            warn!(error = %e, class = %e.class(), "scheduled pass failed");
        }
    }
}

/// Period-adaptive timer driving a [`PassRunner`].
pub struct Scheduler {
    firing: Firing,
    state: State,
}

impl Scheduler {
    pub fn new(source: Arc<dyn CollectorConfigSource>, runner: Arc<dyn PassRunner>) -> Self {
        Self {
            firing: Firing {
                source,
                runner,
                in_flight: Arc::new(Mutex::new(())),
            },
            state: State::Unconfigured,
        }
    }

    pub fn state(&self) -> SchedulerState {
        match &self.state {
            State::Unconfigured => SchedulerState::Unconfigured,
            State::Scheduled { interval_hours, .. } => SchedulerState::Scheduled {
                interval_hours: *interval_hours,
            },
        }
    }

    /// Install the timer from the current config and start one run now.
    pub async fn start(&mut self) -> Result<()> {
        let config = self.firing.source.load().await?;
        config.validate()?;

        info!(interval_hours = config.interval_hours, "scheduler started");
        self.install(config.interval_hours);
        self.firing.spawn();
        Ok(())
    }

    /// Re-read the config and replace the timer if the interval changed.
    ///
    /// An unreadable or invalid config keeps the current schedule.
    pub async fn on_config_changed(&mut self) {
        let config = match self.firing.source.load().await {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "invalid collector config, keeping current schedule");
                return;
            }
        };
        if let Err(e) = config.validate() {
            warn!(error = %e, "invalid collector config, keeping current schedule");
            return;
        }

        let current = match &self.state {
            State::Scheduled { interval_hours, .. } => Some(*interval_hours),
            State::Unconfigured => None,
        };
        match current {
            Some(hours) if hours == config.interval_hours => {
                debug!(interval_hours = hours, "interval unchanged");
            }
            Some(hours) => {
                info!(
                    from = hours,
                    to = config.interval_hours,
                    "interval changed, rescheduling"
                );
                self.install(config.interval_hours);
            }
            None => self.install(config.interval_hours),
        }
    }

    /// Start (if needed) and reschedule on every change notification until
    /// the channel closes.
    pub async fn run(mut self, mut changes: mpsc::Receiver<()>) -> Result<()> {
        if matches!(self.state, State::Unconfigured) {
            self.start().await?;
        }
        while changes.recv().await.is_some() {
            self.on_config_changed().await;
        }
        info!("config notifications closed, scheduler stopping");
        Ok(())
    }

    /// Replace any existing timer with one ticking every `interval_hours`,
    /// first tick one full period from now.
    fn install(&mut self, interval_hours: u32) {
        let period = Duration::from_secs(u64::from(interval_hours) * SECS_PER_HOUR);
        let first = Instant::now() + period;
        let firing = self.firing.clone();
        let timer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                firing.spawn();
            }
        });

        let previous = std::mem::replace(
            &mut self.state,
            State::Scheduled {
                interval_hours,
                timer,
            },
        );
        if let State::Scheduled { timer, .. } = previous {
            timer.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let State::Scheduled { timer, .. } = &self.state {
            timer.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Config change notification
// ---------------------------------------------------------------------------

/// True when `event` may have changed the file called `name`.
///
/// Access and metadata-only events are ignored, so reading the file (as
/// every firing does) never loops back into a notification.
fn touches(event: &Event, name: &OsStr) -> bool {
    let relevant = match event.kind {
        EventKind::Create(_) | EventKind::Remove(_) => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) => true,
        _ => false,
    };
    relevant && event.paths.iter().any(|p| p.file_name() == Some(name))
}

fn watch_error(dir: &Path, error: &notify::Error) -> InsiderError {
    InsiderError::io(dir, std::io::Error::other(format!("watch backend error: {error}")))
}

/// Watch `path` and send a notification when it changes.
///
/// The parent directory is watched rather than the file itself: config
/// saves replace the file by rename, which a watch on the old inode would
/// miss. After an event the adapter waits `debounce` and drains whatever
/// else arrived, so a burst of writes produces one notification. The
/// watcher lives until the receiver is dropped.
pub fn watch_config_file(path: PathBuf, debounce: Duration) -> Result<mpsc::Receiver<()>> {
    let name = path
        .file_name()
        .map(OsStr::to_os_string)
        .ok_or_else(|| InsiderError::config(format!("{} is not a file path", path.display())))?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<()>();
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| match event {
        Ok(event) if touches(&event, &name) => {
            if event_tx.send(()).is_err() {
                debug!("config event dropped because the watch task is gone");
            }
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "config watch backend error"),
    })
    .map_err(|e| watch_error(&dir, &e))?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| watch_error(&dir, &e))?;

    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        // Dropping the watcher unregisters it.
        let _watcher: RecommendedWatcher = watcher;
        debug!(path = %path.display(), "watching config file");
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                event = event_rx.recv() => {
                    if event.is_none() {
                        break;
                    }
                }
            }

            tokio::time::sleep(debounce).await;
            while event_rx.try_recv().is_ok() {}
            info!(path = %path.display(), "config file changed");
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });
    Ok(rx)
}
