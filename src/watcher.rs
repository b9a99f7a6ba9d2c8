//! Watches the config file's containing directory and delivers debounced,
//! parsed snapshots to the reconfiguration controller. See `SPEC_FULL.md`
//! §4.6; debounce semantics are ported from the original's
//! `ConfigChangeHandler`/`ConfigWatcher` (an immediate
//! too-soon-since-last-trigger check, plus a further sleep before acting,
//! so a burst of events collapses to exactly one reload).

use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::{self, Config};

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Owns the filesystem watch. Dropping it stops watching.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Watches `config_path`'s parent directory and sends every
    /// successfully-parsed config over `deliver`. Parse failures are
    /// logged and dropped — `deliver` never receives an invalid config.
    pub fn start(config_path: PathBuf, deliver: mpsc::Sender<Config>) -> anyhow::Result<Self> {
        let parent = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let (raw_tx, raw_rx) = std_mpsc::channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(move |event| {
            let _ = raw_tx.send(event);
        })?;
        watcher.watch(&parent, RecursiveMode::NonRecursive)?;

        let runtime = tokio::runtime::Handle::current();
        let watch_path = config_path.clone();
        std::thread::spawn(move || {
            let mut last_trigger: Option<Instant> = None;

            for event in raw_rx {
                let Ok(event) = event else { continue };
                if !matches_target(&event, &watch_path) {
                    continue;
                }

                let now = Instant::now();
                if let Some(last) = last_trigger {
                    if now.duration_since(last) < DEBOUNCE {
                        continue;
                    }
                }
                last_trigger = Some(now);

                let deliver = deliver.clone();
                let watch_path = watch_path.clone();
                runtime.spawn(async move {
                    tokio::time::sleep(DEBOUNCE).await;
                    match config::load(&watch_path) {
                        Ok(parsed) => {
                            if deliver.send(parsed).await.is_err() {
                                tracing::debug!("config reload receiver dropped");
                            }
                        }
                        Err(error) => {
                            tracing::warn!(error = %error, "dropping invalid config on hot reload");
                        }
                    }
                });
            }
        });

        Ok(Self { _watcher: watcher })
    }
}

fn matches_target(event: &Event, config_path: &Path) -> bool {
    let is_relevant_kind = matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Any
    );
    if !is_relevant_kind {
        return false;
    }
    event.paths.iter().any(|path| same_file(path, config_path))
}

fn same_file(path: &Path, config_path: &Path) -> bool {
    if path == config_path {
        return true;
    }
    matches!(
        (path.file_name(), config_path.file_name()),
        (Some(a), Some(b)) if a == b
    )
}
