//! File-watcher front end for the config plane.
//!
//! The pack's teacher repo has no file-watching concern of its own; this
//! adapts the `notify`-based watcher shape shown in `other_examples`
//! (`knhk-test-cache::watcher::FileWatcher`) to a flat directory of typed
//! configuration files rather than a recursive source tree, and reports
//! through an unbounded `tokio::sync::mpsc` channel instead of blocking
//! `std::sync::mpsc::recv_timeout` polling, since `notify`'s callback can
//! push directly into an async-side channel without a dedicated thread.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config_plane::{ConfigError, ConfigPlane};
use crate::domain::config::ConfigType;

enum WatchSignal {
    Changed(PathBuf),
    Removed(PathBuf),
}

fn classify(event: &Event) -> Option<WatchSignal> {
    let path = event.paths.first()?.clone();
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => Some(WatchSignal::Changed(path)),
        EventKind::Remove(_) => Some(WatchSignal::Removed(path)),
        _ => None,
    }
}

/// Start watching `dir` for add/modify/remove events on recognized
/// configuration files and apply each change to `plane` as it arrives.
///
/// The returned handle owns the underlying OS watcher; dropping it (or
/// aborting the task) stops watching.
pub fn spawn(plane: Arc<ConfigPlane>, dir: PathBuf) -> Result<JoinHandle<()>, ConfigError> {
    let (tx, mut rx) = mpsc::unbounded_channel::<WatchSignal>();

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| match result {
        Ok(event) => {
            if let Some(signal) = classify(&event) {
                let _ = tx.send(signal);
            }
        }
        Err(err) => tracing::warn!(error = %err, "configuration directory watch error"),
    })
    .map_err(|err| ConfigError::watch_failed(err.to_string()))?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|err| ConfigError::watch_failed(err.to_string()))?;

    Ok(tokio::spawn(async move {
        let _watcher = watcher;
        while let Some(signal) = rx.recv().await {
            match signal {
                WatchSignal::Changed(path) => {
                    if let Err(err) = plane.load_file(&path).await {
                        tracing::error!(path = %path.display(), error = %err, "failed to apply configuration change");
                    }
                }
                WatchSignal::Removed(path) => {
                    if let Some(config_type) = config_type_of(&path) {
                        if let Err(err) = plane.remove_config(config_type).await {
                            tracing::error!(path = %path.display(), error = %err, "failed to apply configuration removal");
                        }
                    }
                }
            }
        }
    }))
}

fn config_type_of(path: &Path) -> Option<ConfigType> {
    path.file_stem().and_then(|stem| stem.to_str()).and_then(ConfigType::from_file_stem)
}
