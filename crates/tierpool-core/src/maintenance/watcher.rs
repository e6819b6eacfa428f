//! Filesystem watcher that brings the next reconcile forward.
//!
//! Events are only a hint: the reconciler rescans regardless, so dropped or
//! coalesced events are harmless.

use crate::config::LayoutConfig;
use crate::{Result, TierError};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Watches drive roots and signals `trigger` once changes settle for
/// `debounce`.
pub struct DriveWatcher {
    _watcher: RecommendedWatcher,
    stop: Arc<AtomicBool>,
}

impl DriveWatcher {
    pub fn new(roots: &[PathBuf], debounce: Duration, trigger: Arc<Notify>) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(event_tx)
            .map_err(|e| TierError::Other(format!("Failed to create file watcher: {}", e)))?;

        for root in roots {
            if let Err(e) = watcher.watch(root, RecursiveMode::Recursive) {
                warn!("Failed to watch {}: {}", root.display(), e);
                continue;
            }
            info!("Watching {} for changes", root.display());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let roots = roots.to_vec();

        std::thread::spawn(move || {
            let mut pending_since: Option<Instant> = None;
            loop {
                if stop_flag.load(Ordering::Relaxed) {
                    debug!("Drive watcher stopping");
                    break;
                }
                match event_rx.recv_timeout(debounce.min(Duration::from_millis(500))) {
                    Ok(Ok(event)) => {
                        if is_relevant(&event, &roots) {
                            pending_since = Some(Instant::now());
                        }
                    }
                    Ok(Err(e)) => debug!("Watcher error: {}", e),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        warn!("Drive watcher channel disconnected");
                        break;
                    }
                }
                if pending_since.is_some_and(|t| t.elapsed() >= debounce) {
                    debug!("Drive contents changed, requesting reconcile");
                    trigger.notify_one();
                    pending_since = None;
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            stop,
        })
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for DriveWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Content changes outside the engine's internal directory.
fn is_relevant(event: &Event, roots: &[PathBuf]) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event.paths.iter().any(|p| !is_internal(p, roots))
}

fn is_internal(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| {
        path.strip_prefix(root)
            .ok()
            .and_then(|rel| rel.components().next())
            .is_some_and(|first| first.as_os_str() == LayoutConfig::INTERNAL_DIR)
    })
}
