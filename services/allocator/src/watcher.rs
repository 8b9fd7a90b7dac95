//! Agent whitelist file watcher.
//!
//! The whitelist file lists one hostname per line. A file containing only
//! `*` allows every agent. The file is re-read periodically and the
//! allocator is told about the new list only when it changed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::allocator::Allocator;

pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Parses whitelist file contents. `None` means every agent is allowed.
pub fn parse_whitelist(content: &str) -> Option<HashSet<String>> {
    if content.trim() == "*" {
        return None;
    }
    Some(
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

async fn read_whitelist(path: &Path) -> Result<Option<HashSet<String>>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read whitelist {}", path.display()))?;
    Ok(parse_whitelist(&content))
}

/// Polls the whitelist file and pushes changes to the allocator.
pub struct WhitelistWatcher {
    path: PathBuf,
    interval: Duration,
    allocator: Arc<dyn Allocator>,
}

impl WhitelistWatcher {
    pub fn new(path: impl Into<PathBuf>, allocator: Arc<dyn Allocator>) -> Self {
        Self {
            path: path.into(),
            interval: DEFAULT_WATCH_INTERVAL,
            allocator,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs until shutdown is signaled or the allocator stops. The file is
    /// read once right away.
    #[instrument(skip(self, shutdown), fields(path = %self.path.display()))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "Starting whitelist watcher");

        let mut current: Option<Option<HashSet<String>>> = None;
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let whitelist = match read_whitelist(&self.path).await {
                        Ok(whitelist) => whitelist,
                        Err(e) => {
                            warn!(error = %e, "Keeping current whitelist");
                            continue;
                        }
                    };
                    if current.as_ref() == Some(&whitelist) {
                        continue;
                    }
                    debug!(hosts = ?whitelist.as_ref().map(HashSet::len), "Whitelist changed");
                    if self.allocator.update_whitelist(whitelist.clone()).is_err() {
                        info!("Allocator stopped, whitelist watcher exiting");
                        break;
                    }
                    current = Some(whitelist);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Whitelist watcher shutting down");
                        break;
                    }
                }
            }
        }
    }
}
