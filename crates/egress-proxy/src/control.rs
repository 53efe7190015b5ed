//! Blacklist control plane.
//!
//! The controller keeps the live [`Blacklist`] in step with a
//! [`BlacklistStore`]. Writes go to the store first and are then published as
//! a new snapshot; a background poller picks up changes made by other
//! processes (the `egress block` subcommands, for instance).
//!
//! ```text
//! CLI / API ──add/remove──▶ Store ──revision──▶ poll() ──▶ Blacklist (live)
//!                                                              │
//!                                               sessions read snapshots
//! ```

use std::sync::Arc;
use std::time::Duration;

use egress_core::{Blacklist, BlacklistSnapshot, BlacklistStore, HostPattern};
use parking_lot::Mutex;

use crate::error::Result;
use crate::events::{EngineEvent, EventBus};

/// Default interval between store revision checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Owns the store handle and keeps the live blacklist current.
pub struct BlacklistController {
    store: Arc<dyn BlacklistStore>,
    blacklist: Arc<Blacklist>,
    events: EventBus,
    /// Store revision the live snapshot was built from.
    last_revision: Mutex<Option<u64>>,
    poll_interval: Duration,
}

impl std::fmt::Debug for BlacklistController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlacklistController")
            .field("patterns", &self.blacklist.len())
            .field("last_revision", &*self.last_revision.lock())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl BlacklistController {
    /// Creates a controller. Call [`reload`](Self::reload) to load the store.
    pub fn new(store: Arc<dyn BlacklistStore>, blacklist: Arc<Blacklist>, events: EventBus) -> Self {
        Self {
            store,
            blacklist,
            events,
            last_revision: Mutex::new(None),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sets how often [`start_polling`](Self::start_polling) checks the store.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The live blacklist this controller publishes to.
    pub fn blacklist(&self) -> &Arc<Blacklist> {
        &self.blacklist
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Replaces the live snapshot with the store's contents.
    ///
    /// On failure the current snapshot stays live.
    pub fn reload(&self) -> Result<usize> {
        // Read the revision first so a write racing the load is seen by the
        // next poll rather than lost.
        let loaded = self
            .store
            .revision()
            .and_then(|revision| Ok((revision, self.store.reload()?)));

        let (revision, patterns) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!(error = %e, patterns = self.blacklist.len(), "blacklist reload failed, keeping current snapshot");
                self.events.publish(EngineEvent::BlacklistReloadFailed {
                    error: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let count = patterns.len();
        self.blacklist.replace(BlacklistSnapshot::from_patterns(patterns));
        *self.last_revision.lock() = revision;

        tracing::info!(patterns = count, ?revision, "blacklist loaded");
        self.events.publish(EngineEvent::BlacklistReloaded {
            patterns: count,
            revision,
        });
        Ok(count)
    }

    /// Blocks `pattern`. Returns false if it was already blocked.
    pub fn add(&self, pattern: &HostPattern) -> Result<bool> {
        let added = self.write_through(self.store.add(pattern))?;
        if added {
            let snapshot = self.blacklist.update(|current| current.with(pattern.clone()));
            tracing::info!(pattern = %pattern.as_str(), patterns = snapshot.len(), "host blocked");
            self.publish_current(snapshot.len());
        }
        Ok(added)
    }

    /// Unblocks `pattern`. Returns false if it was not blocked.
    pub fn remove(&self, pattern: &HostPattern) -> Result<bool> {
        let removed = self.write_through(self.store.remove(pattern))?;
        if removed {
            let snapshot = self.blacklist.update(|current| current.without(pattern));
            tracing::info!(pattern = %pattern.as_str(), patterns = snapshot.len(), "host unblocked");
            self.publish_current(snapshot.len());
        }
        Ok(removed)
    }

    /// Reloads if the store changed since the last load.
    ///
    /// Returns true if a new snapshot was published.
    pub fn poll(&self) -> bool {
        let current = match self.store.revision() {
            Ok(revision) => revision,
            Err(e) => {
                tracing::warn!(error = %e, "failed to check blacklist revision");
                return false;
            }
        };

        let last = *self.last_revision.lock();
        // Without a revision there is no cheap change check.
        if current.is_some() && current == last {
            return false;
        }

        tracing::debug!(?last, ?current, "blacklist store changed");
        self.reload().is_ok()
    }

    /// Creates a background polling task.
    ///
    /// Returns a future that should be spawned on the runtime.
    pub fn start_polling(self: Arc<Self>) -> impl std::future::Future<Output = ()> + Send {
        let controller = self;
        async move {
            loop {
                tokio::time::sleep(controller.poll_interval).await;
                controller.poll();
            }
        }
    }

    fn write_through(&self, result: egress_core::StoreResult<bool>) -> Result<bool> {
        result.map_err(|e| {
            tracing::warn!(error = %e, "blacklist store write failed");
            self.events.publish(EngineEvent::BlacklistReloadFailed {
                error: e.to_string(),
            });
            e.into()
        })
    }

    fn publish_current(&self, patterns: usize) {
        // Our own write bumped the revision; record it so the poller does
        // not reload for it.
        match self.store.revision() {
            Ok(revision) => {
                *self.last_revision.lock() = revision;
                self.events.publish(EngineEvent::BlacklistReloaded { patterns, revision });
            }
            Err(e) => {
                tracing::debug!(error = %e, "could not read revision after write");
                self.events.publish(EngineEvent::BlacklistReloaded {
                    patterns,
                    revision: None,
                });
            }
        }
    }
}
