//! Product store: single source of truth for the product collection.
//!
//! DESIGN
//! ======
//! One `ProductStore` is built per process and cloned into consumers; all
//! clones share the same context. Reads and writes hit the local cache
//! synchronously. Each write then posts `updated` on the channel and parks
//! the snapshot on the coalescing sync queue, whose drainer pushes it to
//! the mirror in the background.
//!
//! Subscribers hear about changes made elsewhere: channel messages from
//! other contexts, and completed background refreshes. A context never
//! notifies itself through the channel.
//!
//! ERROR HANDLING
//! ==============
//! `read` and `write` never fail. A missing or corrupt cache is seeded with
//! the default set. An unreadable cache also reads as the default set but is
//! left alone, since the slot may still hold good data. Records with scraped
//! string prices are normalized in place rather than treated as corrupt.
//! Mirror failures only degrade to local-only operation plus an error status.
//!
//! KNOWN RACE
//! ==========
//! There is no version check between the cache and the mirror. A
//! `read_from_remote` that started before a local `write` can finish after
//! it and overwrite the cache with the older mirror copy. The next write or
//! refresh converges; concurrent writers across contexts are last-write-wins
//! on the mirror.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheError, LocalCache};
use crate::channel::{CHANNEL_NAME, Channel, Envelope, FileChannel, MemoryChannel, Signal};
use crate::config::{ChannelKind, StoreConfig};
use crate::product::{Product, decode_collection, default_products};
use crate::remote::{HttpMirror, MirrorError, RemoteMirror};
use crate::sync::{SyncQueue, SyncStatus, spawn_refresh_task};

/// Cache slot holding the JSON-encoded collection.
pub const STORE_KEY: &str = "acme_garage_products";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Mirror(#[from] MirrorError),
}

// =============================================================================
// SUBSCRIBERS
// =============================================================================

/// Handle returned by [`ProductStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(SubscriptionId, Callback)>>,
}

impl Subscribers {
    fn add(&self, callback: Callback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, callback));
        id
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() < before
    }

    /// Invoke every callback once. Callbacks run outside the lock so they
    /// may read the store or (un)subscribe.
    fn notify(&self) {
        let snapshot: Vec<Callback> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in snapshot {
            callback();
        }
    }
}

// =============================================================================
// STORE
// =============================================================================

struct StoreInner {
    context_id: Uuid,
    cache: LocalCache,
    channel: Arc<dyn Channel>,
    mirror: Option<Arc<dyn RemoteMirror>>,
    subscribers: Subscribers,
    sync: SyncQueue,
    /// Background refreshes spawned by `read` that have not finished.
    refreshing: AtomicUsize,
    status: watch::Sender<SyncStatus>,
}

/// Result of reading the cache slot.
enum Loaded {
    Hit(Vec<Product>),
    /// Absent or corrupt; safe to seed.
    Missing,
    /// I/O failure; the slot may still hold good data.
    Unreadable,
}

/// Shared handle to one store context. Clones share state.
#[derive(Clone)]
pub struct ProductStore {
    inner: Arc<StoreInner>,
}

/// Background tasks started by [`ProductStore::start`].
pub struct StoreTasks {
    pub listener: JoinHandle<()>,
    /// `None` when the store runs without a mirror.
    pub refresh: Option<JoinHandle<()>>,
}

impl StoreTasks {
    pub fn abort(&self) {
        self.listener.abort();
        if let Some(refresh) = &self.refresh {
            refresh.abort();
        }
    }
}

impl ProductStore {
    #[must_use]
    pub fn new(cache: LocalCache, channel: Arc<dyn Channel>, mirror: Option<Arc<dyn RemoteMirror>>) -> Self {
        let (status, _) = watch::channel(SyncStatus::Idle);
        Self {
            inner: Arc::new(StoreInner {
                context_id: Uuid::new_v4(),
                cache,
                channel,
                mirror,
                subscribers: Subscribers::default(),
                sync: SyncQueue::new(),
                refreshing: AtomicUsize::new(0),
                status,
            }),
        }
    }

    /// Build a store from configuration: cache directory, channel transport
    /// and (optionally) the HTTP mirror.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the cache directory cannot be created or
    /// the HTTP client cannot be built.
    pub fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        let cache = LocalCache::open(&config.data_dir)?;
        let channel: Arc<dyn Channel> = match config.channel {
            ChannelKind::File => Arc::new(FileChannel::new(cache.dir(), CHANNEL_NAME, config.channel_poll)),
            ChannelKind::Memory => Arc::new(MemoryChannel::new()),
        };
        let mirror = match &config.mirror {
            Some(mirror) => {
                let http = HttpMirror::new(mirror)?;
                info!(url = http.url(), "remote mirror enabled");
                Some(Arc::new(http) as Arc<dyn RemoteMirror>)
            }
            None => {
                info!("no remote mirror configured; running local-only");
                None
            }
        };
        Ok(Self::new(cache, channel, mirror))
    }

    #[must_use]
    pub fn context_id(&self) -> Uuid {
        self.inner.context_id
    }

    #[must_use]
    pub fn cache(&self) -> &LocalCache {
        &self.inner.cache
    }

    #[must_use]
    pub fn has_mirror(&self) -> bool {
        self.inner.mirror.is_some()
    }

    /// Watch the transient sync status.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    // -------------------------------------------------------------------------
    // Local reads and writes
    // -------------------------------------------------------------------------

    /// Current snapshot of the local cache.
    ///
    /// A missing or corrupt cache is replaced by the default set and, when a
    /// mirror is configured, a background refresh is scheduled. An unreadable
    /// cache returns the default set without writing or refreshing.
    #[must_use]
    pub fn read(&self) -> Vec<Product> {
        match self.load() {
            Loaded::Hit(products) => products,
            Loaded::Missing => {
                let defaults = default_products();
                self.store_local(&defaults);
                self.refresh_in_background();
                defaults
            }
            Loaded::Unreadable => default_products(),
        }
    }

    /// Replace the collection, notify other contexts, and queue a mirror push.
    pub fn write(&self, products: Vec<Product>) {
        self.store_local(&products);
        self.post(Signal::Updated);
        self.queue_push(products);
    }

    /// Equivalent to writing the default set.
    pub fn reset_to_defaults(&self) {
        self.write(default_products());
    }

    /// Parsed cache contents; `None` when missing, corrupt or unreadable.
    fn cached(&self) -> Option<Vec<Product>> {
        match self.load() {
            Loaded::Hit(products) => Some(products),
            Loaded::Missing | Loaded::Unreadable => None,
        }
    }

    /// Read and decode the cache slot. A slot that only decodes leniently is
    /// rewritten so ids minted during normalization stay put.
    fn load(&self) -> Loaded {
        let raw = match self.inner.cache.get(STORE_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("no local product cache; seeding defaults");
                return Loaded::Missing;
            }
            Err(e) => {
                error!(error = %e, "local product cache unreadable; using defaults without overwriting");
                return Loaded::Unreadable;
            }
        };
        match serde_json::from_str::<serde_json::Value>(&raw).and_then(|value| decode_collection(&value)) {
            Ok((products, false)) => Loaded::Hit(products),
            Ok((products, true)) => {
                info!(count = products.len(), "local product cache normalized");
                self.store_local(&products);
                Loaded::Hit(products)
            }
            Err(e) => {
                warn!(error = %e, "local product cache is corrupt; using defaults");
                Loaded::Missing
            }
        }
    }

    fn store_local(&self, products: &[Product]) {
        let encoded = match serde_json::to_string(products) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(error = %e, "product encode failed; cache not updated");
                return;
            }
        };
        if let Err(e) = self.inner.cache.set(STORE_KEY, &encoded) {
            error!(error = %e, count = products.len(), "local product cache write failed");
        }
    }

    fn post(&self, signal: Signal) {
        if let Err(e) = self.inner.channel.post(Envelope::new(self.inner.context_id, signal)) {
            warn!(error = %e, tag = signal.as_tag(), "channel post failed");
        }
    }

    fn set_status(&self, status: SyncStatus) {
        self.inner.status.send_replace(status);
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Register `callback` for changes made by other contexts and for
    /// completed background refreshes.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.subscribers.add(Arc::new(callback))
    }

    /// Remove a callback. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.remove(id)
    }

    /// Start the channel listener and, with a mirror, the periodic refresh.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(&self, refresh_every: Duration) -> StoreTasks {
        let rx = self.inner.channel.listen();
        let listener = tokio::spawn(run_listener(self.clone(), rx));
        let refresh = self
            .has_mirror()
            .then(|| spawn_refresh_task(self.clone(), refresh_every));
        StoreTasks { listener, refresh }
    }

    fn on_envelope(&self, envelope: &Envelope) {
        if envelope.origin == self.inner.context_id {
            return;
        }
        match envelope.signal() {
            Some(signal) => {
                debug!(tag = signal.as_tag(), origin = %envelope.origin, "change from another context");
                self.inner.subscribers.notify();
            }
            None => debug!(tag = %envelope.tag, "ignoring unknown channel tag"),
        }
    }

    // -------------------------------------------------------------------------
    // Mirror
    // -------------------------------------------------------------------------

    /// Fetch the collection from the mirror and cache it.
    ///
    /// On failure the cache is left untouched and the local snapshot (or the
    /// default set when there is none) is returned. Without a mirror this is
    /// a plain [`read`](Self::read).
    pub async fn read_from_remote(&self) -> Vec<Product> {
        let Some(mirror) = self.inner.mirror.clone() else {
            return self.read();
        };

        self.set_status(SyncStatus::Syncing("Loading products from cloud...".into()));
        match mirror.fetch().await {
            Ok(products) => {
                if self.cached().as_deref() != Some(products.as_slice()) {
                    self.store_local(&products);
                    self.post(Signal::Updated);
                }
                info!(count = products.len(), "products loaded from mirror");
                self.set_status(SyncStatus::Success("Products loaded from cloud".into()));
                products
            }
            Err(e) => {
                warn!(error = %e, retryable = e.retryable(), "mirror read failed; using local data");
                self.set_status(SyncStatus::Error("Using local data (cloud unavailable)".into()));
                self.cached().unwrap_or_else(default_products)
            }
        }
    }

    /// Push a snapshot to the mirror now, bypassing the queue.
    ///
    /// Local state is never touched. Without a mirror this is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the [`MirrorError`] from the push; it has already been logged
    /// and reflected in the sync status.
    pub async fn write_to_remote(&self, products: &[Product]) -> Result<(), MirrorError> {
        let Some(mirror) = self.inner.mirror.clone() else {
            return Ok(());
        };

        self.set_status(SyncStatus::Syncing("Saving to cloud...".into()));
        match mirror.store(products).await {
            Ok(()) => {
                info!(count = products.len(), "products saved to mirror");
                self.set_status(SyncStatus::Success("Saved to cloud".into()));
                self.post(Signal::CloudSynced);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, count = products.len(), "mirror save failed; kept locally");
                self.set_status(SyncStatus::Error("Cloud save failed (saved locally)".into()));
                Err(e)
            }
        }
    }

    /// One background refresh cycle: pull the mirror, then notify local
    /// subscribers whether or not the pull succeeded.
    pub async fn refresh(&self) {
        let products = self.read_from_remote().await;
        debug!(count = products.len(), "background refresh complete");
        self.inner.subscribers.notify();
    }

    fn refresh_in_background(&self) {
        if !self.has_mirror() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.clone();
                self.inner.refreshing.fetch_add(1, Ordering::SeqCst);
                handle.spawn(async move {
                    store.refresh().await;
                    store.inner.refreshing.fetch_sub(1, Ordering::SeqCst);
                });
            }
            Err(_) => debug!("no tokio runtime; skipping background refresh"),
        }
    }

    fn queue_push(&self, snapshot: Vec<Product>) {
        if !self.has_mirror() || !self.inner.sync.enqueue(snapshot) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.clone();
                handle.spawn(async move { store.drain_pushes().await });
            }
            Err(_) => {
                warn!("no tokio runtime; mirror push dropped");
                self.inner.sync.abandon();
            }
        }
    }

    async fn drain_pushes(&self) {
        while let Some(snapshot) = self.inner.sync.next() {
            if let Err(e) = self.write_to_remote(&snapshot).await {
                debug!(error = %e, "queued mirror push failed; next write or refresh supersedes it");
            }
        }
    }

    /// Whether no mirror push is running or pending and no refresh started
    /// by [`read`](Self::read) is still in flight.
    #[must_use]
    pub fn is_sync_idle(&self) -> bool {
        self.inner.sync.is_idle() && self.inner.refreshing.load(Ordering::SeqCst) == 0
    }
}

async fn run_listener(store: ProductStore, mut rx: broadcast::Receiver<Envelope>) {
    loop {
        match rx.recv().await {
            Ok(envelope) => store.on_envelope(&envelope),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Missed messages collapse into one notification.
                warn!(skipped, "channel listener lagged");
                store.inner.subscribers.notify();
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("channel closed; listener stopping");
                break;
            }
        }
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
