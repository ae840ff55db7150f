use super::*;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};

// =============================================================================
// MOCK MIRROR
// =============================================================================

#[derive(Default)]
struct MockMirror {
    remote: StdMutex<Option<Vec<Product>>>,
    started: StdMutex<Vec<Vec<Product>>>,
    pushed: StdMutex<Vec<Vec<Product>>>,
    fail_fetch: AtomicBool,
    fail_store: AtomicBool,
    /// When set, each push waits for a permit before completing.
    gate: Option<Arc<Semaphore>>,
}

impl MockMirror {
    fn holding(products: Vec<Product>) -> Self {
        Self { remote: StdMutex::new(Some(products)), ..Self::default() }
    }

    fn gated(gate: Arc<Semaphore>) -> Self {
        Self { gate: Some(gate), ..Self::default() }
    }

    fn pushed(&self) -> Vec<Vec<Product>> {
        self.pushed.lock().unwrap().clone()
    }

    fn started_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl RemoteMirror for MockMirror {
    async fn fetch(&self) -> Result<Vec<Product>, MirrorError> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(MirrorError::Status { status: 503, body: "down".into() });
        }
        self.remote
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| MirrorError::Parse("empty bin".into()))
    }

    async fn store(&self, products: &[Product]) -> Result<(), MirrorError> {
        self.started.lock().unwrap().push(products.to_vec());
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.fail_store.load(Ordering::SeqCst) {
            return Err(MirrorError::Request("connection refused".into()));
        }
        self.pushed.lock().unwrap().push(products.to_vec());
        *self.remote.lock().unwrap() = Some(products.to_vec());
        Ok(())
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn listing(id: &str, title: &str) -> Product {
    Product {
        id: id.into(),
        title: title.into(),
        category: "Motorcycles".into(),
        price: 5000.0,
        featured: false,
        image: format!("https://example.test/{id}.jpg"),
        description: "Test listing".into(),
    }
}

fn local_store(dir: &tempfile::TempDir, channel: Arc<dyn Channel>) -> ProductStore {
    let cache = LocalCache::open(dir.path()).unwrap();
    ProductStore::new(cache, channel, None)
}

fn mirrored_store(dir: &tempfile::TempDir, mirror: Arc<MockMirror>) -> ProductStore {
    let cache = LocalCache::open(dir.path()).unwrap();
    ProductStore::new(cache, Arc::new(MemoryChannel::new()), Some(mirror as Arc<dyn RemoteMirror>))
}

fn counting_subscriber(store: &ProductStore) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    store.subscribe(move || {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    count
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let waited = timeout(Duration::from_secs(2), async {
        while !cond() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

// =============================================================================
// LOCAL READ / WRITE
// =============================================================================

#[test]
fn write_then_read_returns_same_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_store(&dir, Arc::new(MemoryChannel::new()));
    let products = vec![listing("b", "Second"), listing("a", "First")];

    store.write(products.clone());
    assert_eq!(store.read(), products);
}

#[test]
fn read_seeds_defaults_when_cache_missing() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_store(&dir, Arc::new(MemoryChannel::new()));

    assert_eq!(store.read(), default_products());
    assert!(store.cache().get(STORE_KEY).unwrap().is_some());
}

#[test]
fn corrupt_cache_reads_as_defaults_and_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_store(&dir, Arc::new(MemoryChannel::new()));
    store.cache().set(STORE_KEY, "{not json").unwrap();

    assert_eq!(store.read(), default_products());
    let raw = store.cache().get(STORE_KEY).unwrap().unwrap();
    let reparsed: Vec<Product> = serde_json::from_str(&raw).unwrap();
    assert_eq!(reparsed, default_products());
}

#[test]
fn scraped_prices_in_cache_are_normalized_not_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_store(&dir, Arc::new(MemoryChannel::new()));
    let scraped = r#"[{"id":"s1","title":"Scraped","price":"9,500","image":"https://example.test/s.jpg","description":"d"}]"#;
    store.cache().set(STORE_KEY, scraped).unwrap();

    let products = store.read();
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].id, "s1");
    assert!((products[0].price - 9500.0).abs() < f64::EPSILON);

    let raw = store.cache().get(STORE_KEY).unwrap().unwrap();
    let rewritten: Vec<Product> = serde_json::from_str(&raw).unwrap();
    assert_eq!(rewritten, products);
}

#[test]
fn unreadable_cache_reads_as_defaults_without_overwriting() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_store(&dir, Arc::new(MemoryChannel::new()));
    let slot = store.cache().slot_path(STORE_KEY).unwrap();
    std::fs::create_dir(&slot).unwrap();
    std::fs::write(slot.join("keep"), "intact").unwrap();

    assert!(store.cache().get(STORE_KEY).is_err());
    assert_eq!(store.read(), default_products());
    assert!(slot.is_dir());
    assert_eq!(std::fs::read_to_string(slot.join("keep")).unwrap(), "intact");
}

#[test]
fn reset_to_defaults_then_read_returns_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_store(&dir, Arc::new(MemoryChannel::new()));
    store.write(vec![listing("x", "Only")]);

    store.reset_to_defaults();
    assert_eq!(store.read(), default_products());
}

#[test]
fn write_without_runtime_or_mirror_is_fine() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_store(&dir, Arc::new(MemoryChannel::new()));
    store.write(vec![]);
    assert!(store.read().is_empty());
    assert!(store.is_sync_idle());
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

#[tokio::test]
async fn other_context_gets_exactly_one_notification_per_write() {
    let dir = tempfile::tempdir().unwrap();
    let channel: Arc<dyn Channel> = Arc::new(MemoryChannel::new());
    let a = local_store(&dir, Arc::clone(&channel));
    let b = local_store(&dir, Arc::clone(&channel));
    let tasks_a = a.start(Duration::from_secs(30));
    let tasks_b = b.start(Duration::from_secs(30));
    let seen_by_a = counting_subscriber(&a);
    let seen_by_b = counting_subscriber(&b);

    a.write(vec![listing("n", "New")]);

    wait_until("notification in context B", || seen_by_b.load(Ordering::SeqCst) == 1).await;
    sleep(Duration::from_millis(80)).await;
    assert_eq!(seen_by_b.load(Ordering::SeqCst), 1);
    assert_eq!(seen_by_a.load(Ordering::SeqCst), 0, "a context never notifies itself");
    assert_eq!(b.read(), vec![listing("n", "New")]);

    tasks_a.abort();
    tasks_b.abort();
}

#[tokio::test]
async fn every_subscriber_is_called_once() {
    let dir = tempfile::tempdir().unwrap();
    let channel: Arc<dyn Channel> = Arc::new(MemoryChannel::new());
    let a = local_store(&dir, Arc::clone(&channel));
    let b = local_store(&dir, Arc::clone(&channel));
    let tasks = b.start(Duration::from_secs(30));
    let first = counting_subscriber(&b);
    let second = counting_subscriber(&b);

    a.write(vec![]);

    wait_until("both subscribers", || {
        first.load(Ordering::SeqCst) == 1 && second.load(Ordering::SeqCst) == 1
    })
    .await;
    tasks.abort();
}

#[tokio::test]
async fn unknown_tags_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let channel: Arc<dyn Channel> = Arc::new(MemoryChannel::new());
    let store = local_store(&dir, Arc::clone(&channel));
    let tasks = store.start(Duration::from_secs(30));
    let seen = counting_subscriber(&store);

    channel
        .post(Envelope { origin: Uuid::new_v4(), tag: "reload-everything".into() })
        .unwrap();
    sleep(Duration::from_millis(80)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 0);

    channel.post(Envelope::new(Uuid::new_v4(), Signal::CloudSynced)).unwrap();
    wait_until("cloud-synced notification", || seen.load(Ordering::SeqCst) == 1).await;
    tasks.abort();
}

#[tokio::test]
async fn unsubscribe_stops_notifications() {
    let dir = tempfile::tempdir().unwrap();
    let channel: Arc<dyn Channel> = Arc::new(MemoryChannel::new());
    let a = local_store(&dir, Arc::clone(&channel));
    let b = local_store(&dir, Arc::clone(&channel));
    let tasks = b.start(Duration::from_secs(30));

    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let id = b.subscribe(move || {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    assert!(b.unsubscribe(id));
    assert!(!b.unsubscribe(id));

    a.write(vec![]);
    sleep(Duration::from_millis(80)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
    tasks.abort();
}

#[tokio::test]
async fn file_channel_carries_writes_between_stores() {
    let dir = tempfile::tempdir().unwrap();
    let poll = Duration::from_millis(10);
    let a = local_store(&dir, Arc::new(FileChannel::new(dir.path(), CHANNEL_NAME, poll)));
    let b = local_store(&dir, Arc::new(FileChannel::new(dir.path(), CHANNEL_NAME, poll)));
    let tasks = b.start(Duration::from_secs(30));
    let seen = counting_subscriber(&b);

    a.write(vec![listing("f", "Via file")]);

    wait_until("file channel notification", || seen.load(Ordering::SeqCst) == 1).await;
    assert_eq!(b.read()[0].title, "Via file");
    tasks.abort();
}

// =============================================================================
// MIRROR SYNC
// =============================================================================

#[tokio::test]
async fn back_to_back_writes_push_only_the_last_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = Arc::new(MockMirror::default());
    let store = mirrored_store(&dir, Arc::clone(&mirror));
    let first = vec![listing("1", "First")];
    let second = vec![listing("2", "Second")];

    store.write(first);
    store.write(second.clone());

    wait_until("sync idle", || store.is_sync_idle()).await;
    assert_eq!(mirror.pushed(), vec![second]);
}

#[tokio::test]
async fn writes_during_in_flight_push_coalesce_to_latest() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let mirror = Arc::new(MockMirror::gated(Arc::clone(&gate)));
    let store = mirrored_store(&dir, Arc::clone(&mirror));
    let a = vec![listing("a", "A")];
    let b = vec![listing("b", "B")];
    let c = vec![listing("c", "C")];

    store.write(a.clone());
    wait_until("first push in flight", || mirror.started_count() == 1).await;

    store.write(b);
    store.write(c.clone());
    gate.add_permits(10);

    wait_until("sync idle", || store.is_sync_idle()).await;
    assert_eq!(mirror.pushed(), vec![a, c.clone()]);
    assert_eq!(store.read(), c);
}

#[tokio::test]
async fn failed_push_leaves_local_cache_intact() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = Arc::new(MockMirror::default());
    mirror.fail_store.store(true, Ordering::SeqCst);
    let store = mirrored_store(&dir, Arc::clone(&mirror));
    let mut status = store.status();
    let written = vec![listing("w", "Written")];

    store.write(written.clone());

    wait_until("push attempted", || mirror.started_count() == 1).await;
    wait_until("sync idle", || store.is_sync_idle()).await;
    assert_eq!(store.read(), written);
    assert!(mirror.pushed().is_empty());
    assert!(matches!(&*status.borrow_and_update(), SyncStatus::Error(_)));
}

#[tokio::test]
async fn write_to_remote_posts_cloud_synced() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = Arc::new(MockMirror::default());
    let channel = MemoryChannel::new();
    let mut rx = channel.listen();
    let cache = LocalCache::open(dir.path()).unwrap();
    let store = ProductStore::new(cache, Arc::new(channel), Some(mirror.clone() as Arc<dyn RemoteMirror>));

    store.write_to_remote(&default_products()).await.unwrap();

    let envelope = timeout(Duration::from_millis(200), rx.recv()).await.unwrap().unwrap();
    assert_eq!(envelope.signal(), Some(Signal::CloudSynced));
    assert_eq!(envelope.origin, store.context_id());
    assert_eq!(mirror.pushed(), vec![default_products()]);
    assert_eq!(*store.status().borrow(), SyncStatus::Success("Saved to cloud".into()));
}

#[tokio::test]
async fn write_to_remote_surfaces_error_without_touching_cache() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = Arc::new(MockMirror::default());
    mirror.fail_store.store(true, Ordering::SeqCst);
    let store = mirrored_store(&dir, Arc::clone(&mirror));
    store.cache().set(STORE_KEY, "[]").unwrap();

    let result = store.write_to_remote(&default_products()).await;
    assert!(matches!(result, Err(MirrorError::Request(_))));
    assert!(store.read().is_empty());
}

#[tokio::test]
async fn write_to_remote_without_mirror_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_store(&dir, Arc::new(MemoryChannel::new()));
    assert!(store.write_to_remote(&default_products()).await.is_ok());
    assert_eq!(*store.status().borrow(), SyncStatus::Idle);
}

#[tokio::test]
async fn read_from_remote_overwrites_cache_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let remote = vec![listing("r", "Remote")];
    let mirror = Arc::new(MockMirror::holding(remote.clone()));
    let store = mirrored_store(&dir, mirror);
    store.cache().set(STORE_KEY, "[]").unwrap();

    assert_eq!(store.read_from_remote().await, remote);
    assert_eq!(store.read(), remote);
}

#[tokio::test]
async fn read_from_remote_failure_returns_local_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = Arc::new(MockMirror::holding(vec![listing("r", "Remote")]));
    mirror.fail_fetch.store(true, Ordering::SeqCst);
    let store = mirrored_store(&dir, mirror);
    let local = vec![listing("l", "Local")];
    let encoded = serde_json::to_string(&local).unwrap();
    store.cache().set(STORE_KEY, &encoded).unwrap();

    assert_eq!(store.read_from_remote().await, local);
    assert_eq!(store.cache().get(STORE_KEY).unwrap().as_deref(), Some(encoded.as_str()));
    assert_eq!(
        *store.status().borrow(),
        SyncStatus::Error("Using local data (cloud unavailable)".into())
    );
}

#[tokio::test]
async fn read_from_remote_failure_without_cache_returns_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = Arc::new(MockMirror::default());
    mirror.fail_fetch.store(true, Ordering::SeqCst);
    let store = mirrored_store(&dir, mirror);

    assert_eq!(store.read_from_remote().await, default_products());
    assert!(store.cache().get(STORE_KEY).unwrap().is_none());
}

#[tokio::test]
async fn read_without_cache_schedules_background_refresh() {
    let dir = tempfile::tempdir().unwrap();
    let remote = vec![listing("r", "Remote")];
    let mirror = Arc::new(MockMirror::holding(remote.clone()));
    let store = mirrored_store(&dir, mirror);
    let seen = counting_subscriber(&store);

    assert_eq!(store.read(), default_products());

    wait_until("background refresh", || seen.load(Ordering::SeqCst) == 1).await;
    assert_eq!(store.read(), remote);
}

#[tokio::test]
async fn seeding_refresh_keeps_sync_busy_until_it_lands() {
    let dir = tempfile::tempdir().unwrap();
    let remote = vec![listing("r", "Remote")];
    let mirror = Arc::new(MockMirror::holding(remote.clone()));
    let store = mirrored_store(&dir, mirror);

    assert_eq!(store.read(), default_products());
    assert!(!store.is_sync_idle());

    wait_until("sync idle", || store.is_sync_idle()).await;
    assert_eq!(store.read(), remote);
}

#[tokio::test]
async fn refresh_notifies_local_subscribers_even_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = Arc::new(MockMirror::default());
    mirror.fail_fetch.store(true, Ordering::SeqCst);
    let store = mirrored_store(&dir, mirror);
    let seen = counting_subscriber(&store);

    store.refresh().await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn refresh_task_pulls_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let remote = vec![listing("r", "Remote")];
    let mirror = Arc::new(MockMirror::holding(remote.clone()));
    let store = mirrored_store(&dir, mirror);
    store.cache().set(STORE_KEY, "[]").unwrap();

    let tasks = store.start(Duration::from_secs(3600));
    assert!(tasks.refresh.is_some());
    wait_until("first refresh", || store.read() == remote).await;
    tasks.abort();
}
