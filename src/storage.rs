//! String-keyed persistence media shared by every favorites view.
//!
//! A medium stores plain string values under string keys and announces each
//! write to the *other* views attached to it. [`MemoryStore`] lives only as
//! long as the process; [`FileStore`] keeps a JSON object on disk and can poll
//! it for writes made by other processes.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::StorageError;

/// Identifies the view that caused a write so it is not echoed back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewId(u64);

static NEXT_VIEW: AtomicU64 = AtomicU64::new(1);

impl ViewId {
    /// Writes nobody in this process made (another process, manual edits).
    pub const EXTERNAL: ViewId = ViewId(0);

    pub fn next() -> Self {
        ViewId(NEXT_VIEW.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
    pub origin: ViewId,
}

pub type ChangeListener = Arc<dyn Fn(&StorageEvent) + Send + Sync>;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str, origin: ViewId) -> Result<(), StorageError>;
    fn remove(&self, key: &str, origin: ViewId) -> Result<(), StorageError>;

    /// Registers `listener` for writes made by any view other than `view`.
    ///
    /// Listeners run while the store serializes writes, in write order, and
    /// must not write back to the same store.
    fn on_change(&self, view: ViewId, listener: ChangeListener) -> Subscription;
}

/// Listener registry shared by the store implementations.
#[derive(Default)]
pub struct ChangeHub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, ViewId, ChangeListener)>>,
}

impl HubInner {
    fn listeners(&self) -> MutexGuard<'_, Vec<(u64, ViewId, ChangeListener)>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ChangeHub {
    pub fn subscribe(&self, view: ViewId, listener: ChangeListener) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners().push((id, view, listener));
        Subscription {
            id,
            hub: Arc::downgrade(&self.inner),
        }
    }

    pub fn notify(&self, event: &StorageEvent) {
        // Listeners run outside the lock so they may subscribe or unsubscribe.
        let targets: Vec<ChangeListener> = self
            .inner
            .listeners()
            .iter()
            .filter(|(_, view, _)| *view != event.origin)
            .map(|(_, _, l)| l.clone())
            .collect();
        debug!(key = %event.key, listeners = targets.len(), "Dispatching storage event");
        for listener in targets {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners().len()
    }
}

/// Handle returned by [`KeyValueStore::on_change`]; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.listeners().retain(|(id, _, _)| *id != self.id);
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
    write_lock: Mutex<()>,
    hub: ChangeHub,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str, origin: ViewId) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        self.hub.notify(&StorageEvent {
            key: key.to_string(),
            new_value: Some(value.to_string()),
            origin,
        });
        Ok(())
    }

    fn remove(&self, key: &str, origin: ViewId) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let removed = self
            .values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        if removed.is_some() {
            self.hub.notify(&StorageEvent {
                key: key.to_string(),
                new_value: None,
                origin,
            });
        }
        Ok(())
    }

    fn on_change(&self, view: ViewId, listener: ChangeListener) -> Subscription {
        self.hub.subscribe(view, listener)
    }
}

/// JSON-object file medium. Every write replaces the file atomically.
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
    last_seen: Mutex<HashMap<String, String>>,
    hub: ChangeHub,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let initial = match read_map(&path) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %path.display(), "Store file unreadable, starting empty: {}", e);
                HashMap::new()
            }
        };
        info!(path = %path.display(), keys = initial.len(), "Opened file store");
        Self {
            path,
            write_lock: Mutex::new(()),
            last_seen: Mutex::new(initial),
            hub: ChangeHub::default(),
        }
    }

    /// Polls the file and announces keys changed by other processes.
    /// The task ends once the store is dropped.
    pub fn spawn_watcher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    debug!("File store dropped, stopping watcher");
                    return;
                };
                store.poll_external_changes();
            }
        })
    }

    /// Compares the file against the last known contents and notifies every
    /// view about keys that differ. Returns the number of changed keys.
    pub fn poll_external_changes(&self) -> usize {
        // Holding the write lock keeps a local write from landing between
        // the read and the snapshot swap.
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = match read_map(&self.path) {
            Ok(map) => map,
            Err(e) => {
                debug!(path = %self.path.display(), "Skipping poll of unreadable store: {}", e);
                return 0;
            }
        };

        let events = {
            let mut last = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
            let events = diff_maps(&last, &current);
            *last = current;
            events
        };

        for event in &events {
            info!(key = %event.key, "Store key changed outside this process");
            self.hub.notify(event);
        }
        events.len()
    }

    fn write_map(&self, map: &HashMap<String, String>) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec_pretty(map)?;
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let file_name = self.path.file_name().ok_or_else(|| {
            StorageError::Unavailable(format!("{} is not a file path", self.path.display()))
        })?;
        let tmp = dir.join(format!(".{}.tmp", file_name.to_string_lossy()));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn update<F>(&self, key: &str, origin: ViewId, apply: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut HashMap<String, String>) -> Option<String>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut map = match read_map(&self.path) {
            Ok(map) => map,
            Err(StorageError::Serialize(e)) => {
                warn!(path = %self.path.display(), "Replacing corrupt store file: {}", e);
                HashMap::new()
            }
            Err(e) => return Err(e),
        };
        let new_value = apply(&mut map);
        self.write_map(&map)?;
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = map;
        // Notified under the lock so views see events in file-write order.
        self.hub.notify(&StorageEvent {
            key: key.to_string(),
            new_value,
            origin,
        });
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(read_map(&self.path)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str, origin: ViewId) -> Result<(), StorageError> {
        self.update(key, origin, |map| {
            map.insert(key.to_string(), value.to_string());
            Some(value.to_string())
        })
    }

    fn remove(&self, key: &str, origin: ViewId) -> Result<(), StorageError> {
        self.update(key, origin, |map| {
            map.remove(key);
            None
        })
    }

    fn on_change(&self, view: ViewId, listener: ChangeListener) -> Subscription {
        self.hub.subscribe(view, listener)
    }
}

fn read_map(path: &Path) -> Result<HashMap<String, String>, StorageError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(HashMap::new());
    }
    Ok(serde_json::from_slice(&bytes)?)
}

fn diff_maps(
    before: &HashMap<String, String>,
    after: &HashMap<String, String>,
) -> Vec<StorageEvent> {
    let mut events: Vec<StorageEvent> = after
        .iter()
        .filter(|(k, v)| before.get(*k) != Some(*v))
        .map(|(k, v)| StorageEvent {
            key: k.clone(),
            new_value: Some(v.clone()),
            origin: ViewId::EXTERNAL,
        })
        .collect();
    events.extend(
        before
            .keys()
            .filter(|k| !after.contains_key(*k))
            .map(|k| StorageEvent {
                key: k.clone(),
                new_value: None,
                origin: ViewId::EXTERNAL,
            }),
    );
    events.sort_by(|a, b| a.key.cmp(&b.key));
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (ChangeListener, Arc<Mutex<Vec<StorageEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: ChangeListener = Arc::new(move |e: &StorageEvent| {
            sink.lock().unwrap().push(e.clone());
        });
        (listener, seen)
    }

    #[test]
    fn memory_store_notifies_other_views_only() {
        let store = MemoryStore::new();
        let writer = ViewId::next();
        let reader = ViewId::next();
        let (own, own_seen) = recorder();
        let (other, other_seen) = recorder();
        let _a = store.on_change(writer, own);
        let _b = store.on_change(reader, other);

        store.set("favorites", "[\"1\"]", writer).unwrap();

        assert!(own_seen.lock().unwrap().is_empty());
        let events = other_seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "favorites");
        assert_eq!(events[0].new_value.as_deref(), Some("[\"1\"]"));
        assert_eq!(events[0].origin, writer);
    }

    #[test]
    fn unsubscribe_and_drop_remove_listeners() {
        let store = MemoryStore::new();
        let (l1, seen1) = recorder();
        let (l2, _seen2) = recorder();
        let s1 = store.on_change(ViewId::next(), l1);
        let s2 = store.on_change(ViewId::next(), l2);
        assert_eq!(store.hub.listener_count(), 2);

        s1.unsubscribe();
        drop(s2);
        assert_eq!(store.hub.listener_count(), 0);

        store.set("k", "v", ViewId::EXTERNAL).unwrap();
        assert!(seen1.lock().unwrap().is_empty());
    }

    #[test]
    fn remove_of_missing_key_is_silent() {
        let store = MemoryStore::new();
        let (l, seen) = recorder();
        let _s = store.on_change(ViewId::next(), l);
        store.remove("absent", ViewId::EXTERNAL).unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn file_store_round_trips_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");
        let store = FileStore::open(&path);
        assert_eq!(store.get("favorites").unwrap(), None);

        store.set("favorites", "[\"27205\"]", ViewId::next()).unwrap();
        assert_eq!(
            store.get("favorites").unwrap().as_deref(),
            Some("[\"27205\"]")
        );

        let reopened = FileStore::open(&path);
        assert_eq!(
            reopened.get("favorites").unwrap().as_deref(),
            Some("[\"27205\"]")
        );
        assert!(!dir.path().join("nested").join(".store.json.tmp").exists());
    }

    #[test]
    fn file_store_reports_corrupt_file_and_replaces_it_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "not json").unwrap();

        let store = FileStore::open(&path);
        assert!(matches!(
            store.get("favorites"),
            Err(StorageError::Serialize(_))
        ));

        store.set("favorites", "[]", ViewId::next()).unwrap();
        assert_eq!(store.get("favorites").unwrap().as_deref(), Some("[]"));
    }

    #[test]
    fn poll_detects_out_of_band_writes_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = FileStore::open(&path);
        let view = ViewId::next();
        let (l, seen) = recorder();
        let _s = store.on_change(view, l);

        store.set("favorites", "[\"1\"]", view).unwrap();
        assert_eq!(store.poll_external_changes(), 0);

        // Another process rewrites the file.
        let other = FileStore::open(&path);
        other.set("favorites", "[\"1\",\"2\"]", ViewId::next()).unwrap();

        assert_eq!(store.poll_external_changes(), 1);
        assert_eq!(store.poll_external_changes(), 0);
        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].origin, ViewId::EXTERNAL);
        assert_eq!(events[0].new_value.as_deref(), Some("[\"1\",\"2\"]"));
    }

    #[test]
    fn diff_reports_removed_keys() {
        let before = HashMap::from([("a".to_string(), "1".to_string())]);
        let after = HashMap::new();
        let events = diff_maps(&before, &after);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "a");
        assert_eq!(events[0].new_value, None);
    }

    #[tokio::test]
    async fn watcher_stops_when_store_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path().join("store.json")));
        let handle = store.spawn_watcher(Duration::from_millis(10));
        drop(store);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("watcher exits")
            .expect("watcher task ok");
    }
}
