use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::storage::{ChangeListener, KeyValueStore, StorageEvent, Subscription, ViewId};

/// Key the favorites list is persisted under.
pub const FAVORITES_KEY: &str = "favorites";

/// Removes the first occurrence of `id` if present, otherwise appends it.
pub fn toggle(ids: &[String], id: &str) -> Vec<String> {
    match ids.iter().position(|x| x == id) {
        Some(pos) => {
            let mut next = ids.to_vec();
            next.remove(pos);
            next
        }
        None => {
            let mut next = Vec::with_capacity(ids.len() + 1);
            next.extend_from_slice(ids);
            next.push(id.to_string());
            next
        }
    }
}

/// One view of the persisted favorites list.
///
/// The in-memory list follows writes made through any other view of the same
/// medium. The medium stays the source of truth: concurrent writers race and
/// the last write wins.
pub struct FavoritesStore {
    store: Arc<dyn KeyValueStore>,
    view: ViewId,
    current: Arc<watch::Sender<Vec<String>>>,
    write_lock: Mutex<()>,
    _sync: Subscription,
}

impl FavoritesStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let view = ViewId::next();
        let initial = load_from(store.as_ref());
        let (tx, _rx) = watch::channel(initial);
        let current = Arc::new(tx);

        let sink = current.clone();
        let listener: ChangeListener = Arc::new(move |event: &StorageEvent| {
            if event.key != FAVORITES_KEY {
                return;
            }
            let ids = event
                .new_value
                .as_deref()
                .map(decode_ids)
                .unwrap_or_default();
            info!(ids = ids.len(), "Favorites changed in another view");
            sink.send_replace(ids);
        });
        let sync = store.on_change(view, listener);
        debug!(view = ?view, "Favorites view attached");

        Self {
            store,
            view,
            current,
            write_lock: Mutex::new(()),
            _sync: sync,
        }
    }

    /// Reads the persisted list. Missing or corrupt values read as empty.
    pub fn load(&self) -> Vec<String> {
        load_from(self.store.as_ref())
    }

    /// Overwrites the persisted list. A failed write is logged; the in-memory
    /// list keeps the attempted value for the rest of the session.
    pub fn save(&self, ids: Vec<String>) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.persist(ids);
    }

    /// Flips membership of `id` and persists the result.
    pub fn toggle(&self, id: &str) -> Vec<String> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let next = toggle(&self.current.borrow(), id);
        self.persist(next.clone());
        next
    }

    pub fn ids(&self) -> Vec<String> {
        self.current.borrow().clone()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.current.borrow().iter().any(|x| x == id)
    }

    /// Receiver that observes every change of the in-memory list.
    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.current.subscribe()
    }

    fn persist(&self, ids: Vec<String>) {
        self.current.send_replace(ids.clone());
        let encoded = match serde_json::to_string(&ids) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to encode favorites: {}", e);
                return;
            }
        };
        match self.store.set(FAVORITES_KEY, &encoded, self.view) {
            Ok(()) => debug!(ids = ids.len(), "Saved favorites"),
            Err(e) => error!("Failed to persist favorites: {}", e),
        }
    }
}

fn load_from(store: &dyn KeyValueStore) -> Vec<String> {
    match store.get(FAVORITES_KEY) {
        Ok(Some(raw)) => decode_ids(&raw),
        Ok(None) => Vec::new(),
        Err(e) => {
            warn!("Failed to read favorites, treating as empty: {}", e);
            Vec::new()
        }
    }
}

/// Parses a stored JSON array of strings, dropping duplicates.
fn decode_ids(raw: &str) -> Vec<String> {
    let ids: Vec<String> = match serde_json::from_str(raw) {
        Ok(ids) => ids,
        Err(e) => {
            warn!("Stored favorites are corrupt, treating as empty: {}", e);
            return Vec::new();
        }
    };
    let mut unique: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        if !unique.contains(&id) {
            unique.push(id);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::storage::{FileStore, MemoryStore};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    struct ReadOnlyStore {
        inner: MemoryStore,
    }

    impl KeyValueStore for ReadOnlyStore {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key)
        }
        fn set(&self, _key: &str, _value: &str, _origin: ViewId) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("quota exceeded".to_string()))
        }
        fn remove(&self, _key: &str, _origin: ViewId) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("quota exceeded".to_string()))
        }
        fn on_change(&self, view: ViewId, listener: ChangeListener) -> Subscription {
            self.inner.on_change(view, listener)
        }
    }

    #[test]
    fn toggle_appends_missing_and_removes_present() {
        let base = ids(&["a", "b", "c"]);
        assert_eq!(toggle(&base, "d"), ids(&["a", "b", "c", "d"]));
        assert_eq!(toggle(&base, "b"), ids(&["a", "c"]));
        assert_eq!(toggle(&[], "x"), ids(&["x"]));
    }

    #[test]
    fn toggle_twice_restores_original() {
        let cases = [ids(&[]), ids(&["1"]), ids(&["1", "2", "3"]), ids(&["3", "1"])];
        for base in cases {
            for x in ["1", "2", "9"] {
                assert_eq!(toggle(&toggle(&base, x), x), base, "id {x} on {base:?}");
            }
        }
    }

    #[test]
    fn toggle_keeps_ids_unique() {
        let base = ids(&["1", "2", "3"]);
        for x in ["1", "2", "3", "4"] {
            let next = toggle(&base, x);
            let mut dedup = next.clone();
            dedup.sort();
            dedup.dedup();
            assert_eq!(dedup.len(), next.len());
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let favorites = FavoritesStore::new(Arc::new(MemoryStore::new()));
        assert!(favorites.load().is_empty());
        let list = ids(&["27205", "157336", "with \"quotes\""]);
        favorites.save(list.clone());
        assert_eq!(favorites.load(), list);
        assert_eq!(favorites.ids(), list);
    }

    #[test]
    fn corrupt_value_loads_as_empty() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(FAVORITES_KEY, "definitely not json", ViewId::EXTERNAL)
            .unwrap();
        let favorites = FavoritesStore::new(store.clone());
        assert!(favorites.load().is_empty());
        assert!(favorites.ids().is_empty());

        store
            .set(FAVORITES_KEY, "{\"not\":\"an array\"}", ViewId::EXTERNAL)
            .unwrap();
        assert!(favorites.load().is_empty());
    }

    #[test]
    fn duplicate_persisted_ids_are_collapsed() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(FAVORITES_KEY, "[\"1\",\"2\",\"1\"]", ViewId::EXTERNAL)
            .unwrap();
        let favorites = FavoritesStore::new(store);
        assert_eq!(favorites.load(), ids(&["1", "2"]));
    }

    #[test]
    fn failed_save_keeps_in_memory_update() {
        let favorites = FavoritesStore::new(Arc::new(ReadOnlyStore {
            inner: MemoryStore::new(),
        }));
        let after = favorites.toggle("42");
        assert_eq!(after, ids(&["42"]));
        assert!(favorites.contains("42"));
        assert!(favorites.load().is_empty());
    }

    #[test]
    fn other_views_follow_writes() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let tab_a = FavoritesStore::new(store.clone());
        let tab_b = FavoritesStore::new(store.clone());
        let mut rx = tab_b.subscribe();

        tab_a.toggle("27205");
        tab_a.toggle("157336");
        assert_eq!(tab_b.ids(), ids(&["27205", "157336"]));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ids(&["27205", "157336"]));

        tab_b.toggle("27205");
        assert_eq!(tab_a.ids(), ids(&["157336"]));
    }

    #[test]
    fn external_notification_is_authoritative() {
        let store = Arc::new(MemoryStore::new());
        let favorites = FavoritesStore::new(store.clone());
        favorites.save(ids(&["1", "2"]));

        store.set(FAVORITES_KEY, "[\"9\"]", ViewId::EXTERNAL).unwrap();
        assert_eq!(favorites.ids(), ids(&["9"]));

        store.remove(FAVORITES_KEY, ViewId::EXTERNAL).unwrap();
        assert!(favorites.ids().is_empty());

        store.set("theme", "dark", ViewId::EXTERNAL).unwrap();
        assert!(favorites.ids().is_empty());
    }

    #[test]
    fn dropped_view_stops_listening() {
        let store = Arc::new(MemoryStore::new());
        let writer = FavoritesStore::new(store.clone());
        {
            let _reader = FavoritesStore::new(store.clone());
        }
        writer.toggle("1");
        assert_eq!(writer.load(), ids(&["1"]));
    }

    #[test]
    fn polling_during_local_writes_loses_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = Arc::new(FileStore::open(&path));
        let favorites = FavoritesStore::new(store.clone());
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    store.poll_external_changes();
                }
            });
            for n in 0..150 {
                favorites.toggle(&n.to_string());
            }
            done.store(true, Ordering::SeqCst);
        });

        assert_eq!(favorites.ids().len(), 150);
        assert_eq!(favorites.load().len(), 150);
        let reopened = FavoritesStore::new(Arc::new(FileStore::open(&path)));
        assert_eq!(reopened.load(), favorites.ids());
    }

    #[test]
    fn passive_view_settles_on_last_write() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KeyValueStore> =
            Arc::new(FileStore::open(dir.path().join("store.json")));
        let tab_a = FavoritesStore::new(store.clone());
        let tab_b = FavoritesStore::new(store.clone());
        let watcher = FavoritesStore::new(store.clone());

        thread::scope(|s| {
            s.spawn(|| {
                for n in 0..50 {
                    tab_a.save(vec![format!("a{n}")]);
                }
            });
            s.spawn(|| {
                for n in 0..50 {
                    tab_b.save(vec![format!("b{n}")]);
                }
            });
        });

        let persisted = watcher.load();
        assert_eq!(persisted.len(), 1);
        assert_eq!(watcher.ids(), persisted);
    }
}
