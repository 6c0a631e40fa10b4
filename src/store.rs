//! Process-local attribute store.
//!
//! Holds the latest reading for every named attribute. Each polling engine writes its
//! readings as one batch per cycle; readers take snapshots that never observe a batch
//! half-applied.
//!
//! # Locking
//!
//! The map sits behind a `parking_lot::RwLock`. Writers hold the write lock only for
//! the copy of one batch into the map, never across I/O. Snapshots hold the read lock
//! for the copy out. Since every batch is applied inside a single write-lock critical
//! section, a snapshot always reflects the store state between two batches
//! (linearizable with respect to `update`).
//!
//! # Staleness
//!
//! Polled readings age out after the optional staleness window. Operator-set values
//! (slit selection) are written with [`AttributeStore::update_held`] and stay valid
//! until replaced, since nothing refreshes them on a period.
//!
//! # Change Notification
//!
//! Every applied batch is published on a `tokio::sync::broadcast` channel so that
//! reactive consumers (the alarm engine) run on store updates instead of polling.

use crate::core::{Attribute, Snapshot};
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

const UPDATE_CHANNEL_CAPACITY: usize = 1024;

/// One applied batch, as seen by subscribers.
#[derive(Clone, Debug)]
pub struct StoreUpdate {
    /// Instrument (or component) that wrote the batch
    pub source: String,
    /// Store generation after the batch was applied
    pub generation: u64,
    /// The attributes exactly as written
    pub attributes: Arc<Vec<Attribute>>,
}

impl StoreUpdate {
    /// Whether the batch touched `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name == name)
    }
}

#[derive(Default)]
struct StoreInner {
    attributes: HashMap<String, Attribute>,
    // Attributes exempt from the staleness window
    held: HashSet<String>,
    generation: u64,
}

/// Thread-safe cache of the latest attribute readings.
pub struct AttributeStore {
    inner: RwLock<StoreInner>,
    staleness_window: Option<Duration>,
    updates: broadcast::Sender<StoreUpdate>,
}

impl std::fmt::Debug for AttributeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("AttributeStore")
            .field("attributes", &inner.attributes.len())
            .field("generation", &inner.generation)
            .field("staleness_window", &self.staleness_window)
            .finish()
    }
}

impl Default for AttributeStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl AttributeStore {
    /// Create an empty store.
    ///
    /// With a `staleness_window`, readers see `valid = false` on any attribute that
    /// has not been refreshed within the window.
    pub fn new(staleness_window: Option<Duration>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(StoreInner::default()),
            staleness_window,
            updates,
        }
    }

    /// Apply a batch atomically with respect to readers.
    ///
    /// Returns the store generation after the batch. Empty batches are ignored.
    pub fn update(&self, source: &str, batch: Vec<Attribute>) -> u64 {
        self.apply(source, batch, false)
    }

    /// Apply a batch of set-once values that never age out under the staleness
    /// window. A later [`update`](Self::update) of the same name makes it age again.
    pub fn update_held(&self, source: &str, batch: Vec<Attribute>) -> u64 {
        self.apply(source, batch, true)
    }

    fn apply(&self, source: &str, batch: Vec<Attribute>, held: bool) -> u64 {
        if batch.is_empty() {
            return self.generation();
        }
        let batch = Arc::new(batch);
        let generation = {
            let mut inner = self.inner.write();
            for attr in batch.iter() {
                if held {
                    inner.held.insert(attr.name.clone());
                } else {
                    inner.held.remove(&attr.name);
                }
                inner.attributes.insert(attr.name.clone(), attr.clone());
            }
            inner.generation += 1;
            inner.generation
        };
        debug!(source, generation, count = batch.len(), held, "store batch applied");
        // No subscribers is fine
        let _ = self.updates.send(StoreUpdate {
            source: source.to_string(),
            generation,
            attributes: batch,
        });
        generation
    }

    /// Flag the named attributes as invalid, keeping their last value and timestamp.
    ///
    /// Names the store has never seen are ignored. Subscribers receive the
    /// invalidated attributes as a regular batch.
    pub fn mark_stale(&self, source: &str, names: &[String]) -> usize {
        let (invalidated, generation) = {
            let mut inner = self.inner.write();
            let mut invalidated = Vec::new();
            for name in names {
                if let Some(attr) = inner.attributes.get_mut(name) {
                    if attr.valid {
                        attr.valid = false;
                        invalidated.push(attr.clone());
                    }
                }
            }
            if !invalidated.is_empty() {
                inner.generation += 1;
            }
            (invalidated, inner.generation)
        };
        let count = invalidated.len();
        if count > 0 {
            let _ = self.updates.send(StoreUpdate {
                source: source.to_string(),
                generation,
                attributes: Arc::new(invalidated),
            });
        }
        count
    }

    /// Latest reading for `name`.
    pub fn get(&self, name: &str) -> AppResult<Attribute> {
        let now = Utc::now();
        let inner = self.inner.read();
        inner
            .attributes
            .get(name)
            .map(|attr| self.effective(&inner, attr, now))
            .ok_or_else(|| DaqError::AttributeNotFound(name.to_string()))
    }

    /// Consistent copy of the named attributes, or of every attribute when `names`
    /// is empty. Unknown names are absent from the result.
    pub fn snapshot<S: AsRef<str>>(&self, names: &[S]) -> Snapshot {
        let now = Utc::now();
        let inner = self.inner.read();
        if names.is_empty() {
            inner
                .attributes
                .values()
                .map(|attr| (attr.name.clone(), self.effective(&inner, attr, now)))
                .collect()
        } else {
            names
                .iter()
                .filter_map(|name| inner.attributes.get(name.as_ref()))
                .map(|attr| (attr.name.clone(), self.effective(&inner, attr, now)))
                .collect()
        }
    }

    /// Number of batches applied so far.
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Names of every known attribute, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().attributes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of known attributes.
    pub fn len(&self) -> usize {
        self.inner.read().attributes.len()
    }

    /// True if nothing was ever written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receive every batch applied after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.updates.subscribe()
    }

    fn effective(&self, inner: &StoreInner, attr: &Attribute, now: DateTime<Utc>) -> Attribute {
        let mut out = attr.clone();
        if let Some(window) = self.staleness_window {
            if out.valid && !inner.held.contains(&attr.name) && out.is_older_than(window, now) {
                out.valid = false;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AttributeValue;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn batch(prefix: &str, value: f64) -> Vec<Attribute> {
        ["a", "b", "c"]
            .iter()
            .map(|n| Attribute::new(format!("{prefix}{n}"), value, "K"))
            .collect()
    }

    #[test]
    fn test_get_and_not_found() {
        let store = AttributeStore::default();
        store.update("cryo", vec![Attribute::new("TA", 12.5, "K")]);

        let attr = store.get("TA").unwrap();
        assert_eq!(attr.value, AttributeValue::Number(12.5));
        assert!(attr.valid);
        assert!(matches!(
            store.get("TB"),
            Err(DaqError::AttributeNotFound(name)) if name == "TB"
        ));
    }

    #[test]
    fn test_snapshot_empty_names_returns_all() {
        let store = AttributeStore::default();
        store.update("cryo", batch("t_", 1.0));
        store.update("gauge", batch("p_", 2.0));

        assert_eq!(store.snapshot::<&str>(&[]).len(), 6);
        let partial = store.snapshot(&["t_a", "p_c", "missing"]);
        assert_eq!(partial.len(), 2);
        assert!(partial.contains_key("t_a"));
        assert!(!partial.contains_key("missing"));
    }

    #[test]
    fn test_staleness_window_invalidates_on_read() {
        let store = AttributeStore::new(Some(Duration::from_secs(5)));
        let old = Attribute::new("TA", 10.0, "K")
            .with_timestamp(Utc::now() - chrono::Duration::seconds(60));
        store.update("cryo", vec![old, Attribute::new("TB", 11.0, "K")]);

        assert!(!store.get("TA").unwrap().valid);
        assert!(store.get("TB").unwrap().valid);
    }

    #[test]
    fn test_held_values_do_not_age_out() {
        let store = AttributeStore::new(Some(Duration::from_secs(5)));
        let long_ago = Utc::now() - chrono::Duration::seconds(600);
        store.update_held(
            "slit",
            vec![Attribute::new("slit_number", 500.0, "").with_timestamp(long_ago)],
        );
        assert!(store.get("slit_number").unwrap().valid);
        assert!(store.snapshot(&["slit_number"])["slit_number"].valid);

        // A polled write of the same name ages normally again
        store.update(
            "cryo",
            vec![Attribute::new("slit_number", 500.0, "").with_timestamp(long_ago)],
        );
        assert!(!store.get("slit_number").unwrap().valid);
    }

    #[test]
    fn test_held_values_still_honour_mark_stale() {
        let store = AttributeStore::new(Some(Duration::from_secs(5)));
        store.update_held("slit", vec![Attribute::new("slit_width", 0.2, "mm")]);
        assert_eq!(store.mark_stale("slit", &["slit_width".to_string()]), 1);
        assert!(!store.get("slit_width").unwrap().valid);
    }

    #[test]
    fn test_mark_stale_until_next_update() {
        let store = AttributeStore::default();
        store.update("cryo", vec![Attribute::new("TA", 10.0, "K")]);

        assert_eq!(store.mark_stale("cryo", &["TA".to_string(), "nope".to_string()]), 1);
        let stale = store.get("TA").unwrap();
        assert!(!stale.valid);
        assert_eq!(stale.value, AttributeValue::Number(10.0));

        // Already stale: nothing new to invalidate
        assert_eq!(store.mark_stale("cryo", &["TA".to_string()]), 0);

        store.update("cryo", vec![Attribute::new("TA", 11.0, "K")]);
        assert!(store.get("TA").unwrap().valid);
    }

    #[tokio::test]
    async fn test_subscribers_receive_batches() {
        let store = AttributeStore::default();
        let mut rx = store.subscribe();
        store.update("gauge", batch("p_", 3.0));

        let update = rx.recv().await.unwrap();
        assert_eq!(update.source, "gauge");
        assert_eq!(update.attributes.len(), 3);
        assert!(update.contains("p_b"));
    }

    #[test]
    fn test_concurrent_snapshots_never_see_partial_batch() {
        let store = Arc::new(AttributeStore::default());
        store.update("w0", batch("x_", 0.0));
        store.update("w1", batch("y_", 0.0));
        let done = Arc::new(AtomicBool::new(false));

        let writers: Vec<_> = ["x_", "y_"]
            .into_iter()
            .map(|prefix| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 1..=2000 {
                        store.update(prefix, batch(prefix, f64::from(i)));
                    }
                })
            })
            .collect();

        let reader = {
            let store = store.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut checked = 0u32;
                while !done.load(Ordering::Acquire) || checked == 0 {
                    let snap = store.snapshot::<&str>(&[]);
                    for prefix in ["x_", "y_"] {
                        let values: Vec<_> = ["a", "b", "c"]
                            .iter()
                            .map(|n| snap[&format!("{prefix}{n}")].value.clone())
                            .collect();
                        assert!(values.windows(2).all(|w| w[0] == w[1]), "torn batch: {values:?}");
                    }
                    checked += 1;
                }
                checked
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        done.store(true, Ordering::Release);
        assert!(reader.join().unwrap() > 0);
        assert_eq!(store.generation(), 2 + 4000);
    }
}
