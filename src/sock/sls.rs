//! Socket-local storage: typed per-socket slots with registered cleanup
//! functions, plus a reserved keyed string store backing the `sls` command.
//!
//! Slot allocation is a one-time bootstrap; ids are never freed. Values
//! live for as long as the owning `Sock` and are cleaned up in LIFO slot
//! order when the socket closes.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

pub type SlsValue = Box<dyn Any + Send>;
pub type SlsCleanup = Box<dyn Fn(SlsValue) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlsId(usize);

struct Registry {
    cleanups: Mutex<Vec<Option<SlsCleanup>>>,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let reg = Registry { cleanups: Mutex::new(Vec::new()) };
        // Slot 0 is reserved for the keyed string store.
        reg.cleanups.lock().unwrap().push(None);
        reg
    })
}

const KEYED_SLOT: SlsId = SlsId(0);

/// Allocate a new slot id, optionally with a cleanup function invoked when
/// an owning socket closes.
pub fn alloc(cleanup: Option<SlsCleanup>) -> SlsId {
    let mut cleanups = registry().cleanups.lock().unwrap();
    cleanups.push(cleanup);
    SlsId(cleanups.len() - 1)
}

/// Per-socket slot array. Grows lazily to the registered slot count.
#[derive(Default)]
pub struct SlsStore {
    slots: Vec<Option<SlsValue>>,
}

impl std::fmt::Debug for SlsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let occupied = self.slots.iter().filter(|s| s.is_some()).count();
        write!(f, "SlsStore({occupied} slots)")
    }
}

impl SlsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: SlsId, value: SlsValue) {
        if self.slots.len() <= id.0 {
            self.slots.resize_with(id.0 + 1, || None);
        }
        self.slots[id.0] = Some(value);
    }

    pub fn get(&self, id: SlsId) -> Option<&(dyn Any + Send)> {
        self.slots.get(id.0).and_then(|s| s.as_deref())
    }

    pub fn get_mut(&mut self, id: SlsId) -> Option<&mut (dyn Any + Send)> {
        self.slots.get_mut(id.0).and_then(|s| s.as_deref_mut())
    }

    pub fn take(&mut self, id: SlsId) -> Option<SlsValue> {
        self.slots.get_mut(id.0).and_then(|s| s.take())
    }

    fn keyed(&self) -> Option<&HashMap<String, String>> {
        self.get(KEYED_SLOT).and_then(|v| v.downcast_ref())
    }

    fn keyed_mut(&mut self) -> &mut HashMap<String, String> {
        if self.get(KEYED_SLOT).is_none() {
            self.set(KEYED_SLOT, Box::new(HashMap::<String, String>::new()));
        }
        self.get_mut(KEYED_SLOT)
            .and_then(|v| v.downcast_mut())
            .expect("keyed slot holds a string map")
    }

    pub fn keyed_set(&mut self, key: &str, value: &str) {
        self.keyed_mut().insert(key.to_string(), value.to_string());
    }

    pub fn keyed_get(&self, key: &str) -> Option<&str> {
        self.keyed().and_then(|m| m.get(key)).map(|s| s.as_str())
    }

    /// Returns whether the key existed.
    pub fn keyed_unset(&mut self, key: &str) -> bool {
        self.keyed_mut().remove(key).is_some()
    }

    /// All keyed pairs in key order.
    pub fn keyed_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .keyed()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        pairs.sort();
        pairs
    }

    /// Run registered cleanup functions, highest slot first, and drop all
    /// values. Called exactly once when the owning socket closes.
    pub fn cleanup(&mut self) {
        let cleanups = registry().cleanups.lock().unwrap();
        for idx in (0..self.slots.len()).rev() {
            if let Some(value) = self.slots[idx].take() {
                match cleanups.get(idx) {
                    Some(Some(cleanup)) => cleanup(value),
                    _ => drop(value),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_typed_slot_roundtrip() {
        let id = alloc(None);
        let mut store = SlsStore::new();
        store.set(id, Box::new(42u64));
        let value = store.get(id).and_then(|v| v.downcast_ref::<u64>());
        assert_eq!(value, Some(&42));
        assert!(store.take(id).is_some());
        assert!(store.get(id).is_none());
    }

    #[test]
    fn test_cleanup_runs_lifo() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2) = (order.clone(), order.clone());
        let first = alloc(Some(Box::new(move |_| o1.lock().unwrap().push("first"))));
        let second = alloc(Some(Box::new(move |_| o2.lock().unwrap().push("second"))));

        let mut store = SlsStore::new();
        store.set(first, Box::new(()));
        store.set(second, Box::new(()));
        store.cleanup();

        assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
    }

    #[test]
    fn test_cleanup_skips_empty_slots() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = alloc(Some(Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        })));

        let mut store = SlsStore::new();
        store.cleanup();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        store.set(id, Box::new(1i32));
        store.cleanup();
        store.cleanup();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_keyed_store() {
        let mut store = SlsStore::new();
        assert_eq!(store.keyed_get("user"), None);
        store.keyed_set("user", "jan");
        store.keyed_set("role", "admin");
        assert_eq!(store.keyed_get("user"), Some("jan"));
        assert_eq!(
            store.keyed_pairs(),
            vec![
                ("role".to_string(), "admin".to_string()),
                ("user".to_string(), "jan".to_string())
            ]
        );
        assert!(store.keyed_unset("user"));
        assert!(!store.keyed_unset("user"));
    }
}
