//! Shared registry of named, reference-counted handles guarded by one
//! reader/writer lock. Entries may be present-but-null (a name reserved by a
//! disabled index); `get` treats those as absent.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

type AddHook<T> = Box<dyn Fn(&str, &Arc<T>) + Send + Sync>;

pub struct Registry<T> {
    map: RwLock<HashMap<String, Option<Arc<T>>>>,
    hook: Mutex<Option<AddHook<T>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            hook: Mutex::new(None),
        }
    }

    /// Hook invoked (outside the map lock) after every `add_or_replace`.
    pub fn set_add_hook(&self, hook: impl Fn(&str, &Arc<T>) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    /// Atomically add an entry; fails if the key exists, even as null.
    pub fn add_uniq(&self, key: &str, value: Arc<T>) -> bool {
        let mut map = self.map.write();
        if map.contains_key(key) {
            return false;
        }
        map.insert(key.to_string(), Some(value));
        true
    }

    /// Reserve a key with a null entry (a known but unservable name).
    pub fn add_null(&self, key: &str) -> bool {
        let mut map = self.map.write();
        if map.contains_key(key) {
            return false;
        }
        map.insert(key.to_string(), None);
        true
    }

    /// Atomically install a new entry. The previous reference is released
    /// only after the new one is in place, so a reader never observes the
    /// key emptying out mid-replace.
    pub fn add_or_replace(&self, key: &str, value: Arc<T>) {
        let prior;
        {
            let mut map = self.map.write();
            prior = map.insert(key.to_string(), Some(value.clone()));
        }
        if let Some(hook) = self.hook.lock().as_ref() {
            hook(key, &value);
        }
        drop(prior);
    }

    /// Release and remove by key.
    pub fn delete(&self, key: &str) -> bool {
        self.map.write().remove(key).is_some()
    }

    /// Remove the key only if its entry is null.
    pub fn delete_if_null(&self, key: &str) -> bool {
        let mut map = self.map.write();
        match map.get(key) {
            Some(None) => {
                map.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Key present, even if null?
    pub fn contains(&self, key: &str) -> bool {
        self.map.read().contains_key(key)
    }

    /// Acquired reference for a live entry; `None` for missing or null keys.
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.map.read().get(key).and_then(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Release everything.
    pub fn clear(&self) {
        self.map.write().clear();
    }

    /// Read-locked iteration: the key set is fixed for the guard's lifetime
    /// and every yielded reference is acquired. Deletion is impossible while
    /// the guard lives.
    pub fn read(&self) -> RegistryReader<'_, T> {
        RegistryReader {
            guard: self.map.read(),
        }
    }

    /// Write-locked iteration with in-place deletion: the closure sees every
    /// entry and keeps it by returning `true`. Entries removed mid-iteration
    /// do not disturb visiting the rest.
    pub fn retain_entries(&self, mut keep: impl FnMut(&str, &mut Option<Arc<T>>) -> bool) {
        self.map.write().retain(|k, v| keep(k, v));
    }
}

pub struct RegistryReader<'a, T> {
    guard: RwLockReadGuard<'a, HashMap<String, Option<Arc<T>>>>,
}

impl<'a, T> RegistryReader<'a, T> {
    /// Iterate live entries as `(name, acquired reference)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Arc<T>)> + '_ {
        self.guard
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k.as_str(), v.clone())))
    }

    /// Every key, including null entries.
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.guard.keys().map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.guard.get(key).and_then(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_uniq_respects_existing_keys() {
        let reg: Registry<String> = Registry::new();
        assert!(reg.add_uniq("a", Arc::new("one".into())));
        assert!(!reg.add_uniq("a", Arc::new("two".into())));
        assert_eq!(reg.get("a").unwrap().as_str(), "one");
    }

    #[test]
    fn null_entries_reserve_names() {
        let reg: Registry<String> = Registry::new();
        assert!(reg.add_null("pending"));
        assert!(reg.contains("pending"));
        assert!(reg.get("pending").is_none());
        assert!(!reg.add_uniq("pending", Arc::new("x".into())));
        assert!(reg.delete_if_null("pending"));
        assert!(!reg.contains("pending"));
        // delete_if_null refuses live entries
        reg.add_or_replace("live", Arc::new("v".into()));
        assert!(!reg.delete_if_null("live"));
        assert!(reg.contains("live"));
    }

    #[test]
    fn add_or_replace_swaps_value() {
        let reg: Registry<String> = Registry::new();
        reg.add_or_replace("k", Arc::new("v1".into()));
        let held = reg.get("k").unwrap();
        reg.add_or_replace("k", Arc::new("v2".into()));
        // the old reference stays alive for holders, the map serves the new
        assert_eq!(held.as_str(), "v1");
        assert_eq!(reg.get("k").unwrap().as_str(), "v2");
    }

    #[test]
    fn add_hook_fires_on_replace() {
        let reg: Registry<String> = Registry::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
        let seen2 = seen.clone();
        reg.set_add_hook(move |key, _| seen2.lock().push(key.to_string()));
        reg.add_or_replace("a", Arc::new("1".into()));
        reg.add_or_replace("a", Arc::new("2".into()));
        assert_eq!(seen.lock().as_slice(), ["a", "a"]);
    }

    #[test]
    fn read_iteration_sees_fixed_set() {
        let reg: Registry<u32> = Registry::new();
        reg.add_or_replace("a", Arc::new(1));
        reg.add_or_replace("b", Arc::new(2));
        reg.add_null("c");

        let reader = reg.read();
        let mut live: Vec<&str> = reader.iter().map(|(k, _)| k).collect();
        live.sort_unstable();
        assert_eq!(live, ["a", "b"]);
        assert_eq!(reader.keys().count(), 3);
        // get during iteration agrees with the iterated set
        assert!(reader.get("a").is_some());
        assert!(reader.get("c").is_none());
    }

    #[test]
    fn retain_deletes_in_place() {
        let reg: Registry<u32> = Registry::new();
        for (k, v) in [("a", 1), ("b", 2), ("c", 3)] {
            reg.add_or_replace(k, Arc::new(v));
        }
        reg.retain_entries(|_k, v| v.as_ref().map(|v| **v % 2 == 1).unwrap_or(false));
        assert_eq!(reg.len(), 2);
        assert!(reg.get("b").is_none());
        assert!(reg.get("a").is_some());
        assert!(reg.get("c").is_some());
    }

    #[test]
    fn concurrent_add_or_replace_leaves_one_live_value() {
        let reg = Arc::new(Registry::<u32>::new());
        let mut handles = Vec::new();
        for i in 0..8u32 {
            let reg = reg.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    reg.add_or_replace("k", Arc::new(i));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // never null, always one of the written values
        let v = reg.get("k").expect("key must stay live");
        assert!(*v < 8);
    }
}
