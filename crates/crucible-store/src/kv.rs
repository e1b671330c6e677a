//! Key-value store with unique-prefix resolution.
//!
//! Keys are 32-character script ids; any shorter key is treated as a prefix
//! and resolved through the radix index. The index mirrors the engine's live
//! key set: it is populated while the engine replays its log at open (so
//! there is no window where prefix queries see a partial index) and mutated
//! under the engine write lock afterwards.

use std::path::Path;
use std::sync::{Mutex, RwLock};

use crate::engine::LogEngine;
use crate::radix::{PrefixMatch, RadixTree};
use crate::StoreError;

/// Full script ids are exactly this many characters.
pub const KEY_LEN: usize = 32;

#[derive(Debug)]
pub struct KvStore {
    engine: Mutex<LogEngine>,
    index: RwLock<RadixTree>,
}

impl KvStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<KvStore, StoreError> {
        let engine = LogEngine::open(dir)?;
        let mut index = RadixTree::new();
        for key in engine.keys() {
            index.insert(key.as_bytes());
        }
        tracing::info!(scripts = engine.len(), "key-value store opened");
        Ok(KvStore {
            engine: Mutex::new(engine),
            index: RwLock::new(index),
        })
    }

    /// Resolves a short key through the index; full-length keys bypass it.
    fn resolve(&self, key: &str) -> Result<String, StoreError> {
        if key.len() >= KEY_LEN {
            return Ok(key.to_string());
        }
        match self
            .index
            .read()
            .expect("index lock poisoned")
            .prefix_match(key.as_bytes())
        {
            PrefixMatch::Unique(full) => {
                Ok(String::from_utf8(full).expect("keys are ASCII hex"))
            }
            PrefixMatch::Multiple => Err(StoreError::MultipleMatches),
            // Fall through to the engine-level miss for uniform errors.
            PrefixMatch::None => Ok(key.to_string()),
        }
    }

    pub fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let full = self.resolve(key)?;
        let engine = self.engine.lock().expect("engine lock poisoned");
        engine
            .get(&full)
            .map(<[u8]>::to_vec)
            .ok_or(StoreError::NotFound)
    }

    pub fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut engine = self.engine.lock().expect("engine lock poisoned");
        let inserted = engine.set(key, value)?;
        if inserted {
            self.index
                .write()
                .expect("index lock poisoned")
                .insert(key.as_bytes());
        }
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        let full = self.resolve(key)?;
        let mut engine = self.engine.lock().expect("engine lock poisoned");
        let existed = engine.delete(&full)?;
        if !existed {
            return Err(StoreError::NotFound);
        }
        self.index
            .write()
            .expect("index lock poisoned")
            .remove(full.as_bytes());
        Ok(())
    }

    /// First key extending `prefix`, if any. Full-length inputs probe the
    /// engine directly.
    pub fn has_prefix(&self, prefix: &str) -> Option<String> {
        if prefix.len() >= KEY_LEN {
            let engine = self.engine.lock().expect("engine lock poisoned");
            return engine.contains(prefix).then(|| prefix.to_string());
        }
        let keys = self
            .index
            .read()
            .expect("index lock poisoned")
            .keys_with_prefix(prefix.as_bytes(), Some(1));
        keys.into_iter()
            .next()
            .map(|k| String::from_utf8(k).expect("keys are ASCII hex"))
    }

    pub fn keys_with_prefix(&self, prefix: &str, limit: Option<usize>) -> Vec<String> {
        self.index
            .read()
            .expect("index lock poisoned")
            .keys_with_prefix(prefix.as_bytes(), limit)
            .into_iter()
            .map(|k| String::from_utf8(k).expect("keys are ASCII hex"))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.engine.lock().expect("engine lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY_A: &str = "a1b2c3d4e5f60718293a4b5c6d7e8f90";
    const KEY_B: &str = "a1ffc3d4e5f60718293a4b5c6d7e8f90";
    const KEY_C: &str = "ff00c3d4e5f60718293a4b5c6d7e8f90";

    fn store() -> (TempDir, KvStore) {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn unique_prefix_resolves() {
        let (_dir, store) = store();
        store.set(KEY_A, b"one").unwrap();
        store.set(KEY_C, b"three").unwrap();
        assert_eq!(store.get("a1").unwrap(), b"one");
        assert_eq!(store.get(KEY_A).unwrap(), b"one");
        assert_eq!(store.has_prefix("ff"), Some(KEY_C.to_string()));
        assert_eq!(store.has_prefix("a1"), Some(KEY_A.to_string()));
    }

    #[test]
    fn ambiguous_prefix_is_rejected() {
        let (_dir, store) = store();
        store.set(KEY_A, b"one").unwrap();
        store.set(KEY_B, b"two").unwrap();
        assert!(matches!(store.get("a1"), Err(StoreError::MultipleMatches)));
        assert!(matches!(
            store.delete("a1"),
            Err(StoreError::MultipleMatches)
        ));
        // A longer, unique prefix works.
        assert_eq!(store.get("a1b").unwrap(), b"one");
    }

    #[test]
    fn missing_prefix_falls_through_to_not_found() {
        let (_dir, store) = store();
        store.set(KEY_A, b"one").unwrap();
        assert!(matches!(store.get("zz"), Err(StoreError::NotFound)));
        assert!(matches!(store.get(KEY_C), Err(StoreError::NotFound)));
        assert_eq!(store.has_prefix("zz"), None);
    }

    #[test]
    fn delete_updates_index_and_engine() {
        let (_dir, store) = store();
        store.set(KEY_A, b"one").unwrap();
        store.delete("a1").unwrap();
        assert!(matches!(store.get(KEY_A), Err(StoreError::NotFound)));
        assert_eq!(store.keys_with_prefix("", None).len(), 0);
        assert!(matches!(store.delete(KEY_A), Err(StoreError::NotFound)));
    }

    #[test]
    fn overwrite_keeps_one_index_entry() {
        let (_dir, store) = store();
        store.set(KEY_A, b"one").unwrap();
        store.set(KEY_A, b"two").unwrap();
        assert_eq!(store.keys_with_prefix("a1", None), vec![KEY_A.to_string()]);
        assert_eq!(store.get("a1").unwrap(), b"two");
    }

    #[test]
    fn keys_with_prefix_respects_limit() {
        let (_dir, store) = store();
        store.set(KEY_A, b"one").unwrap();
        store.set(KEY_B, b"two").unwrap();
        store.set(KEY_C, b"three").unwrap();
        assert_eq!(store.keys_with_prefix("a1", None).len(), 2);
        assert_eq!(store.keys_with_prefix("", Some(2)).len(), 2);
    }

    #[test]
    fn index_rebuilds_on_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = KvStore::open(dir.path()).unwrap();
            store.set(KEY_A, b"one").unwrap();
            store.set(KEY_C, b"three").unwrap();
        }
        let store = KvStore::open(dir.path()).unwrap();
        assert_eq!(store.get("a1").unwrap(), b"one");
        assert_eq!(store.keys_with_prefix("", None).len(), 2);
    }
}
