//! Sharded registry of live sessions.
//!
//! Membership changes lock only the shard owning the id, so sessions of
//! unrelated guilds never contend on one mutex.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

pub struct SessionRegistry<S> {
    shards: Vec<Mutex<HashMap<String, Arc<S>>>>,
}

impl<S> SessionRegistry<S> {
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    /// Existing session for `id`, or the one `create` builds.
    ///
    /// `create` runs under the shard lock, so at most one session exists per id.
    pub fn get_or_create(&self, id: &str, create: impl FnOnce() -> Arc<S>) -> Arc<S> {
        let mut shard = self.shard(id);
        if let Some(existing) = shard.get(id) {
            return existing.clone();
        }
        let session = create();
        shard.insert(id.to_string(), session.clone());
        tracing::debug!(session = id, "session registered");
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<S>> {
        self.shard(id).get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<S>> {
        self.shard(id).remove(id)
    }

    /// Remove `id` only when `matches` accepts the stored entry.
    pub fn remove_if(&self, id: &str, matches: impl FnOnce(&Arc<S>) -> bool) -> Option<Arc<S>> {
        let mut shard = self.shard(id);
        if shard.get(id).is_some_and(matches) {
            tracing::debug!(session = id, "session unregistered");
            shard.remove(id)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| lock(shard).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .shards
            .iter()
            .flat_map(|shard| lock(shard).keys().cloned().collect::<Vec<_>>())
            .collect();
        ids.sort();
        ids
    }

    /// Every registered session.
    pub fn sessions(&self) -> Vec<Arc<S>> {
        self.shards
            .iter()
            .flat_map(|shard| lock(shard).values().cloned().collect::<Vec<_>>())
            .collect()
    }

    fn shard(&self, id: &str) -> MutexGuard<'_, HashMap<String, Arc<S>>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        lock(&self.shards[index])
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn get_or_create_builds_once() {
        let registry: SessionRegistry<String> = SessionRegistry::new(4);
        let built = AtomicUsize::new(0);
        let first = registry.get_or_create("guild-1", || {
            built.fetch_add(1, Ordering::SeqCst);
            Arc::new("one".to_string())
        });
        let second = registry.get_or_create("guild-1", || {
            built.fetch_add(1, Ordering::SeqCst);
            Arc::new("two".to_string())
        });
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_and_lookup() {
        let registry: SessionRegistry<u32> = SessionRegistry::new(2);
        registry.get_or_create("a", || Arc::new(1));
        registry.get_or_create("b", || Arc::new(2));
        assert_eq!(registry.ids(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.remove("a").as_deref(), Some(&1));
        assert!(registry.get("a").is_none());
        assert_eq!(registry.get("b").as_deref(), Some(&2));
        assert_eq!(registry.sessions().len(), 1);
    }

    #[test]
    fn remove_if_keeps_replaced_entries() {
        let registry: SessionRegistry<u32> = SessionRegistry::new(1);
        let old = Arc::new(1);
        registry.get_or_create("a", || old.clone());
        registry.remove("a");
        registry.get_or_create("a", || Arc::new(2));
        assert!(registry.remove_if("a", |stored| Arc::ptr_eq(stored, &old)).is_none());
        assert_eq!(registry.get("a").as_deref(), Some(&2));
    }

    #[test]
    fn zero_shards_still_works() {
        let registry: SessionRegistry<u32> = SessionRegistry::new(0);
        registry.get_or_create("x", || Arc::new(9));
        assert!(!registry.is_empty());
    }

    #[test]
    fn concurrent_get_or_create_yields_single_entry() {
        let registry = Arc::new(SessionRegistry::<usize>::new(8));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                thread::spawn(move || registry.get_or_create(&format!("g{}", i % 4), || Arc::new(i)))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 4);
    }
}
