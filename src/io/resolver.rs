use std::ops::DerefMut;
use std::sync::{Arc, RwLock, RwLockWriteGuard, Weak};

use dashmap::DashMap;

use crate::scene::node::{Node, NodeRef};

/// De-duplicates loads of the same path: concurrent requests share one
/// subgraph. Entries only hold weak references, so a subgraph the scene no
/// longer reaches is freed and simply regenerated on the next request. A
/// failed load leaves the entry empty, making retries safe.
pub struct SharedSubgraphs {
    cache: DashMap<String, RwLock<Weak<Node>>>,
}

impl SharedSubgraphs {
    pub fn new() -> Self {
        Self {
            cache: DashMap::with_capacity(100),
        }
    }

    pub fn resolve<F>(&self, path: &str, load: F) -> Result<NodeRef, anyhow::Error>
    where
        F: FnOnce() -> Result<NodeRef, anyhow::Error>,
    {
        // Easy path: the cache already carries a weak reference for this path.
        if let Some(entry) = self.cache.get(path) {
            {
                let weak = entry.read().expect("read lock on the cache entry");
                if let Some(node) = weak.upgrade() {
                    return Ok(node);
                }
            }
            let mut weak = entry.write().expect("write lock on the cache entry");
            return Self::generate(load, &mut weak);
        }

        // Heavier path: insert the empty entry first so the cache-wide lock is
        // held briefly, then generate under the entry's own lock.
        self.cache
            .entry(path.to_owned())
            .or_insert_with(|| RwLock::new(Weak::new()));

        let entry = self.cache.get(path).expect("entry was just inserted");
        let mut weak = entry.write().expect("write lock on the cache entry");
        Self::generate(load, &mut weak)
    }

    fn generate<F>(load: F, weak: &mut RwLockWriteGuard<Weak<Node>>) -> Result<NodeRef, anyhow::Error>
    where
        F: FnOnce() -> Result<NodeRef, anyhow::Error>,
    {
        if let Some(node) = weak.upgrade() {
            return Ok(node); // maybe we have been raced
        }

        let node = load()?;
        *weak.deref_mut() = Arc::downgrade(&node);
        Ok(node)
    }
}

impl Default for SharedSubgraphs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::SharedSubgraphs;
    use crate::scene::node::Node;

    #[test]
    fn second_resolve_shares_the_subgraph() {
        let shared = SharedSubgraphs::new();
        let loads = AtomicUsize::new(0);

        let first = shared
            .resolve("model", || {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(Node::group())
            })
            .expect("first resolve");
        let second = shared
            .resolve("model", || {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(Node::group())
            })
            .expect("second resolve");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_subgraphs_are_regenerated() {
        let shared = SharedSubgraphs::new();

        let first = shared.resolve("model", || Ok(Node::group())).expect("first resolve");
        drop(first);

        let second = shared.resolve("model", || Ok(Node::group())).expect("second resolve");
        assert_eq!(Arc::strong_count(&second), 1);
    }

    #[test]
    fn failed_loads_can_be_retried() {
        let shared = SharedSubgraphs::new();

        assert!(shared.resolve("model", || anyhow::bail!("unreadable")).is_err());
        assert!(shared.resolve("model", || Ok(Node::group())).is_ok());
    }
}
