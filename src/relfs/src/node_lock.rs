// Per-node write serialization. Appending a block reads the current block
// count and writes the next sequence number, so two appenders on the same
// node must not interleave. Different nodes never block each other.

use crate::types::NodeId;
use crate::{RelFsError, RelFsResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub struct NodeLockManager {
    locks: Mutex<HashMap<NodeId, Arc<Mutex<()>>>>,
}

impl NodeLockManager {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the lock for a node.
    pub fn get_lock(&self, node_id: NodeId) -> RelFsResult<Arc<Mutex<()>>> {
        let mut map = self
            .locks
            .lock()
            .map_err(|e| RelFsError::Internal(format!("node lock map poisoned: {}", e)))?;
        // entries nobody else holds are dropped while we are here
        map.retain(|id, lock| *id == node_id || Arc::strong_count(lock) > 1);
        Ok(map
            .entry(node_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Number of nodes with a lock entry.
    pub fn tracked(&self) -> RelFsResult<usize> {
        let map = self
            .locks
            .lock()
            .map_err(|e| RelFsError::Internal(format!("node lock map poisoned: {}", e)))?;
        Ok(map.len())
    }
}

impl Default for NodeLockManager {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn lock_node(lock: &Mutex<()>) -> RelFsResult<MutexGuard<'_, ()>> {
    lock.lock()
        .map_err(|e| RelFsError::Internal(format!("node lock poisoned: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_same_node_shares_lock() {
        let manager = NodeLockManager::new();
        let a = manager.get_lock(1).unwrap();
        let b = manager.get_lock(1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = manager.get_lock(2).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_write_excludes_other_writes() {
        let manager = Arc::new(NodeLockManager::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let manager = manager.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                let lock = manager.get_lock(7).unwrap();
                let _guard = lock_node(&lock).unwrap();
                let current = counter.load(Ordering::SeqCst);
                thread::yield_now();
                counter.store(current + 1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // no lost updates
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_poisoned_map_is_an_error() {
        let manager = Arc::new(NodeLockManager::new());
        let poisoner = manager.clone();
        let _ = thread::spawn(move || {
            let _map = poisoner.locks.lock().unwrap();
            panic!("poison the lock map");
        })
        .join();

        assert!(matches!(manager.tracked(), Err(RelFsError::Internal(_))));
        assert!(matches!(manager.get_lock(1), Err(RelFsError::Internal(_))));
    }

    #[test]
    fn test_released_locks_are_pruned() {
        let manager = NodeLockManager::new();
        {
            let _a = manager.get_lock(1).unwrap();
            let _b = manager.get_lock(2).unwrap();
            assert_eq!(manager.tracked().unwrap(), 2);
        }
        let _c = manager.get_lock(3).unwrap();
        assert_eq!(manager.tracked().unwrap(), 1);
    }
}
