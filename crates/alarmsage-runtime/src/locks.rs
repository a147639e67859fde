//! Per-thread mutual exclusion for conversation turns.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// One async mutex per thread id. Turns on the same thread queue behind each
/// other; turns on different threads never contend.
#[derive(Clone, Default)]
pub struct ThreadLocks {
    locks: Arc<LockMap>,
}

/// Exclusive access to one thread. Dropping it releases the lock and forgets
/// the thread's entry once nobody else holds or waits on it.
pub struct ThreadGuard {
    guard: Option<OwnedMutexGuard<()>>,
    thread_id: String,
    locks: Arc<LockMap>,
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // The map's own clone is the only reference left when idle. Waiters
        // and concurrent `acquire` calls hold another, keeping the entry.
        self.locks
            .remove_if(&self.thread_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl ThreadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `thread_id`; released when the guard drops.
    pub async fn acquire(&self, thread_id: &str) -> ThreadGuard {
        let lock = self
            .locks
            .entry(thread_id.to_string())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;
        ThreadGuard {
            guard: Some(guard),
            thread_id: thread_id.to_string(),
            locks: self.locks.clone(),
        }
    }

    /// Number of threads currently locked or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_thread_waits() {
        let locks = ThreadLocks::new();
        let guard = locks.acquire("t1").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.acquire("t1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_threads_do_not_contend() {
        let locks = ThreadLocks::new();
        let _a = locks.acquire("t1").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("t2")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_released_threads_are_forgotten() {
        let locks = ThreadLocks::new();
        for i in 0..50 {
            let _g = locks.acquire(&format!("t{}", i)).await;
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_entry_kept_while_a_turn_waits() {
        let locks = ThreadLocks::new();
        let guard = locks.acquire("t1").await;

        let other = locks.clone();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let waiter = tokio::spawn(async move {
            let _g = other.acquire("t1").await;
            let _ = rx.await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(guard);
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The waiter now holds the lock.
        assert_eq!(locks.len(), 1);

        tx.send(()).unwrap();
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
