//! Per-subsystem write locks.
//!
//! Every mutation holds the lock of the subsystem it touches across
//! validate, CAS and engine-apply. Operations spanning two subsystems
//! acquire both locks in NQN-lexicographic order, which rules out
//! deadlock between concurrent multi-subsystem operations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

/// Lazily populated table of per-subsystem async locks.
#[derive(Debug, Default)]
pub struct SubsystemLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SubsystemLocks {
    fn entry(&self, nqn: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut table = self.inner.lock().expect("lock table poisoned");
        Arc::clone(
            table
                .entry(nqn.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Acquires the write lock for one subsystem.
    pub async fn acquire(&self, nqn: &str) -> OwnedMutexGuard<()> {
        self.entry(nqn).lock_owned().await
    }

    /// Acquires locks for two subsystems in NQN-lexicographic order.
    /// Equal names take a single lock.
    pub async fn acquire_pair(
        &self,
        first: &str,
        second: &str,
    ) -> (OwnedMutexGuard<()>, Option<OwnedMutexGuard<()>>) {
        if first == second {
            return (self.acquire(first).await, None);
        }
        let (lo, hi) = if first < second {
            (first, second)
        } else {
            (second, first)
        };
        let lo_guard = self.acquire(lo).await;
        let hi_guard = self.acquire(hi).await;
        (lo_guard, Some(hi_guard))
    }

    /// Drops the table entry for a deleted subsystem.
    pub fn forget(&self, nqn: &str) {
        let mut table = self.inner.lock().expect("lock table poisoned");
        // Only remove when nobody else holds a clone.
        if let Some(entry) = table.get(nqn) {
            if Arc::strong_count(entry) == 1 {
                table.remove(nqn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn lock_excludes_second_acquirer() {
        let locks = Arc::new(SubsystemLocks::default());
        let guard = locks.acquire("nqn.2016-06.io.spdk:cnode1").await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire("nqn.2016-06.io.spdk:cnode1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn different_subsystems_do_not_contend() {
        let locks = SubsystemLocks::default();
        let _a = locks.acquire("nqn.2016-06.io.spdk:a").await;
        let _b = locks.acquire("nqn.2016-06.io.spdk:b").await;
    }

    #[tokio::test]
    async fn pair_acquisition_is_ordered() {
        let locks = Arc::new(SubsystemLocks::default());
        // Opposite argument orders must not deadlock.
        let t1 = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                for _ in 0..50 {
                    let _guards = locks
                        .acquire_pair("nqn.2016-06.io.spdk:a", "nqn.2016-06.io.spdk:b")
                        .await;
                }
            })
        };
        let t2 = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                for _ in 0..50 {
                    let _guards = locks
                        .acquire_pair("nqn.2016-06.io.spdk:b", "nqn.2016-06.io.spdk:a")
                        .await;
                }
            })
        };
        t1.await.unwrap();
        t2.await.unwrap();
    }

    #[tokio::test]
    async fn same_subsystem_pair_takes_one_lock() {
        let locks = SubsystemLocks::default();
        let (_guard, second) = locks
            .acquire_pair("nqn.2016-06.io.spdk:a", "nqn.2016-06.io.spdk:a")
            .await;
        assert!(second.is_none());
    }
}
