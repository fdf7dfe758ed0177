//! Per-customer mutual exclusion.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

type LockMap = DashMap<Uuid, Arc<Mutex<()>>>;

/// Serializes work for one customer while letting different customers proceed
/// in parallel. Invoice assembly and event ingestion both take this lock.
///
/// An entry lives only while some task holds or waits on it.
#[derive(Debug, Default)]
pub struct CustomerLocks {
    locks: Arc<LockMap>,
}

/// Held for the duration of one customer's critical section.
#[derive(Debug)]
pub struct CustomerGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
    customer_id: Uuid,
}

impl Drop for CustomerGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Map entry plus no other holder or waiter.
        self.locks
            .remove_if(&self.customer_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl CustomerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, customer_id: Uuid) -> CustomerGuard {
        let mutex = self
            .locks
            .entry(customer_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        CustomerGuard {
            guard: Some(mutex.lock_owned().await),
            locks: self.locks.clone(),
            customer_id,
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
