//! Resource locks throttling concurrent job execution.
//!
//! Locks are acquired around a leaf job's `run()` only, never around
//! composite-flow bookkeeping. Deadlock between jobs holding multiple
//! locks is avoided by always assembling locks in name-sorted order (see
//! the wrapping factory).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// A blocking, releasable lock held for the duration of a job's run.
pub trait JobLock: Send + Sync {
    fn acquire_lock(&self);
    fn release_lock(&self);
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("no permit pool named [{0}]")]
    UnknownPool(String),

    #[error("requested {requested} permits from pool [{pool}] which only holds {total}")]
    ExceedsTotal {
        pool: String,
        requested: u32,
        total: u32,
    },
}

struct PermitPool {
    total: u32,
    available: Mutex<u32>,
    cond: Condvar,
}

/// Named counted permit pools capping how many jobs of a class run at
/// once.
#[derive(Default)]
pub struct NamedPermitManager {
    pools: Mutex<HashMap<String, Arc<PermitPool>>>,
}

impl NamedPermitManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or resize the pool `name` to `total` permits.
    pub fn add_permits(&self, name: impl Into<String>, total: u32) {
        let mut pools = self.pools.lock();
        pools.insert(
            name.into(),
            Arc::new(PermitPool {
                total,
                available: Mutex::new(total),
                cond: Condvar::new(),
            }),
        );
    }

    /// A lock taking `num_permits` from pool `name`. Demanding more than
    /// the pool holds can never be satisfied and is refused up front.
    pub fn get_named_permit(
        &self,
        name: &str,
        num_permits: u32,
    ) -> Result<PermitLock, LockError> {
        let pool = self
            .pools
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| LockError::UnknownPool(name.to_string()))?;
        if num_permits > pool.total {
            return Err(LockError::ExceedsTotal {
                pool: name.to_string(),
                requested: num_permits,
                total: pool.total,
            });
        }
        Ok(PermitLock { pool, num_permits })
    }
}

/// Holds `num_permits` permits from one pool while acquired.
pub struct PermitLock {
    pool: Arc<PermitPool>,
    num_permits: u32,
}

impl JobLock for PermitLock {
    fn acquire_lock(&self) {
        let mut available = self.pool.available.lock();
        while *available < self.num_permits {
            self.pool.cond.wait(&mut available);
        }
        *available -= self.num_permits;
    }

    fn release_lock(&self) {
        let mut available = self.pool.available.lock();
        *available += self.num_permits;
        self.pool.cond.notify_all();
    }
}

struct RwState {
    readers: u32,
    writer: bool,
}

struct ResourceLock {
    state: Mutex<RwState>,
    cond: Condvar,
}

/// Named read/write resource locks: many concurrent readers, one writer.
#[derive(Default)]
pub struct ReadWriteLockManager {
    locks: Mutex<HashMap<String, Arc<ResourceLock>>>,
}

impl ReadWriteLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn resource(&self, name: &str) -> Arc<ResourceLock> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(name.to_string()).or_insert_with(|| {
            Arc::new(ResourceLock {
                state: Mutex::new(RwState {
                    readers: 0,
                    writer: false,
                }),
                cond: Condvar::new(),
            })
        }))
    }

    pub fn read_lock(&self, name: &str) -> ReadLock {
        ReadLock {
            lock: self.resource(name),
        }
    }

    pub fn write_lock(&self, name: &str) -> WriteLock {
        WriteLock {
            lock: self.resource(name),
        }
    }
}

pub struct ReadLock {
    lock: Arc<ResourceLock>,
}

impl JobLock for ReadLock {
    fn acquire_lock(&self) {
        let mut state = self.lock.state.lock();
        while state.writer {
            self.lock.cond.wait(&mut state);
        }
        state.readers += 1;
    }

    fn release_lock(&self) {
        let mut state = self.lock.state.lock();
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 {
            self.lock.cond.notify_all();
        }
    }
}

pub struct WriteLock {
    lock: Arc<ResourceLock>,
}

impl JobLock for WriteLock {
    fn acquire_lock(&self) {
        let mut state = self.lock.state.lock();
        while state.writer || state.readers > 0 {
            self.lock.cond.wait(&mut state);
        }
        state.writer = true;
    }

    fn release_lock(&self) {
        let mut state = self.lock.state.lock();
        state.writer = false;
        self.lock.cond.notify_all();
    }
}

/// Acquires a set of locks as one unit, in the order given, releasing in
/// reverse. Callers must hand the locks over already name-sorted.
pub struct GroupLock {
    locks: Vec<Box<dyn JobLock>>,
}

impl GroupLock {
    pub fn new(locks: Vec<Box<dyn JobLock>>) -> Self {
        Self { locks }
    }
}

impl JobLock for GroupLock {
    fn acquire_lock(&self) {
        for lock in &self.locks {
            lock.acquire_lock();
        }
    }

    fn release_lock(&self) {
        for lock in self.locks.iter().rev() {
            lock.release_lock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn test_permit_pool_caps_concurrency() {
        let manager = NamedPermitManager::new();
        manager.add_permits("pool", 2);

        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let manager = Arc::new(manager);

        let mut handles = Vec::new();
        for _ in 0..6 {
            let manager = Arc::clone(&manager);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(std::thread::spawn(move || {
                let lock = manager.get_named_permit("pool", 1).unwrap();
                lock.acquire_lock();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
                lock.release_lock();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_permit_demand_over_total_is_refused() {
        let manager = NamedPermitManager::new();
        manager.add_permits("small", 1);
        assert!(matches!(
            manager.get_named_permit("small", 3),
            Err(LockError::ExceedsTotal { .. })
        ));
        assert!(matches!(
            manager.get_named_permit("missing", 1),
            Err(LockError::UnknownPool(_))
        ));
    }

    #[test]
    fn test_write_lock_excludes_readers() {
        let manager = ReadWriteLockManager::new();
        let write = manager.write_lock("table");
        write.acquire_lock();

        let manager = Arc::new(manager);
        let reader_entered = Arc::new(AtomicU32::new(0));
        let handle = {
            let manager = Arc::clone(&manager);
            let reader_entered = Arc::clone(&reader_entered);
            std::thread::spawn(move || {
                let read = manager.read_lock("table");
                read.acquire_lock();
                reader_entered.store(1, Ordering::SeqCst);
                read.release_lock();
            })
        };

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(reader_entered.load(Ordering::SeqCst), 0);
        write.release_lock();
        handle.join().unwrap();
        assert_eq!(reader_entered.load(Ordering::SeqCst), 1);
    }
}
