//! Keyed mutex with reference-counted per-key locks.
//!
//! Entries live only while some caller holds or waits for their key, so
//! memory is bounded by the number of concurrently active keys rather than
//! by every key ever seen.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::ContextLock;
use crate::context::Context;
use crate::{Error, Result};

struct Entry {
    lock: Arc<ContextLock>,
    refs: usize,
}

struct MapState<K> {
    entries: HashMap<K, Entry>,
    closed: bool,
}

/// Map from key to an independently lockable [`ContextLock`].
///
/// Locking one key never blocks callers locking a different key: the map's
/// own lock is only held for bookkeeping and never across an await.
pub struct MutexMap<K> {
    state: Mutex<MapState<K>>,
}

impl<K> Default for MutexMap<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> MutexMap<K>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MapState {
                entries: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Lock `key`, waiting for any current holder.
    ///
    /// Fails with the context error if `ctx` is done first, or with
    /// [`Error::LockClosed`] if the map is closed before the lock is
    /// acquired. Dropping the future while it waits releases its claim on
    /// the key.
    pub async fn lock(&self, ctx: &Context, key: K) -> Result<()> {
        ctx.check()?;
        let lock = self.take_ref(&key)?;
        let pending = PendingRef {
            map: self,
            key: Some(key),
        };

        lock.lock(ctx).await?;
        let closed = self.state.lock().closed;
        if closed {
            lock.unlock();
            return Err(Error::LockClosed);
        }

        pending.keep();
        Ok(())
    }

    /// Like [`lock`](Self::lock), but unlocks when the returned guard is
    /// dropped.
    pub async fn lock_guard(&self, ctx: &Context, key: K) -> Result<KeyGuard<'_, K>> {
        self.lock(ctx, key.clone()).await?;
        Ok(KeyGuard { map: self, key })
    }

    /// Unlock `key` and drop its entry if nobody else is waiting on it.
    ///
    /// # Panics
    ///
    /// Panics if `key` is not locked.
    pub fn unlock(&self, key: &K) {
        let lock = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(key) else {
                panic!("unlock of a MutexMap key that is not locked");
            };
            entry.refs -= 1;
            let lock = Arc::clone(&entry.lock);
            if entry.refs == 0 {
                state.entries.remove(key);
            }
            lock
        };
        lock.unlock();
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether no key is held or waited on.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the map.
    ///
    /// New `lock` calls fail immediately and callers already waiting fail
    /// as soon as their turn comes, both with [`Error::LockClosed`]. Returns
    /// once every current holder has unlocked.
    pub async fn close(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        let locks: Vec<Arc<ContextLock>> = {
            let mut state = self.state.lock();
            state.closed = true;
            state
                .entries
                .values()
                .map(|entry| Arc::clone(&entry.lock))
                .collect()
        };
        trace!(keys = locks.len(), "Closing keyed locks");

        for lock in locks {
            lock.close(ctx).await?;
        }
        Ok(())
    }

    fn take_ref(&self, key: &K) -> Result<Arc<ContextLock>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::LockClosed);
        }
        let entry = state.entries.entry(key.clone()).or_insert_with(|| Entry {
            lock: Arc::new(ContextLock::new()),
            refs: 0,
        });
        entry.refs += 1;
        Ok(Arc::clone(&entry.lock))
    }

    fn release_ref(&self, key: &K) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                state.entries.remove(key);
            }
        }
    }
}

/// Reference taken by a `lock` call that has not acquired yet.
struct PendingRef<'a, K>
where
    K: Eq + Hash + Clone,
{
    map: &'a MutexMap<K>,
    key: Option<K>,
}

impl<K> PendingRef<'_, K>
where
    K: Eq + Hash + Clone,
{
    /// The lock was acquired; the reference now belongs to the holder.
    fn keep(mut self) {
        self.key = None;
    }
}

impl<K> Drop for PendingRef<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.map.release_ref(&key);
        }
    }
}

/// Holds one key of a [`MutexMap`]; unlocks it on drop.
#[must_use = "the key is unlocked as soon as the guard is dropped"]
pub struct KeyGuard<'a, K>
where
    K: Eq + Hash + Clone,
{
    map: &'a MutexMap<K>,
    key: K,
}

impl<K> KeyGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    /// The locked key.
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for KeyGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        self.map.unlock(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn distinct_keys_do_not_block_each_other() {
        let map = MutexMap::new();
        let ctx = Context::background();
        map.lock(&ctx, "a").await.unwrap();

        timeout(Duration::from_secs(1), map.lock(&ctx, "b"))
            .await
            .expect("locking another key must not wait")
            .unwrap();

        assert_eq!(map.len(), 2);
        map.unlock(&"a");
        map.unlock(&"b");
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn same_key_serializes_callers() {
        let map = Arc::new(MutexMap::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let map = Arc::clone(&map);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            tasks.push(tokio::spawn(async move {
                map.lock(&Context::background(), "object").await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                map.unlock(&"object");
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn entry_survives_until_last_waiter_unlocks() {
        let map = Arc::new(MutexMap::new());
        map.lock(&Context::background(), 1u32).await.unwrap();

        let waiter = {
            let map = Arc::clone(&map);
            tokio::spawn(async move { map.lock(&Context::background(), 1u32).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        map.unlock(&1);
        waiter.await.unwrap().unwrap();
        assert_eq!(map.len(), 1);

        map.unlock(&1);
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_drops_its_reference() {
        let map = MutexMap::new();
        map.lock(&Context::background(), "k").await.unwrap();

        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        assert!(matches!(
            map.lock(&ctx, "k").await,
            Err(Error::DeadlineExceeded)
        ));

        map.unlock(&"k");
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn abandoned_waiter_drops_its_reference() {
        let map = MutexMap::new();
        let ctx = Context::background();
        map.lock(&ctx, "k").await.unwrap();

        // The waiting future is dropped by the timeout, not cancelled
        // through its context.
        assert!(
            timeout(Duration::from_millis(20), map.lock(&ctx, "k"))
                .await
                .is_err()
        );
        assert_eq!(map.len(), 1);

        map.unlock(&"k");
        assert!(map.is_empty());
        timeout(Duration::from_secs(1), map.lock(&ctx, "k"))
            .await
            .expect("key must be free after the holder unlocked")
            .unwrap();
    }

    #[tokio::test]
    async fn guard_unlocks_on_drop() {
        let map = MutexMap::new();
        let ctx = Context::background();

        let guard = map.lock_guard(&ctx, "k".to_string()).await.unwrap();
        assert_eq!(guard.key(), "k");
        assert_eq!(map.len(), 1);
        drop(guard);

        assert!(map.is_empty());
        let again = timeout(Duration::from_secs(1), map.lock_guard(&ctx, "k".to_string()))
            .await
            .expect("key must be free after the guard dropped")
            .unwrap();
        drop(again);
        assert!(map.is_empty());
    }

    #[tokio::test]
    #[should_panic(expected = "not locked")]
    async fn unlock_of_unknown_key_panics() {
        let map: MutexMap<&str> = MutexMap::new();
        map.unlock(&"missing");
    }

    #[tokio::test]
    async fn close_rejects_queued_waiters_and_waits_for_holder() {
        let map = Arc::new(MutexMap::new());
        map.lock(&Context::background(), "k").await.unwrap();

        let waiter = {
            let map = Arc::clone(&map);
            tokio::spawn(async move { map.lock(&Context::background(), "k").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let closer = {
            let map = Arc::clone(&map);
            tokio::spawn(async move { map.close(&Context::background()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!closer.is_finished());
        assert!(matches!(
            map.lock(&Context::background(), "other").await,
            Err(Error::LockClosed)
        ));

        map.unlock(&"k");
        let queued = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("queued waiter must be released")
            .unwrap();
        assert!(matches!(queued, Err(Error::LockClosed)));
        timeout(Duration::from_secs(1), closer)
            .await
            .expect("close must finish once the holder unlocked")
            .unwrap()
            .unwrap();
        assert!(map.is_empty());
    }
}
