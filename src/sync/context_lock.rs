//! Binary lock with context-cancellable acquire.

use tokio::sync::Semaphore;

use crate::context::Context;
use crate::{Error, Result};

/// A mutex whose `lock` can be abandoned when a [`Context`] is done.
///
/// Not reentrant and not tied to a guard: whoever called `lock` must call
/// `unlock`. Share it by reference (`&` or `Arc`), never by copy.
#[derive(Debug)]
pub struct ContextLock {
    permits: Semaphore,
}

impl Default for ContextLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextLock {
    /// Create an unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            permits: Semaphore::new(1),
        }
    }

    /// Acquire the lock, waiting until it is free or `ctx` is done.
    ///
    /// On cancellation the lock state is untouched. Fails with
    /// [`Error::LockClosed`] once the lock has been closed.
    pub async fn lock(&self, ctx: &Context) -> Result<()> {
        let permit = ctx
            .run(self.permits.acquire())
            .await?
            .map_err(|_| Error::LockClosed)?;
        permit.forget();
        Ok(())
    }

    /// Acquire the lock without waiting. Returns `false` if it is held or closed.
    pub fn try_lock(&self) -> bool {
        match self.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Release the lock.
    ///
    /// # Panics
    ///
    /// Panics if the lock is not held or has been closed.
    pub fn unlock(&self) {
        assert!(!self.permits.is_closed(), "unlock of a closed ContextLock");
        assert!(
            self.permits.available_permits() == 0,
            "unlock of an unlocked ContextLock"
        );
        self.permits.add_permits(1);
    }

    /// Whether the lock is currently held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        !self.permits.is_closed() && self.permits.available_permits() == 0
    }

    /// Whether [`close`](Self::close) has completed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Wait for the lock to be free, then close it for good.
    ///
    /// Callers already queued are served first; later `lock` calls fail with
    /// [`Error::LockClosed`].
    /// Closing an already closed lock is a no-op.
    pub async fn close(&self, ctx: &Context) -> Result<()> {
        if self.permits.is_closed() {
            return Ok(());
        }
        match self.lock(ctx).await {
            Ok(()) => {}
            Err(Error::LockClosed) => return Ok(()),
            Err(e) => return Err(e),
        }
        self.permits.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn second_lock_waits_for_unlock() {
        let lock = Arc::new(ContextLock::new());
        let ctx = Context::background();
        lock.lock(&ctx).await.unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.lock(&Context::background()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        lock.unlock();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire after unlock")
            .unwrap()
            .unwrap();
        assert!(lock.is_locked());
    }

    #[tokio::test]
    async fn cancelled_context_does_not_acquire() {
        let lock = ContextLock::new();
        let ctx = Context::background();
        ctx.cancel();

        let err = lock.lock(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!lock.is_locked());
        assert!(lock.try_lock());
    }

    #[tokio::test]
    async fn waiting_lock_gives_up_at_deadline() {
        let lock = ContextLock::new();
        lock.lock(&Context::background()).await.unwrap();

        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let err = lock.lock(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));

        // The abandoned wait must not have stolen the permit.
        lock.unlock();
        assert!(lock.try_lock());
    }

    #[test]
    #[should_panic(expected = "unlock of an unlocked ContextLock")]
    fn unlock_without_lock_panics() {
        ContextLock::new().unlock();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_new_lockers() {
        let lock = ContextLock::new();
        let ctx = Context::background();
        lock.close(&ctx).await.unwrap();
        lock.close(&ctx).await.unwrap();

        assert!(lock.is_closed());
        assert!(matches!(lock.lock(&ctx).await, Err(Error::LockClosed)));
        assert!(!lock.try_lock());
    }

    #[tokio::test]
    async fn close_waits_for_holder_then_rejects_lockers() {
        let lock = Arc::new(ContextLock::new());
        lock.lock(&Context::background()).await.unwrap();

        let closer = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.close(&Context::background()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!closer.is_finished());

        lock.unlock();
        closer.await.unwrap().unwrap();
        assert!(matches!(
            lock.lock(&Context::background()).await,
            Err(Error::LockClosed)
        ));
    }
}
