//! Per-key admission control.
//!
//! Each concurrency key (an agent name or a provider/model reference) gets a
//! bounded slot count. Acquirers beyond the limit suspend and are woken in
//! FIFO order as slots free up. Keys without a configured limit admit
//! immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

use crate::config::ConcurrencyConfig;
use crate::error::{Result, WardenError};

struct KeyState {
    /// `None` for unbounded keys.
    semaphore: Option<Arc<Semaphore>>,
    /// Slots currently held under this key. Kept separately from the
    /// semaphore so release stays a no-op once the count reaches zero.
    active: usize,
}

impl KeyState {
    fn new(limit: Option<usize>) -> Self {
        Self {
            semaphore: limit.map(|n| Arc::new(Semaphore::new(n))),
            active: 0,
        }
    }
}

pub struct ConcurrencyController {
    config: ConcurrencyConfig,
    keys: Mutex<HashMap<String, KeyState>>,
    closed: AtomicBool,
}

impl ConcurrencyController {
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self {
            config,
            keys: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Suspend until a slot under `key` is free, then hold it. Errors only
    /// when the controller has been cleared for shutdown.
    pub async fn acquire(&self, key: &str) -> Result<()> {
        if self.is_closed() {
            return Err(WardenError::Shutdown);
        }

        let semaphore = {
            let mut keys = self.keys.lock();
            let limit = self.config.limit_for(key);
            let state = keys
                .entry(key.to_string())
                .or_insert_with(|| KeyState::new(limit));
            match &state.semaphore {
                None => {
                    state.active += 1;
                    trace!(key, active = state.active, "acquired (unbounded)");
                    return Ok(());
                }
                Some(semaphore) => Arc::clone(semaphore),
            }
        };

        let permit = semaphore
            .acquire()
            .await
            .map_err(|_| WardenError::Shutdown)?;
        permit.forget();

        let mut keys = self.keys.lock();
        if self.is_closed() {
            return Err(WardenError::Shutdown);
        }
        if let Some(state) = keys.get_mut(key) {
            state.active += 1;
            trace!(key, active = state.active, "acquired");
        }
        Ok(())
    }

    /// Free one slot under `key`, waking the longest-waiting acquirer if
    /// any. A release with no held slots is a no-op; the racing completion
    /// paths rely on that.
    pub fn release(&self, key: &str) {
        let mut keys = self.keys.lock();
        let Some(state) = keys.get_mut(key) else {
            trace!(key, "release on unknown key ignored");
            return;
        };
        if state.active == 0 {
            trace!(key, "release with no held slots ignored");
            return;
        }
        state.active -= 1;
        if let Some(semaphore) = &state.semaphore {
            semaphore.add_permits(1);
        }
        trace!(key, active = state.active, "released");
    }

    /// Slots currently held under `key`.
    pub fn active(&self, key: &str) -> usize {
        self.keys.lock().get(key).map_or(0, |state| state.active)
    }

    /// Shutdown: drop all held-slot accounting and wake every waiter with an
    /// error instead of a slot. Acquires after this fail immediately.
    pub fn clear(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut keys = self.keys.lock();
        for state in keys.values() {
            if let Some(semaphore) = &state.semaphore {
                semaphore.close();
            }
        }
        keys.clear();
        debug!("concurrency controller cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;

    use tokio::time::timeout;

    fn controller(limits: &[(&str, usize)]) -> ConcurrencyController {
        let mut map = StdHashMap::new();
        for (key, limit) in limits {
            map.insert((*key).to_string(), *limit);
        }
        ConcurrencyController::new(ConcurrencyConfig {
            default_limit: None,
            limits: map,
        })
    }

    #[tokio::test]
    async fn unbounded_key_admits_immediately() {
        let controller = controller(&[]);
        for _ in 0..32 {
            controller.acquire("anything").await.unwrap();
        }
        assert_eq!(controller.active("anything"), 32);
    }

    #[tokio::test]
    async fn limit_blocks_and_release_wakes() {
        let controller = Arc::new(controller(&[("explore", 1)]));
        controller.acquire("explore").await.unwrap();

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.acquire("explore").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        controller.release("explore");
        timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(controller.active("explore"), 1);
    }

    #[tokio::test]
    async fn fifo_wake_order_per_key() {
        let controller = Arc::new(controller(&[("explore", 1)]));
        controller.acquire("explore").await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for tag in ["first", "second", "third"] {
            let controller = Arc::clone(&controller);
            let tx = tx.clone();
            tokio::spawn(async move {
                controller.acquire("explore").await.unwrap();
                tx.send(tag).unwrap();
            });
            // Let this waiter reach the semaphore before queueing the next.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        for expected in ["first", "second", "third"] {
            controller.release("explore");
            let woken = timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(woken, expected);
        }
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let controller = controller(&[("explore", 1)]);
        controller.release("explore");

        controller.acquire("explore").await.unwrap();
        controller.release("explore");
        controller.release("explore");
        assert_eq!(controller.active("explore"), 0);

        // Excess releases must not mint extra capacity.
        controller.acquire("explore").await.unwrap();
        let pending = timeout(Duration::from_millis(50), controller.acquire("explore")).await;
        assert!(pending.is_err(), "second acquire should still block");
    }

    #[tokio::test]
    async fn clear_cancels_waiters() {
        let controller = Arc::new(controller(&[("explore", 1)]));
        controller.acquire("explore").await.unwrap();

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.acquire("explore").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        controller.clear();
        let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(matches!(result, Err(WardenError::Shutdown)));

        assert!(matches!(
            controller.acquire("explore").await,
            Err(WardenError::Shutdown)
        ));
    }
}
