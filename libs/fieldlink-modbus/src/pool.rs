//! Bounded messenger pool
//!
//! Holds up to `max_size` live messengers for one device. Frames of a poll
//! cycle run concurrently and each borrows one messenger for the duration of
//! its request; the pool size therefore caps in-flight requests per device.

use std::sync::Arc;

use errors::{CollectError, CollectResult};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::messenger::{Messenger, MessengerFactory};

struct PoolState {
    idle: Vec<Box<dyn Messenger>>,
    /// Live messengers, idle plus checked out
    open: usize,
    closed: bool,
}

pub struct ConnectionPool {
    factory: Arc<dyn MessengerFactory>,
    max_size: usize,
    state: Mutex<PoolState>,
    available: Notify,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn MessengerFactory>, max_size: usize) -> Self {
        Self {
            factory,
            max_size: max_size.max(1),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                open: 0,
                closed: false,
            }),
            available: Notify::new(),
        }
    }

    /// Open every slot up front; any failure tears down what was opened
    pub async fn prefill(&self) -> CollectResult<()> {
        let mut opened = Vec::with_capacity(self.max_size);
        for _ in 0..self.max_size {
            match self.factory.connect().await {
                Ok(messenger) => opened.push(messenger),
                Err(e) => {
                    for mut messenger in opened {
                        messenger.close().await;
                    }
                    return Err(CollectError::connect_failure(format!(
                        "{}: {}",
                        self.factory.endpoint(),
                        e
                    )));
                },
            }
        }

        let mut state = self.state.lock();
        state.open += opened.len();
        state.idle.extend(opened);
        info!(
            "Pool ready: {} ({} connections)",
            self.factory.endpoint(),
            state.open
        );
        Ok(())
    }

    /// Borrow a messenger; waits while every slot is checked out
    pub async fn acquire(&self) -> CollectResult<Box<dyn Messenger>> {
        loop {
            let notified = self.available.notified();
            let grow = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(CollectError::bad_connection("connection pool destroyed"));
                }
                if let Some(messenger) = state.idle.pop() {
                    return Ok(messenger);
                }
                if state.open < self.max_size {
                    state.open += 1;
                    true
                } else {
                    false
                }
            };
            if grow {
                return self.open_slot().await;
            }
            notified.await;
        }
    }

    /// Return a healthy messenger
    pub async fn release(&self, messenger: Box<dyn Messenger>) {
        let rejected = {
            let mut state = self.state.lock();
            if state.closed {
                state.open = state.open.saturating_sub(1);
                Some(messenger)
            } else {
                state.idle.push(messenger);
                None
            }
        };
        match rejected {
            Some(mut messenger) => messenger.close().await,
            None => self.available.notify_one(),
        }
    }

    /// Close a broken messenger and open a fresh one in its slot
    pub async fn replace(
        &self,
        mut broken: Box<dyn Messenger>,
    ) -> CollectResult<Box<dyn Messenger>> {
        broken.close().await;
        if self.state.lock().closed {
            self.forget_slot();
            return Err(CollectError::bad_connection("connection pool destroyed"));
        }
        debug!("Reconnecting: {}", self.factory.endpoint());
        self.open_slot().await
    }

    /// Close a messenger and give its slot back
    pub async fn discard(&self, mut messenger: Box<dyn Messenger>) {
        messenger.close().await;
        self.forget_slot();
    }

    /// Close every idle messenger; checked-out ones close on return
    pub async fn destroy(&self) {
        let idle = {
            let mut state = self.state.lock();
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.open = state.open.saturating_sub(idle.len());
            idle
        };
        for mut messenger in idle {
            messenger.close().await;
        }
        self.available.notify_waiters();
        debug!("Pool destroyed: {}", self.factory.endpoint());
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().open
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Connect for a slot that is already counted as open
    async fn open_slot(&self) -> CollectResult<Box<dyn Messenger>> {
        match self.factory.connect().await {
            Ok(messenger) => Ok(messenger),
            Err(e) => {
                warn!("Pool connect failed: {} - {}", self.factory.endpoint(), e);
                self.forget_slot();
                Err(e)
            },
        }
    }

    fn forget_slot(&self) {
        {
            let mut state = self.state.lock();
            state.open = state.open.saturating_sub(1);
        }
        self.available.notify_one();
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    // Lets tests call `unwrap_err()` on `CollectResult<Box<dyn Messenger>>`
    impl std::fmt::Debug for dyn Messenger {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("dyn Messenger")
        }
    }

    struct Loopback {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Messenger for Loopback {
        async fn ask(&mut self, request: &[u8], _expected_len: usize) -> CollectResult<Vec<u8>> {
            Ok(request.to_vec())
        }

        async fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        connects: AtomicUsize,
        closes: Arc<AtomicUsize>,
        refuse: AtomicBool,
    }

    #[async_trait]
    impl MessengerFactory for CountingFactory {
        async fn connect(&self) -> CollectResult<Box<dyn Messenger>> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(CollectError::connect_failure("refused"));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Loopback {
                closes: self.closes.clone(),
            }))
        }

        fn endpoint(&self) -> String {
            "loopback".to_string()
        }
    }

    fn pool(max: usize) -> (Arc<CountingFactory>, ConnectionPool) {
        let factory = Arc::new(CountingFactory::default());
        let pool = ConnectionPool::new(factory.clone(), max);
        (factory, pool)
    }

    #[tokio::test]
    async fn test_prefill_opens_every_slot() {
        let (factory, pool) = pool(3);
        pool.prefill().await.unwrap();
        assert_eq!(factory.connects.load(Ordering::SeqCst), 3);
        assert_eq!(pool.idle_count(), 3);
        assert_eq!(pool.open_count(), 3);

        let mut m = pool.acquire().await.unwrap();
        assert_eq!(m.ask(&[1, 2], 2).await.unwrap(), vec![1, 2]);
        pool.release(m).await;
        assert_eq!(factory.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_prefill_failure_is_connect_failure() {
        let (factory, pool) = pool(2);
        factory.refuse.store(true, Ordering::SeqCst);
        let err = pool.prefill().await.unwrap_err();
        assert!(matches!(err, CollectError::ConnectFailure(_)));
        assert_eq!(pool.open_count(), 0);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let (factory, pool) = pool(1);
        let pool = Arc::new(pool);
        let first = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.release(first).await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
        assert!(pool.open_count() <= 1);
    }

    #[tokio::test]
    async fn test_replace_closes_and_reconnects() {
        let (factory, pool) = pool(1);
        let m = pool.acquire().await.unwrap();
        let m = pool.replace(m).await.unwrap();
        assert_eq!(factory.closes.load(Ordering::SeqCst), 1);
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.open_count(), 1);

        factory.refuse.store(true, Ordering::SeqCst);
        assert!(pool.replace(m).await.is_err());
        assert_eq!(pool.open_count(), 0);
    }

    #[tokio::test]
    async fn test_discard_frees_slot() {
        let (_factory, pool) = pool(1);
        let m = pool.acquire().await.unwrap();
        pool.discard(m).await;
        assert_eq!(pool.open_count(), 0);
        let m = tokio::time::timeout(Duration::from_secs(1), pool.acquire())
            .await
            .unwrap()
            .unwrap();
        pool.release(m).await;
    }

    #[tokio::test]
    async fn test_destroy_closes_idle_and_rejects_acquire() {
        let (factory, pool) = pool(2);
        pool.prefill().await.unwrap();
        let out = pool.acquire().await.unwrap();

        pool.destroy().await;
        assert_eq!(factory.closes.load(Ordering::SeqCst), 1);
        assert!(pool.acquire().await.unwrap_err().is_bad_connection());

        // Checked-out messenger closes on return
        pool.release(out).await;
        assert_eq!(factory.closes.load(Ordering::SeqCst), 2);
        assert_eq!(pool.open_count(), 0);
    }
}
