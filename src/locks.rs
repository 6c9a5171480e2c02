//! Per-key critical sections for the user and token serialization domains.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub type KeyGuard = OwnedMutexGuard<()>;

/// One async mutex per key, created on first use.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard {
        self.slot(key).lock_owned().await
    }

    pub fn try_lock(&self, key: &str) -> Option<KeyGuard> {
        self.slot(key).try_lock_owned().ok()
    }

    /// Drop slots nobody holds or waits on.
    pub fn prune(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        before.saturating_sub(self.slots.len())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Guards for one user and one token, held together.
pub struct PairGuard {
    pub user: KeyGuard,
    pub token: KeyGuard,
}

/// Acquire a user lock and a token lock without ever waiting on one while
/// holding the other: wait on one, try the other, back off on contention.
pub async fn lock_pair(users: &KeyedLocks, user_id: &str, tokens: &KeyedLocks, token_id: &str) -> PairGuard {
    loop {
        let user = users.lock(user_id).await;
        if let Some(token) = tokens.try_lock(token_id) {
            return PairGuard { user, token };
        }
        drop(user);

        let token = tokens.lock(token_id).await;
        if let Some(user) = users.try_lock(user_id) {
            return PairGuard { user, token };
        }
        drop(token);
        // Jitter so two crossed waiters do not retry in lockstep
        let micros = rand::thread_rng().gen_range(50..=500u64);
        tokio::time::sleep(Duration::from_micros(micros)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            handles.push(tokio::spawn(async move {
                let _g = locks.lock("k").await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(1)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_try_lock_contended() {
        let locks = KeyedLocks::new();
        let g = locks.lock("k").await;
        assert!(locks.try_lock("k").is_none());
        assert!(locks.try_lock("other").is_some());
        drop(g);
        assert!(locks.try_lock("k").is_some());
    }

    #[tokio::test]
    async fn test_prune_keeps_held() {
        let locks = KeyedLocks::new();
        let _held = locks.lock("a").await;
        drop(locks.lock("b").await);
        assert_eq!(locks.prune(), 1);
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_crossed_pairs_do_not_deadlock() {
        let users = Arc::new(KeyedLocks::new());
        let tokens = Arc::new(KeyedLocks::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let users = users.clone();
            let tokens = tokens.clone();
            handles.push(tokio::spawn(async move {
                let (u, t) = if i % 2 == 0 { ("u1", "t1") } else { ("u1", "t2") };
                let _g = lock_pair(&users, u, &tokens, t).await;
                tokio::task::yield_now().await;
            }));
        }
        let all = async {
            for h in handles {
                h.await.unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(10), all)
            .await
            .expect("pair locking stalled");
    }
}
