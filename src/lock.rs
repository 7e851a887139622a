use crate::error::AppError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

const LOCK_PREFIX: &str = "user_lock:";

fn lock_key(user_id: u64) -> String {
    format!("{LOCK_PREFIX}{user_id}")
}

/// The sole concurrency gate for a user's downloads. A held lock expires on its
/// own after the TTL, so a crashed attempt frees the user without intervention.
/// An unreachable store must surface as an error, never as "free".
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn acquire(&self, user_id: u64, ttl: Duration) -> Result<bool, AppError>;
    async fn release(&self, user_id: u64) -> Result<(), AppError>;
    async fn is_locked(&self, user_id: u64) -> Result<bool, AppError>;
    async fn list_active(&self) -> Result<Vec<String>, AppError>;
}

#[derive(Clone)]
pub struct RedisLockStore {
    conn: ConnectionManager,
}

impl RedisLockStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn acquire(&self, user_id: u64, ttl: Duration) -> Result<bool, AppError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| AppError::Internal(e.to_string()))?
            .as_secs();
        let mut conn = self.conn.clone();
        // Single atomic SET NX EX: either we create the record and own the lock,
        // or somebody already holds it.
        let reply: Option<String> = redis::cmd("SET")
            .arg(lock_key(user_id))
            .arg(now)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        let acquired = reply.is_some();
        debug!(event = "lock_acquire", user_id, acquired);
        Ok(acquired)
    }

    async fn release(&self, user_id: u64) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(lock_key(user_id))
            .query_async(&mut conn)
            .await?;
        debug!(event = "lock_release", user_id);
        Ok(())
    }

    async fn is_locked(&self, user_id: u64) -> Result<bool, AppError> {
        let mut conn = self.conn.clone();
        let exists: i64 = redis::cmd("EXISTS")
            .arg(lock_key(user_id))
            .query_async(&mut conn)
            .await?;
        Ok(exists == 1)
    }

    async fn list_active(&self) -> Result<Vec<String>, AppError> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let mut iter = conn.scan_match::<_, String>(format!("{LOCK_PREFIX}*")).await?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
    };
    use tokio::sync::Mutex;

    /// In-memory lock store with an adjustable clock, for exercising TTL
    /// semantics without a live Redis.
    #[derive(Clone, Default)]
    pub struct MemoryLockStore {
        now_secs: Arc<AtomicU64>,
        entries: Arc<Mutex<HashMap<u64, u64>>>,
        pub fail: Arc<std::sync::atomic::AtomicBool>,
    }

    impl MemoryLockStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn advance(&self, secs: u64) {
            self.now_secs.fetch_add(secs, Ordering::SeqCst);
        }

        fn check_reachable(&self) -> Result<(), AppError> {
            if self.fail.load(Ordering::SeqCst) {
                Err(AppError::Internal("lock store unreachable".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl LockStore for MemoryLockStore {
        async fn acquire(&self, user_id: u64, ttl: Duration) -> Result<bool, AppError> {
            self.check_reachable()?;
            let now = self.now_secs.load(Ordering::SeqCst);
            let mut entries = self.entries.lock().await;
            match entries.get(&user_id) {
                Some(&expires_at) if expires_at > now => Ok(false),
                _ => {
                    entries.insert(user_id, now + ttl.as_secs());
                    Ok(true)
                }
            }
        }

        async fn release(&self, user_id: u64) -> Result<(), AppError> {
            self.check_reachable()?;
            self.entries.lock().await.remove(&user_id);
            Ok(())
        }

        async fn is_locked(&self, user_id: u64) -> Result<bool, AppError> {
            self.check_reachable()?;
            let now = self.now_secs.load(Ordering::SeqCst);
            Ok(self
                .entries
                .lock()
                .await
                .get(&user_id)
                .is_some_and(|&expires_at| expires_at > now))
        }

        async fn list_active(&self) -> Result<Vec<String>, AppError> {
            self.check_reachable()?;
            let now = self.now_secs.load(Ordering::SeqCst);
            let mut keys: Vec<String> = self
                .entries
                .lock()
                .await
                .iter()
                .filter(|(_, &expires_at)| expires_at > now)
                .map(|(user_id, _)| lock_key(*user_id))
                .collect();
            keys.sort();
            Ok(keys)
        }
    }
}
