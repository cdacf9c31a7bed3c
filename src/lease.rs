//! 进程内 WOPI 锁租约表：每个文件至多一个租约，读取时惰性清理过期项。

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::debug;

pub const NOT_LOCKED_REASON: &str = "File not locked";
pub const UNLOCKED_NON_EMPTY_REASON: &str = "PutFile on unlocked file with current size != 0";

/// Exclusive writer claim over one file.
#[derive(Debug, Clone)]
pub struct Lease {
    token: String,
    created_at: Instant,
}

impl Lease {
    fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
            created_at: Instant::now(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > ttl
    }
}

/// 锁不匹配：携带当前锁令牌，或在文件未加锁时携带失败原因。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockMismatch {
    pub current: Option<String>,
    pub reason: Option<String>,
}

impl LockMismatch {
    pub fn held_by(token: &str) -> Self {
        Self {
            current: Some(token.to_string()),
            reason: None,
        }
    }

    pub fn not_locked() -> Self {
        Self::unlocked(NOT_LOCKED_REASON)
    }

    pub fn unlocked(reason: &str) -> Self {
        Self {
            current: None,
            reason: Some(reason.to_string()),
        }
    }
}

/// Owns every lease, keyed by file id.
#[derive(Debug)]
pub struct LeaseTable {
    leases: Mutex<HashMap<String, Lease>>,
    ttl: Duration,
}

impl LeaseTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// 进入临界区；查找、过期判断与状态变更都必须在同一个守卫内完成。
    pub async fn begin(&self) -> LeaseGuard<'_> {
        LeaseGuard {
            leases: self.leases.lock().await,
            ttl: self.ttl,
        }
    }

    pub async fn lock(&self, id: &str, token: &str) -> Result<(), LockMismatch> {
        self.begin().await.lock(id, token)
    }

    pub async fn unlock(&self, id: &str, token: &str) -> Result<(), LockMismatch> {
        self.begin().await.unlock(id, token)
    }

    pub async fn refresh(&self, id: &str, token: &str) -> Result<(), LockMismatch> {
        self.begin().await.refresh(id, token)
    }

    pub async fn unlock_and_relock(
        &self,
        id: &str,
        old_token: &str,
        new_token: &str,
    ) -> Result<(), LockMismatch> {
        self.begin().await.unlock_and_relock(id, old_token, new_token)
    }

    /// 返回当前有效的锁令牌。
    pub async fn current(&self, id: &str) -> Option<String> {
        self.begin()
            .await
            .active(id)
            .map(|lease| lease.token().to_string())
    }

    /// 清理全部过期租约，返回清理数量。
    pub async fn prune_expired(&self) -> usize {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        let before = leases.len();
        leases.retain(|_, lease| !lease.is_expired(self.ttl, now));
        before - leases.len()
    }
}

/// Held critical section over the lease table.
pub struct LeaseGuard<'a> {
    leases: MutexGuard<'a, HashMap<String, Lease>>,
    ttl: Duration,
}

impl LeaseGuard<'_> {
    /// Looks up the live lease for `id`, dropping it first if it has expired.
    fn active(&mut self, id: &str) -> Option<&mut Lease> {
        let expired = self
            .leases
            .get(id)
            .is_some_and(|lease| lease.is_expired(self.ttl, Instant::now()));
        if expired {
            self.leases.remove(id);
            debug!(file_id = id, "lease expired");
        }
        self.leases.get_mut(id)
    }

    pub fn lock(&mut self, id: &str, token: &str) -> Result<(), LockMismatch> {
        if let Some(lease) = self.active(id)
            && lease.token != token
        {
            return Err(LockMismatch::held_by(&lease.token));
        }
        self.leases.insert(id.to_string(), Lease::new(token));
        Ok(())
    }

    pub fn unlock(&mut self, id: &str, token: &str) -> Result<(), LockMismatch> {
        match self.active(id) {
            Some(lease) if lease.token == token => {
                self.leases.remove(id);
                Ok(())
            }
            Some(lease) => Err(LockMismatch::held_by(&lease.token)),
            None => Err(LockMismatch::not_locked()),
        }
    }

    pub fn refresh(&mut self, id: &str, token: &str) -> Result<(), LockMismatch> {
        match self.active(id) {
            Some(lease) if lease.token == token => {
                lease.created_at = Instant::now();
                Ok(())
            }
            Some(lease) => Err(LockMismatch::held_by(&lease.token)),
            None => Err(LockMismatch::not_locked()),
        }
    }

    pub fn unlock_and_relock(
        &mut self,
        id: &str,
        old_token: &str,
        new_token: &str,
    ) -> Result<(), LockMismatch> {
        match self.active(id) {
            Some(lease) if lease.token == old_token => {
                *lease = Lease::new(new_token);
                Ok(())
            }
            Some(lease) => Err(LockMismatch::held_by(&lease.token)),
            None => Err(LockMismatch::not_locked()),
        }
    }

    /// 判断内容写入是否被允许。未加锁时仅允许写入空文件，且不会因此创建租约。
    pub fn authorize_write(
        &mut self,
        id: &str,
        token: Option<&str>,
        current_len: u64,
    ) -> Result<(), LockMismatch> {
        match self.active(id) {
            Some(lease) if Some(lease.token.as_str()) == token => Ok(()),
            Some(lease) => Err(LockMismatch::held_by(&lease.token)),
            None if current_len == 0 => Ok(()),
            None => Err(LockMismatch::unlocked(UNLOCKED_NON_EMPTY_REASON)),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.leases.len()
    }
}
