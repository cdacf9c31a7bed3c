//! 过期租约清理的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::lease::LeaseTable;

/// 启动后台任务，周期性移除过期租约；间隔为 0 时不启动。
pub fn spawn_background_tasks(leases: Arc<LeaseTable>, prune_interval: Duration) {
    if prune_interval.is_zero() {
        return;
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(prune_interval);
        loop {
            interval.tick().await;
            let pruned = leases.prune_expired().await;
            if pruned > 0 {
                debug!(pruned, "expired leases removed");
            }
        }
    });
}
