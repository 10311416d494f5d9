//! In-memory role scheduler.
//!
//! One async mutex per role; holding the lock is holding the lease. Suited
//! to tests and single-process deployments where every processor shares the
//! scheduler instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{RoleLease, RoleScheduler};
use crate::error::{Error, Result};

/// In-memory [`RoleScheduler`].
#[derive(Clone, Default)]
pub struct MemoryRoleScheduler {
    roles: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl MemoryRoleScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn role_lock(&self, role: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut roles = self.roles.lock().expect("scheduler lock poisoned");
        Arc::clone(roles.entry(role.to_owned()).or_default())
    }
}

#[async_trait]
impl RoleScheduler for MemoryRoleScheduler {
    async fn acquire(&self, shutdown: &CancellationToken, role: &str) -> Result<RoleLease> {
        let lock = self.role_lock(role);

        tokio::select! {
            _ = shutdown.cancelled() => Err(Error::Cancelled),
            guard = lock.lock_owned() => {
                let ctx = shutdown.child_token();
                Ok(RoleLease::new(ctx, move || drop(guard)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_role_is_exclusive() {
        let scheduler = MemoryRoleScheduler::new();
        let shutdown = CancellationToken::new();

        let first = scheduler.acquire(&shutdown, "role-a").await.unwrap();

        let second = tokio::time::timeout(
            Duration::from_millis(50),
            scheduler.acquire(&shutdown, "role-a"),
        )
        .await;
        assert!(second.is_err(), "second acquire should block");

        first.release();
        let third = tokio::time::timeout(
            Duration::from_millis(250),
            scheduler.acquire(&shutdown, "role-a"),
        )
        .await;
        assert!(third.is_ok(), "released role should be grantable");
    }

    #[tokio::test]
    async fn different_roles_do_not_contend() {
        let scheduler = MemoryRoleScheduler::new();
        let shutdown = CancellationToken::new();

        let _a = scheduler.acquire(&shutdown, "role-a").await.unwrap();
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            scheduler.acquire(&shutdown, "role-b"),
        )
        .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn acquire_observes_shutdown() {
        let scheduler = MemoryRoleScheduler::new();
        let shutdown = CancellationToken::new();
        let _held = scheduler.acquire(&shutdown, "role-a").await.unwrap();

        let waiter = {
            let scheduler = scheduler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.acquire(&shutdown, "role-a").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn lease_ctx_cancels_on_release() {
        let scheduler = MemoryRoleScheduler::new();
        let shutdown = CancellationToken::new();

        let lease = scheduler.acquire(&shutdown, "role-a").await.unwrap();
        let ctx = lease.ctx().clone();
        assert!(!ctx.is_cancelled());

        lease.release();
        assert!(ctx.is_cancelled());
    }

    // At most one task observes itself holding a given role at any instant.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn no_two_holders_overlap() {
        let scheduler = MemoryRoleScheduler::new();
        let shutdown = CancellationToken::new();
        let current = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let scheduler = scheduler.clone();
            let shutdown = shutdown.clone();
            let current = Arc::clone(&current);
            let max_seen = Arc::clone(&max_seen);

            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let lease = scheduler.acquire(&shutdown, "shared").await.unwrap();
                    let holders = current.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(holders, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_micros(200)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    lease.release();
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
