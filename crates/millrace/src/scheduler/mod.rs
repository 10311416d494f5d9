//! Role scheduling abstraction.
//!
//! A role is an opaque string naming a single-leader work unit. The
//! scheduler guarantees at most one live lease per role across every replica
//! of the engine; processors block on [`RoleScheduler::acquire`] before
//! touching any work.

mod memory;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use memory::MemoryRoleScheduler;

use crate::error::Result;

/// Grants exclusive leases on roles.
#[async_trait]
pub trait RoleScheduler: Send + Sync {
    /// Block until the role is granted or `shutdown` is cancelled.
    ///
    /// Returns [`Error::Cancelled`] when `shutdown` ends first. The returned
    /// lease carries a context token derived from `shutdown` that is
    /// cancelled at the latest when the lease is lost.
    ///
    /// [`Error::Cancelled`]: crate::Error::Cancelled
    async fn acquire(&self, shutdown: &CancellationToken, role: &str) -> Result<RoleLease>;
}

/// An exclusive lease on a role.
///
/// Dropping the lease releases the role; [`release`](RoleLease::release)
/// does so explicitly. Either way the leased context token is cancelled so
/// in-flight work under the lease stops.
pub struct RoleLease {
    ctx: CancellationToken,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl RoleLease {
    /// Build a lease from its derived context token and release action.
    pub fn new(ctx: CancellationToken, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            ctx,
            release: Some(Box::new(release)),
        }
    }

    /// The context derived from the lease. Cancelled when the lease is lost
    /// or released.
    pub fn ctx(&self) -> &CancellationToken {
        &self.ctx
    }

    /// Release the role so another replica can claim it.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for RoleLease {
    fn drop(&mut self) {
        self.ctx.cancel();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}
