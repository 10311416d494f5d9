//! Synchronous callback dispatch.
//!
//! Callbacks are invoked from the public API rather than a long-lived
//! processor: an external system hands the engine a payload for a foreign
//! id, and the first registered callback that returns a next status advances
//! the record exactly as a step would.

use tracing::debug;

use crate::error::{Error, Result};
use crate::run::{Object, Run, Status};
use crate::workflow::Workflow;

impl<T: Object, S: Status> Workflow<T, S> {
    /// Deliver `payload` to the callbacks registered for `status`.
    ///
    /// Locates the newest record for `foreign_id`; it must currently sit at
    /// `status` with a processable run state. Callbacks run in registration
    /// order and the first one returning a next status wins.
    pub async fn callback(&self, foreign_id: &str, status: S, payload: &[u8]) -> Result<()> {
        let callbacks = self
            .inner
            .callbacks
            .get(&status.code())
            .filter(|registered| !registered.is_empty())
            .ok_or(Error::StatusNotConfigured {
                workflow: self.inner.name.clone(),
                status: status.code(),
            })?;

        let record = self.inner.store.latest(&self.inner.name, foreign_id).await?;

        if record.status != status.code() {
            // The run is elsewhere in the graph; treat like an off-graph
            // transition attempt.
            return Err(Error::InvalidTransition {
                workflow: self.inner.name.clone(),
                from: record.status,
                to: status.code(),
            });
        }
        if !record.run_state.is_processable() {
            return Err(Error::RunInactive {
                run_state: record.run_state,
            });
        }

        let mut run = Run::from_wire(&record)?;
        for callback in callbacks {
            if let Some(next) = callback(&mut run, payload).await? {
                self.advance(&run, next).await?;
                return Ok(());
            }
        }

        debug!(
            workflow = %self.inner.name,
            foreign_id = %foreign_id,
            status = status.code(),
            "no callback produced a transition"
        );
        Ok(())
    }
}
