//! Cron-scheduled triggering.
//!
//! [`Workflow::schedule_trigger`] is a blocking call: it holds a role keyed
//! by `(workflow, "schedule", foreign_id)` and fires a trigger on every tick
//! of the parsed spec. Specs come in two forms: `@every <duration>`
//! shorthand (`@every 90s`, `@every 1h30m`) and cron expressions with
//! seconds precision (including `@hourly`-style macros). All tick arithmetic
//! reads the injected clock so tests stay deterministic.

use std::str::FromStr;
use std::time::Duration;

use chrono::TimeZone;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::run::{Object, Status};
use crate::workflow::Workflow;

pub(crate) enum CronSchedule {
    Every(Duration),
    Cron(Box<cron::Schedule>),
}

impl CronSchedule {
    pub(crate) fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if let Some(rest) = spec.strip_prefix("@every ") {
            let duration = parse_duration(rest.trim())
                .ok_or_else(|| Error::InvalidCronSpec(spec.to_owned()))?;
            if duration.is_zero() {
                return Err(Error::InvalidCronSpec(spec.to_owned()));
            }
            return Ok(CronSchedule::Every(duration));
        }

        let schedule = cron::Schedule::from_str(spec)
            .map_err(|_| Error::InvalidCronSpec(spec.to_owned()))?;
        Ok(CronSchedule::Cron(Box::new(schedule)))
    }

    /// The first tick strictly after `now`, or `None` when the schedule is
    /// exhausted.
    pub(crate) fn next_after(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        match self {
            CronSchedule::Every(duration) => Some(now + *duration),
            CronSchedule::Cron(schedule) => {
                let now = chrono::Utc.timestamp_nanos(now.unix_timestamp_nanos() as i64);
                let next = schedule.after(&now).next()?;
                OffsetDateTime::from_unix_timestamp_nanos(
                    next.timestamp_nanos_opt()? as i128
                )
                .ok()
            }
        }
    }
}

/// Parse compound duration strings: `50ms`, `10s`, `5m`, `1h30m`.
fn parse_duration(input: &str) -> Option<Duration> {
    if input.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits_end = rest.find(|c: char| !c.is_ascii_digit())?;
        if digits_end == 0 {
            return None;
        }
        let value: u64 = rest[..digits_end].parse().ok()?;
        rest = &rest[digits_end..];

        let (unit, remainder) = match rest {
            r if r.starts_with("ms") => ("ms", &r[2..]),
            r if r.starts_with('s') => ("s", &r[1..]),
            r if r.starts_with('m') => ("m", &r[1..]),
            r if r.starts_with('h') => ("h", &r[1..]),
            _ => return None,
        };
        total += match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            _ => return None,
        };
        rest = remainder;
    }
    Some(total)
}

impl<T: Object, S: Status> Workflow<T, S> {
    /// Fire [`trigger`](Workflow::trigger) for `foreign_id` on every tick of
    /// `spec`. Blocks until the workflow stops.
    ///
    /// The schedule role is held while ticking, so replicas cooperate: only
    /// one fires, and another takes over if the holder dies. Trigger errors
    /// are retried indefinitely with backoff except the two configuration
    /// failures ([`Error::WorkflowNotRunning`],
    /// [`Error::StatusNotConfigured`]), which return immediately. A tick
    /// that finds the previous run still in progress is skipped.
    pub async fn schedule_trigger(
        &self,
        foreign_id: &str,
        starting_status: S,
        spec: &str,
    ) -> Result<()> {
        if !self.started() {
            return Err(Error::WorkflowNotRunning);
        }
        if !self.inner.valid_statuses.contains(&starting_status.code()) {
            return Err(Error::StatusNotConfigured {
                workflow: self.inner.name.clone(),
                status: starting_status.code(),
            });
        }
        let schedule = CronSchedule::parse(spec)?;

        let role = format!("{}-schedule-{}", self.inner.name, foreign_id);
        let err_back_off = self
            .inner
            .default_options
            .resolve(&Default::default())
            .err_back_off;
        let root = self.inner.shutdown.clone();

        loop {
            if root.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let lease = match self.inner.scheduler.acquire(&root, &role).await {
                Ok(lease) => lease,
                Err(err) if err.is_cancellation() => return Err(Error::Cancelled),
                Err(err) => {
                    warn!(role = %role, error = %err, "error awaiting schedule role");
                    tokio::select! {
                        _ = root.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(err_back_off) => {}
                    }
                    continue;
                }
            };

            let result = self
                .tick_loop(&schedule, foreign_id, starting_status, lease.ctx(), err_back_off)
                .await;
            lease.release();

            match result {
                Err(Error::Cancelled) if root.is_cancelled() => return Err(Error::Cancelled),
                // Lease lost; loop around and re-acquire.
                Err(Error::Cancelled) => continue,
                Err(err @ (Error::WorkflowNotRunning | Error::StatusNotConfigured { .. })) => {
                    return Err(err);
                }
                Err(err) => {
                    warn!(role = %role, error = %err, "schedule error, retrying");
                    tokio::select! {
                        _ = root.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(err_back_off) => {}
                    }
                }
                Ok(()) => return Ok(()),
            }
        }
    }

    async fn tick_loop(
        &self,
        schedule: &CronSchedule,
        foreign_id: &str,
        starting_status: S,
        ctx: &tokio_util::sync::CancellationToken,
        err_back_off: Duration,
    ) -> Result<()> {
        loop {
            let now = self.inner.clock.now();
            let Some(next) = schedule.next_after(now) else {
                // Exhausted schedules complete cleanly.
                return Ok(());
            };

            let wait: Duration = (next - now).try_into().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }

            match self.trigger(foreign_id, starting_status).await {
                Ok(run_id) => {
                    debug!(
                        workflow = %self.inner.name,
                        foreign_id = %foreign_id,
                        run_id = %run_id,
                        "scheduled trigger fired"
                    );
                }
                Err(Error::WorkflowInProgress) => {
                    debug!(
                        workflow = %self.inner.name,
                        foreign_id = %foreign_id,
                        "previous run still in progress, skipping tick"
                    );
                }
                Err(err @ (Error::WorkflowNotRunning | Error::StatusNotConfigured { .. })) => {
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        workflow = %self.inner.name,
                        foreign_id = %foreign_id,
                        error = %err,
                        "scheduled trigger failed, backing off"
                    );
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(err_back_off) => {}
                    }
                }
            }
        }
    }
}
