//! The workflow handle and its runtime.
//!
//! A [`Workflow`] is the frozen product of a [`Builder`](crate::Builder):
//! the status graph, the handlers bound to it, and the backends they run
//! against. [`run`](Workflow::run) boots one role-leased processor per
//! `(status, kind, shard)` triple; [`stop`](Workflow::stop) cancels the root
//! context and waits for every processor to report shutdown.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::builder::{
    BuildOptions, CallbackFn, ConnectorConfig, CustomDeleteFn, HookFn, Options, OutboxConfig,
    PausedRetryConfig, StepConfig, TimeoutConfig, WorkflowConnectorConfig,
    DEFAULT_POLLING_FREQUENCY,
};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::record::{RunState, WireRecord, outbox_event_for};
use crate::run::{Object, Run, Status, marshal};
use crate::scheduler::RoleScheduler;
use crate::store::{RecordStore, TimeoutStore};
use crate::stream::EventStreamer;
use crate::{connector, consumer, lifecycle, outbox, processor, timeout};

/// Lifecycle state reported by each background processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Unknown,
    Idle,
    Running,
    Shutdown,
}

/// Options for [`Workflow::trigger_with`].
#[derive(Debug, Clone)]
pub struct TriggerOptions<T> {
    pub(crate) initial_value: Option<T>,
}

impl<T> Default for TriggerOptions<T> {
    fn default() -> Self {
        Self {
            initial_value: None,
        }
    }
}

impl<T> TriggerOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate the typed payload instead of `T::default()`.
    pub fn with_initial_value(mut self, value: T) -> Self {
        self.initial_value = Some(value);
        self
    }
}

/// Options for [`Workflow::await_status`].
#[derive(Debug, Clone, Default)]
pub struct AwaitOptions {
    pub(crate) poll_frequency: Option<Duration>,
    pub(crate) timeout: Option<Duration>,
}

impl AwaitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// How often to poll the record store.
    pub fn poll_frequency(mut self, value: Duration) -> Self {
        self.poll_frequency = Some(value);
        self
    }

    /// Bound the total wait; [`Error::AwaitTimeout`] afterwards.
    pub fn timeout(mut self, value: Duration) -> Self {
        self.timeout = Some(value);
        self
    }
}

pub(crate) struct Parts<T, S> {
    pub name: String,
    pub graph: Graph,
    pub consumers: HashMap<i32, StepConfig<T, S>>,
    pub callbacks: HashMap<i32, Vec<CallbackFn<T, S>>>,
    pub timeouts: HashMap<i32, TimeoutConfig<T, S>>,
    pub connectors: Vec<ConnectorConfig<T, S>>,
    pub workflow_connectors: Vec<WorkflowConnectorConfig<T, S>>,
    pub hooks: HashMap<RunState, HookFn<T, S>>,
}

pub(crate) struct Inner<T, S> {
    pub name: String,
    pub clock: Arc<dyn Clock>,
    pub streamer: Arc<dyn EventStreamer>,
    pub store: Arc<dyn RecordStore>,
    pub timeout_store: Option<Arc<dyn TimeoutStore>>,
    pub scheduler: Arc<dyn RoleScheduler>,

    pub consumers: HashMap<i32, StepConfig<T, S>>,
    pub callbacks: HashMap<i32, Vec<CallbackFn<T, S>>>,
    pub timeouts: HashMap<i32, TimeoutConfig<T, S>>,
    pub connectors: Vec<ConnectorConfig<T, S>>,
    pub workflow_connectors: Vec<WorkflowConnectorConfig<T, S>>,
    pub hooks: HashMap<RunState, HookFn<T, S>>,
    pub custom_delete: Option<CustomDeleteFn>,

    pub graph: Graph,
    pub endpoints: BTreeSet<i32>,
    pub valid_statuses: BTreeSet<i32>,

    pub default_options: Options,
    pub outbox: OutboxConfig,
    pub paused_retry: PausedRetryConfig,

    pub error_counter: crate::error_counter::ErrorCounter,
    // Engine-wide process state map; the only shared mutable structure.
    states: Mutex<HashMap<String, ProcessState>>,
    pub shutdown: CancellationToken,
    started: AtomicBool,
}

/// A built workflow. Cheap to clone; all clones share the same runtime.
pub struct Workflow<T, S> {
    pub(crate) inner: Arc<Inner<T, S>>,
}

impl<T, S> Clone for Workflow<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Object, S: Status> Workflow<T, S> {
    pub(crate) fn from_parts(
        parts: Parts<T, S>,
        streamer: Arc<dyn EventStreamer>,
        store: Arc<dyn RecordStore>,
        scheduler: Arc<dyn RoleScheduler>,
        options: BuildOptions<T>,
    ) -> Self {
        let endpoints = parts.graph.endpoints();
        let valid_statuses = parts.graph.nodes();

        Self {
            inner: Arc::new(Inner {
                name: parts.name,
                clock: options.clock,
                streamer,
                store,
                timeout_store: options.timeout_store,
                scheduler,
                consumers: parts.consumers,
                callbacks: parts.callbacks,
                timeouts: parts.timeouts,
                connectors: parts.connectors,
                workflow_connectors: parts.workflow_connectors,
                hooks: parts.hooks,
                custom_delete: options.custom_delete,
                graph: parts.graph,
                endpoints,
                valid_statuses,
                default_options: options.default_options,
                outbox: options.outbox,
                paused_retry: options.paused_retry,
                error_counter: crate::error_counter::ErrorCounter::new(),
                states: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// The workflow name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Start every background processor. Idempotent; subsequent calls are
    /// no-ops.
    pub fn run(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        for (&code, config) in &self.inner.consumers {
            let resolved = config.options.resolve(&self.inner.default_options);
            let total = resolved.parallel_count;
            for shard in 1..=total {
                let role = format!("{}-{}-consumer-{}-of-{}", self.name(), code, shard, total);
                let process_name = format!(
                    "{}-{}-consumer-{}-of-{}",
                    self.name(),
                    config.from.name(),
                    shard,
                    total
                );
                self.spawn_leased(
                    role,
                    process_name,
                    resolved.err_back_off,
                    move |w, ctx| consumer::step_process(w, ctx, code, shard, total),
                );
            }
        }

        for &code in self.inner.timeouts.keys() {
            let config = &self.inner.timeouts[&code];
            let resolved = config.options.resolve(&self.inner.default_options);

            let inserter_role = format!("{}-{}-timeout-consumer", self.name(), code);
            self.spawn_leased(
                inserter_role,
                format!("{}-{}-timeout-consumer", self.name(), config.from.name()),
                resolved.err_back_off,
                move |w, ctx| timeout::inserter_process(w, ctx, code),
            );

            let poller_role = format!("{}-{}-timeout", self.name(), code);
            self.spawn_leased(
                poller_role,
                format!("{}-{}-timeout", self.name(), config.from.name()),
                resolved.err_back_off,
                move |w, ctx| timeout::poller_process(w, ctx, code),
            );
        }

        for (index, config) in self.inner.connectors.iter().enumerate() {
            let resolved = config.options.resolve(&self.inner.default_options);
            let total = resolved.parallel_count;
            for shard in 1..=total {
                let role = format!(
                    "{}-connector-{}-{}-of-{}",
                    self.name(),
                    config.name,
                    shard,
                    total
                );
                self.spawn_leased(
                    role.clone(),
                    role,
                    resolved.err_back_off,
                    move |w, ctx| connector::connector_process(w, ctx, index, shard, total),
                );
            }
        }

        for (index, config) in self.inner.workflow_connectors.iter().enumerate() {
            let resolved = config.options.resolve(&self.inner.default_options);
            let total = resolved.parallel_count;
            for shard in 1..=total {
                let role = format!(
                    "{}-connector-{}-{}-{}-of-{}",
                    self.name(),
                    config.workflow_name,
                    config.status,
                    shard,
                    total
                );
                self.spawn_leased(
                    role.clone(),
                    role,
                    resolved.err_back_off,
                    move |w, ctx| connector::workflow_connector_process(w, ctx, index, shard, total),
                );
            }
        }

        let outbox_role = format!("{}-outbox", self.name());
        let outbox_back_off = self.inner.outbox.err_back_off;
        self.spawn_leased(outbox_role.clone(), outbox_role, outbox_back_off, |w, ctx| {
            outbox::publish_process(w, ctx)
        });

        if self.inner.paused_retry.enabled {
            let role = format!("{}-paused-records-retry", self.name());
            self.spawn_leased(
                role.clone(),
                role,
                DEFAULT_POLLING_FREQUENCY,
                |w, ctx| lifecycle::paused_retry_process(w, ctx),
            );
        }

        let delete_role = format!("{}-delete", self.name());
        self.spawn_leased(delete_role.clone(), delete_role, DEFAULT_POLLING_FREQUENCY, |w, ctx| {
            lifecycle::data_deletion_process(w, ctx)
        });
    }

    fn spawn_leased<F, Fut>(
        &self,
        role: String,
        process_name: String,
        err_back_off: Duration,
        f: F,
    ) where
        F: Fn(Workflow<T, S>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let workflow = self.clone();
        tokio::spawn(processor::run_leased(
            workflow,
            role,
            process_name,
            err_back_off,
            f,
        ));
    }

    /// Cancel the root context and wait until every tracked processor
    /// reports [`ProcessState::Shutdown`].
    pub async fn stop(&self) {
        if !self.inner.started.load(Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();

        loop {
            let running = self
                .states()
                .values()
                .filter(|state| !matches!(state, ProcessState::Unknown | ProcessState::Shutdown))
                .count();
            if running == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Snapshot of every processor's reported state, keyed by process name.
    pub fn states(&self) -> HashMap<String, ProcessState> {
        self.inner.states.lock().expect("state lock poisoned").clone()
    }

    pub(crate) fn update_state(&self, process_name: &str, state: ProcessState) {
        let mut states = self.inner.states.lock().expect("state lock poisoned");
        states.insert(process_name.to_owned(), state);
    }

    pub(crate) fn started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Kick off a run for `foreign_id` starting at `starting_status`.
    ///
    /// The foreign id should be deterministic for the thing the workflow
    /// runs for; it is the only way to correlate callbacks and connected
    /// workflows back to this run. Returns the new run identifier.
    pub async fn trigger(&self, foreign_id: &str, starting_status: S) -> Result<String> {
        self.trigger_with(foreign_id, starting_status, TriggerOptions::default())
            .await
    }

    /// [`trigger`](Workflow::trigger) with options, e.g. a pre-populated
    /// initial payload.
    pub async fn trigger_with(
        &self,
        foreign_id: &str,
        starting_status: S,
        options: TriggerOptions<T>,
    ) -> Result<String> {
        if !self.started() {
            return Err(Error::WorkflowNotRunning);
        }
        if !self.inner.valid_statuses.contains(&starting_status.code()) {
            return Err(Error::StatusNotConfigured {
                workflow: self.inner.name.clone(),
                status: starting_status.code(),
            });
        }

        match self.inner.store.latest(&self.inner.name, foreign_id).await {
            Ok(latest) => {
                let state = latest.run_state;
                let blocked = if state.is_terminal() {
                    false
                } else if state == RunState::Paused {
                    // A paused run only blocks new triggers while paused
                    // retry may still resume it.
                    self.inner.paused_retry.enabled
                } else {
                    true
                };
                if blocked {
                    return Err(Error::WorkflowInProgress);
                }
            }
            Err(Error::RecordNotFound) => {}
            Err(err) => return Err(err),
        }

        let object = marshal(&options.initial_value.unwrap_or_default())?;
        let now = self.inner.clock.now();
        let record = WireRecord {
            id: 0,
            run_id: Uuid::new_v4().to_string(),
            workflow_name: self.inner.name.clone(),
            foreign_id: foreign_id.to_owned(),
            object,
            status: starting_status.code(),
            run_state: RunState::Running,
            is_start: false,
            is_end: false,
            created_at: now,
            updated_at: now,
        };
        self.update(&record).await?;

        Ok(record.run_id)
    }

    /// Block until the run reaches `status`, the workflow stops, or the
    /// configured deadline passes.
    ///
    /// `foreign_id` is the correlation key the run was triggered with; a
    /// record whose foreign id does not match is never returned.
    pub async fn await_status(
        &self,
        foreign_id: &str,
        run_id: &str,
        status: S,
        options: AwaitOptions,
    ) -> Result<Run<T, S>> {
        let poll = options
            .poll_frequency
            .unwrap_or(DEFAULT_POLLING_FREQUENCY);
        let deadline = options.timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            match self.inner.store.lookup(run_id).await {
                Ok(record)
                    if record.foreign_id == foreign_id && record.status == status.code() =>
                {
                    return Run::from_wire(&record);
                }
                // Not there yet; the trigger's write may still be in flight.
                Ok(_) | Err(Error::RecordNotFound) => {}
                Err(err) => return Err(err),
            }

            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return Err(Error::AwaitTimeout);
                }
            }

            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Persist `record` together with its outbox event. The store assigns
    /// the sequence identifier that becomes the event key.
    pub(crate) async fn update(&self, record: &WireRecord) -> Result<()> {
        self.inner
            .store
            .store(record, Box::new(move |id| Ok(outbox_event_for(id, record))))
            .await
    }

    /// Advance a run to `next`, re-serialising the handler-mutated payload.
    ///
    /// Validates the transition against the static graph, promotes the run
    /// state (`Initiated` becomes `Running`; endpoints become `Completed`),
    /// and fires the completion hook after the committed write.
    pub(crate) async fn advance(&self, run: &Run<T, S>, next: S) -> Result<WireRecord> {
        if !self.inner.graph.is_valid(run.status.code(), next.code()) {
            return Err(Error::InvalidTransition {
                workflow: self.inner.name.clone(),
                from: run.status.code(),
                to: next.code(),
            });
        }

        let object = marshal(&run.object)?;
        let mut run_state = run.run_state;
        if run_state == RunState::Initiated {
            run_state = RunState::Running;
        }
        let completed = self.inner.endpoints.contains(&next.code());
        if completed {
            run_state = RunState::Completed;
        }

        let record = WireRecord {
            id: 0,
            run_id: run.run_id.clone(),
            workflow_name: self.inner.name.clone(),
            foreign_id: run.foreign_id.clone(),
            object,
            status: next.code(),
            run_state,
            is_start: false,
            is_end: false,
            created_at: run.created_at,
            updated_at: self.inner.clock.now(),
        };
        self.update(&record).await?;

        if completed {
            self.fire_hook(RunState::Completed, &record).await;
        }
        Ok(record)
    }

    /// Move a record over the run-state lattice, firing the matching hook.
    pub(crate) async fn set_run_state(
        &self,
        record: &WireRecord,
        next: RunState,
    ) -> Result<WireRecord> {
        if !record.run_state.can_transition_to(next) {
            return Err(Error::InvalidRunStateTransition {
                from: record.run_state,
                to: next,
            });
        }

        let mut updated = record.clone();
        updated.run_state = next;
        updated.updated_at = self.inner.clock.now();
        self.update(&updated).await?;

        self.fire_hook(next, &updated).await;
        Ok(updated)
    }

    /// Fire the hook registered for `run_state`, if any. Hooks observe a
    /// committed write; failures are logged, not retried.
    pub(crate) async fn fire_hook(&self, run_state: RunState, record: &WireRecord) {
        let Some(hook) = self.inner.hooks.get(&run_state) else {
            return;
        };
        match Run::<T, S>::from_wire(record) {
            Ok(run) => {
                if let Err(error) = hook(&run).await {
                    warn!(
                        workflow = %self.inner.name,
                        run_id = %record.run_id,
                        run_state = %run_state,
                        error = %error,
                        "run state hook failed"
                    );
                }
            }
            Err(error) => {
                warn!(
                    workflow = %self.inner.name,
                    run_id = %record.run_id,
                    error = %error,
                    "could not build typed run for hook"
                );
            }
        }
    }
}
