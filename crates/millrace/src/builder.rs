//! Workflow construction DSL.
//!
//! A [`Builder`] accumulates the static shape of a workflow (the status
//! graph and the handlers bound to it) and freezes it into a
//! [`Workflow`](crate::Workflow) at [`build`](Builder::build) time.
//! Configuration mistakes (duplicate steps, timeouts without a timeout
//! store, cyclic graphs without consent) panic at build, never at runtime.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use crate::BoxFuture;
use crate::clock::{Clock, SystemClock};
use crate::connector::{ConnectorConstructor, ConnectorEvent};
use crate::error::Result;
use crate::graph::Graph;
use crate::record::{RunState, WireRecord};
use crate::run::{Object, Run, Status, marshal, unmarshal};
use crate::scheduler::RoleScheduler;
use crate::store::{RecordStore, TimeoutStore};
use crate::stream::{Event, EventStreamer};
use crate::workflow::Workflow;

pub(crate) const DEFAULT_POLLING_FREQUENCY: Duration = Duration::from_millis(500);
pub(crate) const DEFAULT_ERR_BACK_OFF: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_LAG_ALERT: Duration = Duration::from_secs(30 * 60);
pub(crate) const DEFAULT_PAUSE_AFTER_ERR_COUNT: u32 = 3;

const DEFAULT_OUTBOX_POLLING_FREQUENCY: Duration = Duration::from_millis(250);
const DEFAULT_OUTBOX_ERR_BACK_OFF: Duration = Duration::from_millis(500);
const DEFAULT_OUTBOX_LAG_ALERT: Duration = Duration::from_secs(60);

const DEFAULT_PAUSED_RETRY_RESUME_AFTER: Duration = Duration::from_secs(60 * 60);
const DEFAULT_PAUSED_RETRY_BATCH_SIZE: usize = 10;

/// A step handler. Mutates the typed payload and returns the next status, or
/// `None` to acknowledge the event without advancing.
pub type StepFn<T, S> =
    Box<dyn for<'a> Fn(&'a mut Run<T, S>) -> BoxFuture<'a, Result<Option<S>>> + Send + Sync>;

/// A callback handler. Receives the caller-supplied payload bytes.
pub type CallbackFn<T, S> = Box<
    dyn for<'a> Fn(&'a mut Run<T, S>, &'a [u8]) -> BoxFuture<'a, Result<Option<S>>> + Send + Sync,
>;

/// Computes when a timeout should fire for a record, or `None` to skip
/// scheduling for this record.
pub type TimerFn<T, S> = Box<
    dyn for<'a> Fn(&'a Run<T, S>, OffsetDateTime) -> BoxFuture<'a, Result<Option<OffsetDateTime>>>
        + Send
        + Sync,
>;

/// Invoked when a timeout expires. Returns the next status, or `None` to
/// complete the timeout without a transition.
pub type TimeoutFn<T, S> = Box<
    dyn for<'a> Fn(&'a mut Run<T, S>, OffsetDateTime) -> BoxFuture<'a, Result<Option<S>>>
        + Send
        + Sync,
>;

/// Handles events from an external source connector. Receives a cloned
/// workflow handle to trigger or call back into workflows.
pub type ConnectorFn<T, S> =
    Box<dyn Fn(Workflow<T, S>, ConnectorEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handles events consumed from another workflow's topic.
pub type WorkflowConnectorFn<T, S> =
    Box<dyn Fn(Workflow<T, S>, Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Observes a run-state change after the corresponding store write commits.
pub type HookFn<T, S> =
    Box<dyn for<'a> Fn(&'a Run<T, S>) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// Scrubs a record's payload during data deletion, returning the replacement
/// object bytes.
pub type CustomDeleteFn = Box<dyn Fn(&WireRecord) -> Result<Vec<u8>> + Send + Sync>;

// Constrains a closure against the timer signature before boxing, so its
// lifetime-generic signature is deduced from the bound.
fn boxed_timer<T, S, F>(f: F) -> TimerFn<T, S>
where
    T: Object,
    S: Status,
    F: for<'a> Fn(&'a Run<T, S>, OffsetDateTime) -> BoxFuture<'a, Result<Option<OffsetDateTime>>>
        + Send
        + Sync
        + 'static,
{
    Box::new(f)
}

/// A timeout fires at `now + duration`.
pub fn duration_timer<T: Object, S: Status>(duration: Duration) -> TimerFn<T, S> {
    boxed_timer(move |_run, now| Box::pin(async move { Ok(Some(now + duration)) }))
}

/// A timeout fires at a fixed instant.
pub fn time_timer<T: Object, S: Status>(at: OffsetDateTime) -> TimerFn<T, S> {
    boxed_timer(move |_run, _now| Box::pin(async move { Ok(Some(at)) }))
}

/// Per-processor tuning knobs. Unset fields fall back to the workflow's
/// default options, then to the engine defaults.
#[derive(Debug, Clone, Default)]
pub struct Options {
    polling_frequency: Option<Duration>,
    err_back_off: Option<Duration>,
    parallel_count: Option<usize>,
    lag: Option<Duration>,
    lag_alert: Option<Duration>,
    pause_after_err_count: Option<u32>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// How often the processor polls when idle.
    pub fn polling_frequency(mut self, value: Duration) -> Self {
        self.polling_frequency = Some(value);
        self
    }

    /// Sleep applied after a processor error before retrying.
    pub fn err_back_off(mut self, value: Duration) -> Self {
        self.err_back_off = Some(value);
        self
    }

    /// Number of sharded processor instances for this status.
    pub fn parallel_count(mut self, value: usize) -> Self {
        self.parallel_count = Some(value);
        self
    }

    /// Hold events back until they are at least this old.
    pub fn lag(mut self, value: Duration) -> Self {
        self.lag = Some(value);
        self
    }

    /// Age at which an unprocessed event is logged as lagging.
    pub fn lag_alert(mut self, value: Duration) -> Self {
        self.lag_alert = Some(value);
        self
    }

    /// Consecutive handler errors on one run before it is paused.
    pub fn pause_after_err_count(mut self, value: u32) -> Self {
        self.pause_after_err_count = Some(value);
        self
    }

    pub(crate) fn resolve(&self, defaults: &Options) -> ResolvedOptions {
        ResolvedOptions {
            polling_frequency: self
                .polling_frequency
                .or(defaults.polling_frequency)
                .unwrap_or(DEFAULT_POLLING_FREQUENCY),
            err_back_off: self
                .err_back_off
                .or(defaults.err_back_off)
                .unwrap_or(DEFAULT_ERR_BACK_OFF),
            parallel_count: self
                .parallel_count
                .or(defaults.parallel_count)
                .unwrap_or(1)
                .max(1),
            lag: self.lag.or(defaults.lag).unwrap_or(Duration::ZERO),
            lag_alert: self
                .lag_alert
                .or(defaults.lag_alert)
                .unwrap_or(DEFAULT_LAG_ALERT),
            pause_after_err_count: self
                .pause_after_err_count
                .or(defaults.pause_after_err_count)
                .unwrap_or(DEFAULT_PAUSE_AFTER_ERR_COUNT),
        }
    }

    fn sets_parallel_count(&self) -> bool {
        self.parallel_count.is_some()
    }

    fn sets_lag(&self) -> bool {
        self.lag.is_some()
    }
}

/// Options after merging per-processor overrides with workflow and engine
/// defaults.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedOptions {
    pub polling_frequency: Duration,
    pub err_back_off: Duration,
    pub parallel_count: usize,
    pub lag: Duration,
    pub lag_alert: Duration,
    pub pause_after_err_count: u32,
}

/// Outbox publisher tuning.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub polling_frequency: Duration,
    pub err_back_off: Duration,
    pub lag_alert: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            polling_frequency: DEFAULT_OUTBOX_POLLING_FREQUENCY,
            err_back_off: DEFAULT_OUTBOX_ERR_BACK_OFF,
            lag_alert: DEFAULT_OUTBOX_LAG_ALERT,
        }
    }
}

/// Automatic retry of paused records.
#[derive(Debug, Clone)]
pub struct PausedRetryConfig {
    pub enabled: bool,
    /// Time a record must have been paused before it is resumed.
    pub resume_after: Duration,
    /// Records resumed per sweep, to reintroduce consumption slowly.
    pub batch_size: usize,
}

impl Default for PausedRetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resume_after: DEFAULT_PAUSED_RETRY_RESUME_AFTER,
            batch_size: DEFAULT_PAUSED_RETRY_BATCH_SIZE,
        }
    }
}

/// Workflow-wide configuration applied at [`Builder::build`].
pub struct BuildOptions<T> {
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) timeout_store: Option<Arc<dyn TimeoutStore>>,
    pub(crate) custom_delete: Option<CustomDeleteFn>,
    pub(crate) default_options: Options,
    pub(crate) outbox: OutboxConfig,
    pub(crate) paused_retry: PausedRetryConfig,
    pub(crate) allow_cycles: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for BuildOptions<T> {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            timeout_store: None,
            custom_delete: None,
            default_options: Options::default(),
            outbox: OutboxConfig::default(),
            paused_retry: PausedRetryConfig::default(),
            allow_cycles: false,
            _marker: PhantomData,
        }
    }
}

impl<T: Object> BuildOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Substitute the time source. Required for deterministic tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Provide the timeout store. Required when any timeouts are configured.
    pub fn with_timeout_store(mut self, store: Arc<dyn TimeoutStore>) -> Self {
        self.timeout_store = Some(store);
        self
    }

    /// Scrub function applied to the typed payload during data deletion.
    ///
    /// Without one, deletion resets the payload to `T::default()`.
    pub fn with_custom_delete<F>(mut self, scrub: F) -> Self
    where
        F: Fn(&mut T) -> Result<()> + Send + Sync + 'static,
    {
        self.custom_delete = Some(Box::new(move |record: &WireRecord| {
            let mut object: T = unmarshal(&record.object)?;
            scrub(&mut object)?;
            marshal(&object)
        }));
        self
    }

    /// Options applied to every processor unless overridden per processor.
    pub fn with_default_options(mut self, options: Options) -> Self {
        self.default_options = options;
        self
    }

    /// Override outbox publisher tuning.
    pub fn with_outbox_config(mut self, config: OutboxConfig) -> Self {
        self.outbox = config;
        self
    }

    /// Enable paused-record retry with a custom resume delay.
    pub fn with_paused_retry(mut self, resume_after: Duration) -> Self {
        self.paused_retry.enabled = true;
        self.paused_retry.resume_after = resume_after;
        self
    }

    /// Keep paused records paused until an explicit resume.
    pub fn disable_paused_retry(mut self) -> Self {
        self.paused_retry.enabled = false;
        self
    }

    /// Permit cycles in the status graph.
    pub fn allow_cycles(mut self) -> Self {
        self.allow_cycles = true;
        self
    }
}

pub(crate) struct StepConfig<T, S> {
    pub from: S,
    pub f: StepFn<T, S>,
    pub options: Options,
}

pub(crate) struct TimeoutTransition<T, S> {
    pub timer: TimerFn<T, S>,
    pub f: TimeoutFn<T, S>,
}

pub(crate) struct TimeoutConfig<T, S> {
    pub from: S,
    pub transitions: Vec<TimeoutTransition<T, S>>,
    pub options: Options,
}

pub(crate) struct ConnectorConfig<T, S> {
    pub name: String,
    pub constructor: Arc<dyn ConnectorConstructor>,
    pub f: ConnectorFn<T, S>,
    pub options: Options,
}

pub(crate) struct WorkflowConnectorConfig<T, S> {
    pub workflow_name: String,
    pub status: i32,
    pub streamer: Arc<dyn EventStreamer>,
    pub f: WorkflowConnectorFn<T, S>,
    pub options: Options,
}

/// Accumulates workflow shape before freezing it into a [`Workflow`].
pub struct Builder<T, S> {
    name: String,
    consumers: HashMap<i32, StepConfig<T, S>>,
    callbacks: HashMap<i32, Vec<CallbackFn<T, S>>>,
    timeouts: HashMap<i32, TimeoutConfig<T, S>>,
    connectors: Vec<ConnectorConfig<T, S>>,
    workflow_connectors: Vec<WorkflowConnectorConfig<T, S>>,
    hooks: HashMap<RunState, HookFn<T, S>>,
    graph: Graph,
}

impl<T: Object, S: Status> Builder<T, S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            consumers: HashMap::new(),
            callbacks: HashMap::new(),
            timeouts: HashMap::new(),
            connectors: Vec::new(),
            workflow_connectors: Vec::new(),
            hooks: HashMap::new(),
            graph: Graph::new(),
        }
    }

    /// Bind the step consumer for `from`. Only one step may consume a
    /// status; a second registration panics.
    pub fn add_step<F>(mut self, from: S, f: F, allowed_destinations: &[S]) -> Self
    where
        F: for<'a> Fn(&'a mut Run<T, S>) -> BoxFuture<'a, Result<Option<S>>>
            + Send
            + Sync
            + 'static,
    {
        if self.consumers.contains_key(&from.code()) {
            panic!(
                "add_step({}): a step already consumes this status",
                from.name()
            );
        }

        for to in allowed_destinations {
            self.graph.add_transition(from.code(), to.code());
        }

        self.consumers.insert(
            from.code(),
            StepConfig {
                from,
                f: Box::new(f),
                options: Options::default(),
            },
        );
        self
    }

    /// Override options for the step consuming `from`.
    pub fn step_options(mut self, from: S, options: Options) -> Self {
        match self.consumers.get_mut(&from.code()) {
            Some(config) => config.options = options,
            None => panic!("step_options({}): no step configured", from.name()),
        }
        self
    }

    /// Register a callback for `from`. Callbacks are unlimited per status
    /// and invoked in registration order.
    pub fn add_callback<F>(mut self, from: S, f: F, allowed_destinations: &[S]) -> Self
    where
        F: for<'a> Fn(&'a mut Run<T, S>, &'a [u8]) -> BoxFuture<'a, Result<Option<S>>>
            + Send
            + Sync
            + 'static,
    {
        for to in allowed_destinations {
            self.graph.add_transition(from.code(), to.code());
        }
        self.callbacks
            .entry(from.code())
            .or_default()
            .push(Box::new(f));
        self
    }

    /// Register a timeout for `from`. Requires a timeout store at build.
    pub fn add_timeout<TF, F>(mut self, from: S, timer: TF, f: F, allowed_destinations: &[S]) -> Self
    where
        TF: for<'a> Fn(&'a Run<T, S>, OffsetDateTime) -> BoxFuture<'a, Result<Option<OffsetDateTime>>>
            + Send
            + Sync
            + 'static,
        F: for<'a> Fn(&'a mut Run<T, S>, OffsetDateTime) -> BoxFuture<'a, Result<Option<S>>>
            + Send
            + Sync
            + 'static,
    {
        for to in allowed_destinations {
            self.graph.add_transition(from.code(), to.code());
        }

        let config = self.timeouts.entry(from.code()).or_insert_with(|| TimeoutConfig {
            from,
            transitions: Vec::new(),
            options: Options::default(),
        });
        config.transitions.push(TimeoutTransition {
            timer: Box::new(timer),
            f: Box::new(f),
        });
        self
    }

    /// Override options for the timeout processors on `from`.
    ///
    /// Timeouts are single-leader and lag-free: configuring `parallel_count`
    /// or `lag` panics.
    pub fn timeout_options(mut self, from: S, options: Options) -> Self {
        if options.sets_parallel_count() {
            panic!("timeout_options({}): cannot configure parallel timeouts", from.name());
        }
        if options.sets_lag() {
            panic!("timeout_options({}): cannot configure lag for timeouts", from.name());
        }
        match self.timeouts.get_mut(&from.code()) {
            Some(config) => config.options = options,
            None => panic!("timeout_options({}): no timeout configured", from.name()),
        }
        self
    }

    /// Register an external source connector. Names must be unique.
    pub fn add_connector<F>(
        mut self,
        name: impl Into<String>,
        constructor: Arc<dyn ConnectorConstructor>,
        f: F,
    ) -> Self
    where
        F: Fn(Workflow<T, S>, ConnectorEvent) -> BoxFuture<'static, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        if self.connectors.iter().any(|config| config.name == name) {
            panic!("add_connector({name}): connector names need to be unique");
        }
        self.connectors.push(ConnectorConfig {
            name,
            constructor,
            f: Box::new(f),
            options: Options::default(),
        });
        self
    }

    /// Override options for a source connector.
    pub fn connector_options(mut self, name: &str, options: Options) -> Self {
        match self.connectors.iter_mut().find(|config| config.name == name) {
            Some(config) => config.options = options,
            None => panic!("connector_options({name}): no connector configured"),
        }
        self
    }

    /// Consume another workflow's `(workflow, status)` topic to drive this
    /// one.
    pub fn add_workflow_connector<F>(
        mut self,
        workflow_name: impl Into<String>,
        status: i32,
        streamer: Arc<dyn EventStreamer>,
        f: F,
    ) -> Self
    where
        F: Fn(Workflow<T, S>, Event) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        self.workflow_connectors.push(WorkflowConnectorConfig {
            workflow_name: workflow_name.into(),
            status,
            streamer,
            f: Box::new(f),
            options: Options::default(),
        });
        self
    }

    /// Override options for a workflow connector.
    pub fn workflow_connector_options(
        mut self,
        workflow_name: &str,
        status: i32,
        options: Options,
    ) -> Self {
        match self
            .workflow_connectors
            .iter_mut()
            .find(|config| config.workflow_name == workflow_name && config.status == status)
        {
            Some(config) => config.options = options,
            None => panic!(
                "workflow_connector_options({workflow_name}-{status}): no workflow connector configured"
            ),
        }
        self
    }

    /// Hook fired when a run is paused.
    pub fn on_pause<F>(self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a Run<T, S>) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.hook(RunState::Paused, hook)
    }

    /// Hook fired when a run is cancelled.
    pub fn on_cancel<F>(self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a Run<T, S>) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.hook(RunState::Cancelled, hook)
    }

    /// Hook fired when a run completes.
    pub fn on_complete<F>(self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a Run<T, S>) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.hook(RunState::Completed, hook)
    }

    fn hook<F>(mut self, run_state: RunState, hook: F) -> Self
    where
        F: for<'a> Fn(&'a Run<T, S>) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.hooks.insert(run_state, Box::new(hook));
        self
    }

    /// Freeze the workflow. Panics on configuration errors; see the module
    /// docs for the full list.
    pub fn build(
        self,
        streamer: Arc<dyn EventStreamer>,
        store: Arc<dyn RecordStore>,
        scheduler: Arc<dyn RoleScheduler>,
        options: BuildOptions<T>,
    ) -> Workflow<T, S> {
        if !self.timeouts.is_empty() && options.timeout_store.is_none() {
            panic!(
                "workflow {}: cannot configure timeouts without providing a timeout store",
                self.name
            );
        }

        if !options.allow_cycles && self.graph.has_cycle() {
            panic!(
                "workflow {}: status graph contains a cycle; opt in with allow_cycles",
                self.name
            );
        }

        Workflow::from_parts(
            crate::workflow::Parts {
                name: self.name,
                graph: self.graph,
                consumers: self.consumers,
                callbacks: self.callbacks,
                timeouts: self.timeouts,
                connectors: self.connectors,
                workflow_connectors: self.workflow_connectors,
                hooks: self.hooks,
            },
            streamer,
            store,
            scheduler,
            options,
        )
    }
}
