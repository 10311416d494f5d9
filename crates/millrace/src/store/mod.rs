//! Storage abstraction for records and timeout entries.
//!
//! The engine writes records through a single façade method,
//! [`RecordStore::store`], which must persist the record and its outbox
//! event atomically. Backends that pair a transactional database with the
//! outbox pattern satisfy this naturally; [`MemoryRecordStore`] scopes the
//! write under one lock.
//!
//! [`MemoryRecordStore`]: crate::MemoryRecordStore

mod memory;

use async_trait::async_trait;
use time::OffsetDateTime;

pub use memory::{MemoryRecordStore, MemoryTimeoutStore};

use crate::error::Result;
use crate::record::{OutboxEvent, OutboxRecord, RunState, WireRecord};

/// Continuation invoked inside the atomic record write with the sequence
/// identifier the store assigned. The returned event must be persisted in
/// the same unit of work as the record; if the continuation fails, the whole
/// write fails.
pub type OutboxEventMaker<'a> = Box<dyn FnOnce(i64) -> Result<OutboxEvent> + Send + 'a>;

/// Ordering for record listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Filter predicates for [`RecordStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Only records currently in this run state.
    pub run_state: Option<RunState>,
    /// Only records last written strictly before this instant.
    pub updated_before: Option<OffsetDateTime>,
}

/// Durable storage for workflow records, with transactional outbox access.
///
/// Implementations must be safe for concurrent use; the engine serialises
/// per-record mutations itself by funnelling them through the role-leased
/// processor that owns the record's current status.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Atomically persist `record` and the outbox event produced by `maker`.
    ///
    /// The store assigns a monotonically increasing sequence identifier per
    /// write and hands it to `maker`; append-only stores may assign a fresh
    /// identifier on every update. The engine later publishes the buffered
    /// event with that identifier as the event key.
    async fn store(&self, record: &WireRecord, maker: OutboxEventMaker<'_>) -> Result<()>;

    /// Fetch a record by run identifier.
    ///
    /// Returns [`Error::RecordNotFound`] when the run does not exist.
    ///
    /// [`Error::RecordNotFound`]: crate::Error::RecordNotFound
    async fn lookup(&self, run_id: &str) -> Result<WireRecord>;

    /// Fetch the newest record for a `(workflow, foreign_id)` pair.
    ///
    /// Returns [`Error::RecordNotFound`] when no run was ever triggered for
    /// the foreign id.
    ///
    /// [`Error::RecordNotFound`]: crate::Error::RecordNotFound
    async fn latest(&self, workflow_name: &str, foreign_id: &str) -> Result<WireRecord>;

    /// List records for a workflow with filtering and offset paging.
    async fn list(
        &self,
        workflow_name: &str,
        offset: usize,
        limit: usize,
        order: Order,
        filter: ListFilter,
    ) -> Result<Vec<WireRecord>>;

    /// Fetch buffered outbox events for a workflow, oldest first.
    async fn list_outbox_events(
        &self,
        workflow_name: &str,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>>;

    /// Remove an outbox row after its event has been published.
    async fn delete_outbox_event(&self, id: i64) -> Result<()>;
}

/// A scheduled deadline owned by the timeout subsystem.
#[derive(Debug, Clone)]
pub struct TimeoutRecord {
    /// Store-assigned identifier.
    pub id: i64,
    pub workflow_name: String,
    pub run_id: String,
    pub foreign_id: String,
    /// The status the timeout fires from.
    pub status: i32,
    /// Index of the timeout registration on that status.
    pub timer_index: usize,
    pub expire_at: OffsetDateTime,
    pub completed: bool,
    pub created_at: OffsetDateTime,
}

/// Durable storage for timeout entries.
///
/// Only required when a workflow configures timeouts.
#[async_trait]
pub trait TimeoutStore: Send + Sync {
    /// Insert a timeout entry.
    ///
    /// Must be idempotent: when a non-completed entry already exists for the
    /// same `(run_id, status, timer_index)`, the call is a no-op. The
    /// inserter relies on this to survive event redelivery.
    async fn create(&self, entry: TimeoutRecord) -> Result<()>;

    /// Non-completed entries for `(workflow, status)` whose `expire_at` is at
    /// or before `now`.
    async fn list_expired(
        &self,
        workflow_name: &str,
        status: i32,
        now: OffsetDateTime,
    ) -> Result<Vec<TimeoutRecord>>;

    /// Mark an entry completed. Completed entries are never returned again.
    async fn complete(&self, id: i64) -> Result<()>;

    /// Discard an entry that will never fire.
    async fn cancel(&self, id: i64) -> Result<()>;
}
