//! In-memory record and timeout stores.
//!
//! Suitable for tests and single-process deployments. The record store keeps
//! the whole write (record upsert, sequence assignment, outbox row) under one
//! lock, which is the in-memory equivalent of the transactional outbox.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;

use super::{ListFilter, Order, OutboxEventMaker, RecordStore, TimeoutRecord, TimeoutStore};
use crate::error::{Error, Result};
use crate::record::{OutboxRecord, WireRecord};

#[derive(Default)]
struct RecordState {
    records: HashMap<String, WireRecord>,
    // Insertion order of run ids, for stable listing.
    order: Vec<String>,
    outbox: Vec<OutboxRecord>,
    next_seq: i64,
    next_outbox_id: i64,
}

/// In-memory [`RecordStore`].
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    state: Arc<Mutex<RecordState>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().expect("record store lock poisoned")
    }

    /// Total writes accepted so far. Test observability.
    pub fn write_count(&self) -> i64 {
        self.lock().next_seq
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn store(&self, record: &WireRecord, maker: OutboxEventMaker<'_>) -> Result<()> {
        let mut state = self.lock();

        state.next_seq += 1;
        let seq = state.next_seq;

        let event = maker(seq)?;
        let data = serde_json::to_vec(&event)?;

        state.next_outbox_id += 1;
        let outbox_id = state.next_outbox_id;
        state.outbox.push(OutboxRecord {
            id: outbox_id,
            workflow_name: record.workflow_name.clone(),
            data,
            created_at: record.updated_at,
        });

        if !state.records.contains_key(&record.run_id) {
            state.order.push(record.run_id.clone());
        }
        state.records.insert(record.run_id.clone(), record.clone());

        Ok(())
    }

    async fn lookup(&self, run_id: &str) -> Result<WireRecord> {
        self.lock()
            .records
            .get(run_id)
            .cloned()
            .ok_or(Error::RecordNotFound)
    }

    async fn latest(&self, workflow_name: &str, foreign_id: &str) -> Result<WireRecord> {
        let state = self.lock();
        // Newest by creation order, so a fresh run shadows finished ones even
        // when an older record is rewritten later (e.g. data deletion).
        state
            .order
            .iter()
            .rev()
            .filter_map(|run_id| state.records.get(run_id))
            .find(|record| {
                record.workflow_name == workflow_name && record.foreign_id == foreign_id
            })
            .cloned()
            .ok_or(Error::RecordNotFound)
    }

    async fn list(
        &self,
        workflow_name: &str,
        offset: usize,
        limit: usize,
        order: Order,
        filter: ListFilter,
    ) -> Result<Vec<WireRecord>> {
        let state = self.lock();

        let mut matches: Vec<WireRecord> = state
            .order
            .iter()
            .filter_map(|run_id| state.records.get(run_id))
            .filter(|record| record.workflow_name == workflow_name)
            .filter(|record| {
                filter
                    .run_state
                    .map(|run_state| record.run_state == run_state)
                    .unwrap_or(true)
            })
            .filter(|record| {
                filter
                    .updated_before
                    .map(|before| record.updated_at < before)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        if order == Order::Desc {
            matches.reverse();
        }

        Ok(matches.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_outbox_events(
        &self,
        workflow_name: &str,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>> {
        Ok(self
            .lock()
            .outbox
            .iter()
            .filter(|row| row.workflow_name == workflow_name)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_outbox_event(&self, id: i64) -> Result<()> {
        self.lock().outbox.retain(|row| row.id != id);
        Ok(())
    }
}

#[derive(Default)]
struct TimeoutState {
    entries: Vec<TimeoutRecord>,
    next_id: i64,
}

/// In-memory [`TimeoutStore`].
#[derive(Clone, Default)]
pub struct MemoryTimeoutStore {
    state: Arc<Mutex<TimeoutState>>,
}

impl MemoryTimeoutStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TimeoutState> {
        self.state.lock().expect("timeout store lock poisoned")
    }

    /// Number of non-completed entries. Test observability.
    pub fn pending_count(&self) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|entry| !entry.completed)
            .count()
    }
}

#[async_trait]
impl TimeoutStore for MemoryTimeoutStore {
    async fn create(&self, entry: TimeoutRecord) -> Result<()> {
        let mut state = self.lock();

        let duplicate = state.entries.iter().any(|existing| {
            !existing.completed
                && existing.run_id == entry.run_id
                && existing.status == entry.status
                && existing.timer_index == entry.timer_index
        });
        if duplicate {
            return Ok(());
        }

        state.next_id += 1;
        let id = state.next_id;
        state.entries.push(TimeoutRecord { id, ..entry });
        Ok(())
    }

    async fn list_expired(
        &self,
        workflow_name: &str,
        status: i32,
        now: OffsetDateTime,
    ) -> Result<Vec<TimeoutRecord>> {
        Ok(self
            .lock()
            .entries
            .iter()
            .filter(|entry| {
                !entry.completed
                    && entry.workflow_name == workflow_name
                    && entry.status == status
                    && entry.expire_at <= now
            })
            .cloned()
            .collect())
    }

    async fn complete(&self, id: i64) -> Result<()> {
        let mut state = self.lock();
        for entry in &mut state.entries {
            if entry.id == id {
                entry.completed = true;
            }
        }
        Ok(())
    }

    async fn cancel(&self, id: i64) -> Result<()> {
        self.lock().entries.retain(|entry| entry.id != id);
        Ok(())
    }
}
