//! Durable record representation and event wire types.

use std::collections::HashMap;
use std::fmt;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Lifecycle dimension of a run, orthogonal to its status.
///
/// Run state only ever moves forward over the lattice
/// `Initiated → Running → {Paused ↔ Running} → {Completed | Cancelled}` with
/// the optional data-deletion tail
/// `{Completed | Cancelled} → RequestedDataDeleted → DataDeleted`.
///
/// The integer codes are part of the wire contract and must never be
/// renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Unknown,
    Initiated,
    Running,
    Paused,
    Completed,
    Cancelled,
    RequestedDataDeleted,
    DataDeleted,
}

impl RunState {
    /// The stable integer code for this run state.
    pub fn code(self) -> i32 {
        match self {
            RunState::Unknown => 0,
            RunState::Initiated => 1,
            RunState::Running => 2,
            RunState::Paused => 3,
            RunState::Completed => 4,
            RunState::Cancelled => 5,
            RunState::RequestedDataDeleted => 6,
            RunState::DataDeleted => 7,
        }
    }

    /// Decode a stable integer code. Unrecognised codes map to `Unknown`.
    pub fn from_code(code: i32) -> RunState {
        match code {
            1 => RunState::Initiated,
            2 => RunState::Running,
            3 => RunState::Paused,
            4 => RunState::Completed,
            5 => RunState::Cancelled,
            6 => RunState::RequestedDataDeleted,
            7 => RunState::DataDeleted,
            _ => RunState::Unknown,
        }
    }

    /// Returns `true` once no further status transitions can occur.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Cancelled | RunState::DataDeleted
        )
    }

    /// Returns `true` while step, callback, and timeout handlers may observe
    /// the record.
    pub fn is_processable(self) -> bool {
        matches!(self, RunState::Initiated | RunState::Running)
    }

    /// Whether the lifecycle lattice admits a move to `next`.
    pub fn can_transition_to(self, next: RunState) -> bool {
        match self {
            RunState::Initiated => matches!(next, RunState::Running | RunState::Cancelled),
            RunState::Running => matches!(
                next,
                RunState::Paused | RunState::Completed | RunState::Cancelled
            ),
            RunState::Paused => matches!(next, RunState::Running | RunState::Cancelled),
            RunState::Completed | RunState::Cancelled => {
                matches!(next, RunState::RequestedDataDeleted)
            }
            RunState::RequestedDataDeleted => matches!(next, RunState::DataDeleted),
            RunState::Unknown | RunState::DataDeleted => false,
        }
    }

    /// Human-readable name, for logs.
    pub fn name(self) -> &'static str {
        match self {
            RunState::Unknown => "unknown",
            RunState::Initiated => "initiated",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Completed => "completed",
            RunState::Cancelled => "cancelled",
            RunState::RequestedDataDeleted => "requested_data_deleted",
            RunState::DataDeleted => "data_deleted",
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        RunState::Unknown
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// Run state travels as its bare integer code.
impl Serialize for RunState {
    fn serialize<Ser: Serializer>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error> {
        serializer.serialize_i32(self.code())
    }
}

impl<'de> Deserialize<'de> for RunState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i32::deserialize(deserializer)?;
        Ok(RunState::from_code(code))
    }
}

/// The serialized, durable form of a run.
///
/// `id`, `is_start`, and `is_end` are retained for binary compatibility with
/// older writers. They carry no meaning: readers ignore them and writers
/// leave them at their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRecord {
    #[serde(default)]
    pub id: i64,
    pub run_id: String,
    pub workflow_name: String,
    pub foreign_id: String,
    pub object: Vec<u8>,
    pub status: i32,
    pub run_state: RunState,
    #[serde(default)]
    pub is_start: bool,
    #[serde(default)]
    pub is_end: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Event stream channel name for a `(workflow, status)` pair.
pub fn topic(workflow_name: &str, status: i32) -> String {
    format!("{workflow_name}-{status}")
}

/// Header keys attached to every published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Header {
    #[serde(rename = "workflow-foreign-id")]
    ForeignId,
    #[serde(rename = "workflow-name")]
    WorkflowName,
    #[serde(rename = "topic")]
    Topic,
    #[serde(rename = "run-id")]
    RunId,
}

impl Header {
    /// The wire name of this header.
    pub fn as_str(self) -> &'static str {
        match self {
            Header::ForeignId => "workflow-foreign-id",
            Header::WorkflowName => "workflow-name",
            Header::Topic => "topic",
            Header::RunId => "run-id",
        }
    }
}

/// The event payload buffered in the record store's outbox.
///
/// `id` is the sequence identifier assigned by the store for the record write
/// that produced the event. The outbox publisher uses it as the event key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: i64,
    pub topic: String,
    pub status: i32,
    pub headers: HashMap<Header, String>,
}

/// A row in the record store's outbox, awaiting publication.
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub id: i64,
    pub workflow_name: String,
    pub data: Vec<u8>,
    pub created_at: OffsetDateTime,
}

/// Build the outbox event for a record write assigned sequence id `id`.
pub fn outbox_event_for(id: i64, record: &WireRecord) -> OutboxEvent {
    let topic = topic(&record.workflow_name, record.status);

    let mut headers = HashMap::new();
    headers.insert(Header::ForeignId, record.foreign_id.clone());
    headers.insert(Header::WorkflowName, record.workflow_name.clone());
    headers.insert(Header::Topic, topic.clone());
    headers.insert(Header::RunId, record.run_id.clone());

    OutboxEvent {
        id,
        topic,
        status: record.status,
        headers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_codes_are_stable() {
        let expected = [
            (RunState::Unknown, 0),
            (RunState::Initiated, 1),
            (RunState::Running, 2),
            (RunState::Paused, 3),
            (RunState::Completed, 4),
            (RunState::Cancelled, 5),
            (RunState::RequestedDataDeleted, 6),
            (RunState::DataDeleted, 7),
        ];
        for (state, code) in expected {
            assert_eq!(state.code(), code);
            assert_eq!(RunState::from_code(code), state);
        }
        assert_eq!(RunState::from_code(42), RunState::Unknown);
    }

    #[test]
    fn lattice_never_reverses() {
        assert!(RunState::Initiated.can_transition_to(RunState::Running));
        assert!(RunState::Running.can_transition_to(RunState::Paused));
        assert!(RunState::Paused.can_transition_to(RunState::Running));
        assert!(RunState::Running.can_transition_to(RunState::Completed));
        assert!(RunState::Running.can_transition_to(RunState::Cancelled));
        assert!(RunState::Paused.can_transition_to(RunState::Cancelled));
        assert!(RunState::Completed.can_transition_to(RunState::RequestedDataDeleted));
        assert!(RunState::Cancelled.can_transition_to(RunState::RequestedDataDeleted));
        assert!(RunState::RequestedDataDeleted.can_transition_to(RunState::DataDeleted));

        assert!(!RunState::Completed.can_transition_to(RunState::Running));
        assert!(!RunState::Cancelled.can_transition_to(RunState::Running));
        assert!(!RunState::Paused.can_transition_to(RunState::Completed));
        assert!(!RunState::DataDeleted.can_transition_to(RunState::Running));
        assert!(!RunState::Running.can_transition_to(RunState::Initiated));
    }

    #[test]
    fn run_state_serializes_as_integer() {
        let json = serde_json::to_string(&RunState::Paused).unwrap();
        assert_eq!(json, "3");

        let state: RunState = serde_json::from_str("4").unwrap();
        assert_eq!(state, RunState::Completed);
    }

    #[test]
    fn topic_format() {
        assert_eq!(topic("orders", 3), "orders-3");
    }

    #[test]
    fn outbox_event_carries_all_headers() {
        let record = WireRecord {
            id: 0,
            run_id: "r-1".to_owned(),
            workflow_name: "orders".to_owned(),
            foreign_id: "cust-9".to_owned(),
            object: b"{}".to_vec(),
            status: 2,
            run_state: RunState::Running,
            is_start: false,
            is_end: false,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        };

        let event = outbox_event_for(17, &record);
        assert_eq!(event.id, 17);
        assert_eq!(event.topic, "orders-2");
        assert_eq!(event.headers[&Header::RunId], "r-1");
        assert_eq!(event.headers[&Header::ForeignId], "cust-9");
        assert_eq!(event.headers[&Header::WorkflowName], "orders");
        assert_eq!(event.headers[&Header::Topic], "orders-2");
    }

    #[test]
    fn deprecated_fields_default_when_absent() {
        let json = r#"{
            "run_id": "r-1",
            "workflow_name": "orders",
            "foreign_id": "cust-9",
            "object": [123, 125],
            "status": 1,
            "run_state": 2,
            "created_at": "1970-01-01T00:00:00Z",
            "updated_at": "1970-01-01T00:00:00Z"
        }"#;

        let record: WireRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, 0);
        assert!(!record.is_start);
        assert!(!record.is_end);
        assert_eq!(record.run_state, RunState::Running);
    }

    #[test]
    fn header_wire_names() {
        let json = serde_json::to_string(&Header::ForeignId).unwrap();
        assert_eq!(json, "\"workflow-foreign-id\"");
        assert_eq!(Header::Topic.as_str(), "topic");
    }
}
