//! Typed views over wire records and the user-facing type contracts.

use std::fmt;
use std::hash::Hash;

use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::record::{RunState, WireRecord};

/// A node in the workflow graph, implemented by user status enums.
///
/// Codes are the durable identity of a status: they appear in records, topic
/// names, and timeout entries, and must be stable across deployments.
///
/// # Example
///
/// ```
/// use millrace::Status;
///
/// #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// enum OrderStatus {
///     Created,
///     Shipped,
/// }
///
/// impl Status for OrderStatus {
///     fn code(self) -> i32 {
///         match self {
///             OrderStatus::Created => 1,
///             OrderStatus::Shipped => 2,
///         }
///     }
///
///     fn from_code(code: i32) -> Option<Self> {
///         match code {
///             1 => Some(OrderStatus::Created),
///             2 => Some(OrderStatus::Shipped),
///             _ => None,
///         }
///     }
///
///     fn name(self) -> &'static str {
///         match self {
///             OrderStatus::Created => "created",
///             OrderStatus::Shipped => "shipped",
///         }
///     }
/// }
/// ```
pub trait Status: fmt::Debug + Copy + Eq + Hash + Send + Sync + 'static {
    /// The stable integer code of this status.
    fn code(self) -> i32;

    /// Decode a status code. `None` for codes this workflow does not know.
    fn from_code(code: i32) -> Option<Self>;

    /// Human-readable name, used in process names and logs.
    fn name(self) -> &'static str;
}

/// The user payload carried by a run.
///
/// Implemented automatically for any type that is serde round-trippable,
/// defaultable, and cheap to clone into handler views.
pub trait Object:
    Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static
{
}

impl<T> Object for T where T: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static {}

/// Typed view of a record handed to handlers.
///
/// Handlers may mutate [`object`](Run::object) and return the next status;
/// the engine re-serialises the payload when it advances the record. The
/// view does not outlive the handler invocation.
#[derive(Debug, Clone)]
pub struct Run<T, S> {
    pub workflow_name: String,
    pub run_id: String,
    pub foreign_id: String,
    pub status: S,
    pub run_state: RunState,
    /// Mutable staging payload. Written back on advancement.
    pub object: T,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl<T: Object, S: Status> Run<T, S> {
    /// Build a typed view by deserializing a wire record.
    pub(crate) fn from_wire(record: &WireRecord) -> Result<Self> {
        let status = S::from_code(record.status).ok_or_else(|| Error::StatusNotConfigured {
            workflow: record.workflow_name.clone(),
            status: record.status,
        })?;
        let object = unmarshal(&record.object)?;

        Ok(Self {
            workflow_name: record.workflow_name.clone(),
            run_id: record.run_id.clone(),
            foreign_id: record.foreign_id.clone(),
            status,
            run_state: record.run_state,
            object,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

/// Serialize a user payload to its stored byte form.
pub(crate) fn marshal<T: Serialize>(object: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(object)?)
}

/// Deserialize a stored payload into the user type.
pub(crate) fn unmarshal<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}
