//! Port traits implemented by infrastructure crates.
//!
//! - [`EventPublisher`] — sends sensor events to a messaging system.
//! - [`SecretProvider`] — resolves named secrets from a secret store.
//!
//! [`SensorEvent`] is the wire-independent payload handed to publishers.

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{PublishError, SecretError};
use crate::{DocumentId, MachineId, MachineStatus, SensorValues, Timestamp};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One emission from a simulated machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEvent {
    /// Unique identifier of this event.
    pub event_id: Uuid,
    /// Machine that produced the event.
    pub machine_id: MachineId,
    /// Per-machine sequence number, starting at 0 and increasing by one.
    pub sequence: u64,
    /// When the event was emitted.
    pub timestamp: Timestamp,
    /// Original timestamp of the replayed dataset row, if the dataset had one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_timestamp: Option<Timestamp>,
    /// Sensor measurements.
    pub values: SensorValues,
    /// Labelled machine status at emission time.
    pub machine_status: MachineStatus,
    /// Failure episode open for this machine, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_id: Option<DocumentId>,
}

// ---------------------------------------------------------------------------
// Publisher port
// ---------------------------------------------------------------------------

/// Sends batches of sensor events to a messaging system.
///
/// A call either delivers the whole batch or returns an error; callers consult
/// [`PublishError::retry_policy`] to decide whether to re-send.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Short name used in logs (e.g. the target hub).
    fn name(&self) -> &str;

    /// Publishes `events`. An empty slice is a no-op.
    async fn publish(&self, events: &[SensorEvent]) -> Result<(), PublishError>;
}

// ---------------------------------------------------------------------------
// Secret port
// ---------------------------------------------------------------------------

/// Resolves named secrets.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Returns the current value of `name`, or `None` if no such secret exists.
    async fn get_secret(&self, name: &str) -> Result<Option<SecretString>, SecretError>;
}
