//! Document models persisted by the sensor failure detection system.
//!
//! Every model implements [`Document`], which ties it to a fixed
//! [`Collection`] and exposes its [`DocumentId`]. Identifiers are stored
//! under the `_id` key; optional fields are omitted from the stored form
//! when unset.
//!
//! | Model | Collection |
//! |-------|------------|
//! | [`Machine`] | `machines` |
//! | [`SensorReading`] | `readings` |
//! | [`Failure`] | `failures` |
//! | [`SensorPrediction`] | `predictions` |
//! | [`Cluster`] | `clusters` |
//! | [`DriftEvent`] | `drift` |
//! | [`ModelVersion`] | `versions` |

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{DocumentId, MachineId, SensorValues, Timestamp};

/// Model name recorded on predictions when the caller does not supply one.
pub const DEFAULT_MODEL_NAME: &str = "sensor_failure_clustering";

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

/// The named collections documents are stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Machines,
    Readings,
    Failures,
    Predictions,
    Clusters,
    Drift,
    Versions,
}

impl Collection {
    /// Every collection, in a stable order.
    pub const ALL: [Collection; 7] = [
        Self::Machines,
        Self::Readings,
        Self::Failures,
        Self::Predictions,
        Self::Clusters,
        Self::Drift,
        Self::Versions,
    ];

    /// Collection name as used by the store.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Machines => "machines",
            Self::Readings => "readings",
            Self::Failures => "failures",
            Self::Predictions => "predictions",
            Self::Clusters => "clusters",
            Self::Drift => "drift",
            Self::Versions => "versions",
        }
    }

    /// Field sets that must be unique across the collection.
    ///
    /// A document violates a constraint when another document in the same
    /// collection has equal values for every field in the set.
    pub fn unique_constraints(self) -> &'static [&'static [&'static str]] {
        match self {
            Self::Machines => &[&["machine_id"]],
            Self::Predictions => &[&["reading_id", "model_version"]],
            Self::Clusters => &[&["mlflow_run_id"]],
            Self::Readings | Self::Failures | Self::Drift | Self::Versions => &[],
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A model that is stored as a document in a fixed collection.
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    /// Collection this model is stored in.
    const COLLECTION: Collection;

    /// The document's identifier.
    fn id(&self) -> DocumentId;
}

macro_rules! impl_document {
    ($model:ty, $collection:expr) => {
        impl Document for $model {
            const COLLECTION: Collection = $collection;

            fn id(&self) -> DocumentId {
                self.id
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Machines and readings
// ---------------------------------------------------------------------------

/// A physical machine monitored by the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    /// Unique external identifier for the machine.
    pub machine_id: MachineId,
    /// When the machine was first registered.
    pub first_seen: Timestamp,
    /// When the machine last produced data.
    pub last_seen: Timestamp,
}

impl Machine {
    /// Creates a machine first and last seen at `now`.
    pub fn new(machine_id: MachineId, now: Timestamp) -> Self {
        Self {
            id: DocumentId::new_random(),
            machine_id,
            first_seen: now,
            last_seen: now,
        }
    }
}

impl std::fmt::Display for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Machine {}", self.machine_id)
    }
}

/// Sensor measurements taken from a machine at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    /// When the reading was taken.
    pub timestamp: Timestamp,
    /// Sensor measurements.
    pub values: SensorValues,
    /// The [`Machine`] document that produced this reading.
    pub machine_id: DocumentId,
    /// The [`Failure`] that was active when the reading was taken, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_id: Option<DocumentId>,
}

impl std::fmt::Display for SensorReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Reading {} at {}", self.id, self.timestamp)
    }
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// A period during which a machine was failing.
///
/// Active failures have no `end_time`; resolving a failure sets the end time
/// and clears `is_active`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    /// When the failure was first detected.
    pub start_time: Timestamp,
    /// When the failure was resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<Timestamp>,
    /// Whether the failure is ongoing.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// The [`Machine`] document experiencing the failure.
    pub machine_id: DocumentId,
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failure {} from {}", self.id, self.start_time)
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Model outputs
// ---------------------------------------------------------------------------

/// The cluster assigned to a reading by a clustering model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorPrediction {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    /// Identifier of the predicted cluster.
    pub cluster_id: u32,
    /// Version of the model used for the prediction.
    pub model_version: String,
    /// Confidence level of the prediction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    /// When the prediction was made.
    pub prediction_time: Timestamp,
    /// Experiment-tracking run of the model used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mlflow_run_id: Option<String>,
    /// Name of the model.
    #[serde(default = "default_model_name")]
    pub model_name: String,
    /// The [`SensorReading`] document being classified.
    pub reading_id: DocumentId,
}

impl std::fmt::Display for SensorPrediction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Prediction for reading {}: cluster {}",
            self.reading_id, self.cluster_id
        )
    }
}

fn default_model_name() -> String {
    DEFAULT_MODEL_NAME.to_owned()
}

/// A trained clustering model and its quality metrics.
///
/// At most one cluster model is active at a time; see
/// [`crate::SensorRepository::create_cluster_model`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    /// Experiment-tracking run the model was trained in. Unique.
    pub mlflow_run_id: String,
    /// Model registry version number.
    pub mlflow_model_version: u32,
    /// When this record was created.
    pub created_at: Timestamp,
    /// Whether this is the model currently used for predictions.
    #[serde(default)]
    pub is_active: bool,
    /// Number of clusters.
    pub n_clusters: u32,
    /// Clustering quality metric in `[-1.0, 1.0]`.
    pub silhouette_score: f64,
    /// Centroids and per-cluster characteristics.
    pub cluster_profiles: serde_json::Value,
}

impl std::fmt::Display for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cluster {} (run {})", self.id, self.mlflow_run_id)
    }
}

/// A detected shift between the training distribution and live data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftEvent {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    /// When the drift was detected.
    pub detection_time: Timestamp,
    /// Magnitude of the drift.
    pub drift_score: f64,
    /// Statistical summary of the reference distribution.
    pub reference_distribution: serde_json::Value,
    /// Statistical summary of the current distribution.
    pub current_distribution: serde_json::Value,
}

impl std::fmt::Display for DriftEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Drift event at {} (score {})",
            self.detection_time, self.drift_score
        )
    }
}

/// A model version published to the registry and awaiting pickup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    /// Version identifier.
    pub version: String,
    /// Run in which the model is stored.
    pub run_id: String,
    /// When the version was registered.
    pub created_at: Timestamp,
    /// Whether the predictor has picked this version up.
    #[serde(default)]
    pub is_processed: bool,
}

impl std::fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Model version {} (run {})", self.version, self.run_id)
    }
}

impl_document!(Machine, Collection::Machines);
impl_document!(SensorReading, Collection::Readings);
impl_document!(Failure, Collection::Failures);
impl_document!(SensorPrediction, Collection::Predictions);
impl_document!(Cluster, Collection::Clusters);
impl_document!(DriftEvent, Collection::Drift);
impl_document!(ModelVersion, Collection::Versions);
