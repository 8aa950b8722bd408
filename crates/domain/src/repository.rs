//! Typed CRUD operations and relationship queries over a [`DocumentStore`].
//!
//! [`SensorRepository`] converts between the document models and their stored
//! JSON form, and implements the model-specific rules: a new reading bumps its
//! machine's `last_seen`, resolving a failure only touches active failures, and
//! activating a cluster model deactivates every other one.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::{StoreError, StoreResult};
use crate::models::DEFAULT_MODEL_NAME;
use crate::store::{DocumentStore, Filter, FindOptions, ID_FIELD};
use crate::{
    Cluster, Collection, Document, DocumentId, DriftEvent, Failure, Machine, MachineId,
    ModelVersion, SensorPrediction, SensorReading, SensorValues, Timestamp,
};

/// Input for [`SensorRepository::create_prediction`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewPrediction {
    pub reading_id: DocumentId,
    pub cluster_id: u32,
    pub model_version: String,
    pub confidence_score: Option<f64>,
    pub mlflow_run_id: Option<String>,
    /// Defaults to [`DEFAULT_MODEL_NAME`].
    pub model_name: Option<String>,
}

/// Input for [`SensorRepository::create_cluster_model`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewClusterModel {
    pub mlflow_run_id: String,
    pub mlflow_model_version: u32,
    pub n_clusters: u32,
    pub silhouette_score: f64,
    pub cluster_profiles: Value,
    pub is_active: bool,
}

/// Typed access to the sensor documents.
#[derive(Clone)]
pub struct SensorRepository {
    store: Arc<dyn DocumentStore>,
}

impl std::fmt::Debug for SensorRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorRepository").finish_non_exhaustive()
    }
}

impl SensorRepository {
    /// Creates a repository over `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    // -----------------------------------------------------------------------
    // Generic operations
    // -----------------------------------------------------------------------

    /// Stores a new document and returns its identifier.
    pub async fn create_document<D: Document>(&self, document: &D) -> StoreResult<DocumentId> {
        let map = to_map(D::COLLECTION, document)?;
        self.store.insert(D::COLLECTION, map).await?;
        debug!(collection = %D::COLLECTION, id = %document.id(), "Document created");
        Ok(document.id())
    }

    /// Fetches a document by identifier.
    pub async fn get_document_by_id<D: Document>(&self, id: DocumentId) -> StoreResult<Option<D>> {
        self.store
            .get(D::COLLECTION, id)
            .await?
            .map(from_map)
            .transpose()
    }

    /// Sets `fields` on a document. Returns `true` if the document exists.
    pub async fn update_document(
        &self,
        collection: Collection,
        id: DocumentId,
        fields: Map<String, Value>,
    ) -> StoreResult<bool> {
        self.store
            .update_one(collection, &Filter::by_id(id), fields)
            .await
    }

    /// Deletes a document. Returns `true` if it existed.
    pub async fn delete_document(&self, collection: Collection, id: DocumentId) -> StoreResult<bool> {
        self.store.delete(collection, id).await
    }

    /// Fetches every document of type `D` matching `filter`.
    pub async fn get_documents<D: Document>(
        &self,
        filter: &Filter,
        options: &FindOptions,
    ) -> StoreResult<Vec<D>> {
        self.store
            .find(D::COLLECTION, filter, options)
            .await?
            .into_iter()
            .map(from_map)
            .collect()
    }

    // -----------------------------------------------------------------------
    // Machines
    // -----------------------------------------------------------------------

    /// Registers a machine, first and last seen now.
    ///
    /// Fails with `DuplicateKey` if the external identifier is already registered.
    pub async fn create_machine(&self, machine_id: MachineId) -> StoreResult<DocumentId> {
        self.create_document(&Machine::new(machine_id, Timestamp::now()))
            .await
    }

    /// Looks a machine up by its external identifier.
    pub async fn find_machine(&self, machine_id: &MachineId) -> StoreResult<Option<Machine>> {
        let filter = Filter::new().eq("machine_id", machine_id);
        let options = FindOptions::new().limit(1);
        Ok(self
            .get_documents::<Machine>(&filter, &options)
            .await?
            .into_iter()
            .next())
    }

    /// Sets a machine's `last_seen` to now. Returns `true` if the machine exists.
    pub async fn update_machine_last_seen(&self, id: DocumentId) -> StoreResult<bool> {
        self.update_document(
            Collection::Machines,
            id,
            fields([("last_seen", json_of(Timestamp::now()))]),
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Readings
    // -----------------------------------------------------------------------

    /// Records a reading and bumps the machine's `last_seen`.
    ///
    /// `timestamp` defaults to now.
    pub async fn create_sensor_reading(
        &self,
        machine_id: DocumentId,
        values: SensorValues,
        timestamp: Option<Timestamp>,
        failure_id: Option<DocumentId>,
    ) -> StoreResult<DocumentId> {
        let reading = SensorReading {
            id: DocumentId::new_random(),
            timestamp: timestamp.unwrap_or_else(Timestamp::now),
            values,
            machine_id,
            failure_id,
        };
        let id = self.create_document(&reading).await?;
        self.update_machine_last_seen(machine_id).await?;
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Failures
    // -----------------------------------------------------------------------

    /// Opens an active failure for a machine. `start_time` defaults to now.
    pub async fn create_failure(
        &self,
        machine_id: DocumentId,
        start_time: Option<Timestamp>,
    ) -> StoreResult<DocumentId> {
        let failure = Failure {
            id: DocumentId::new_random(),
            start_time: start_time.unwrap_or_else(Timestamp::now),
            end_time: None,
            is_active: true,
            machine_id,
        };
        self.create_document(&failure).await
    }

    /// Resolves an active failure. `end_time` defaults to now.
    ///
    /// Returns `false` if the failure does not exist or is already resolved.
    pub async fn resolve_failure(
        &self,
        failure_id: DocumentId,
        end_time: Option<Timestamp>,
    ) -> StoreResult<bool> {
        let filter = Filter::by_id(failure_id).eq("is_active", true);
        let end = end_time.unwrap_or_else(Timestamp::now);
        self.store
            .update_one(
                Collection::Failures,
                &filter,
                fields([("end_time", json_of(end)), ("is_active", Value::Bool(false))]),
            )
            .await
    }

    // -----------------------------------------------------------------------
    // Model outputs
    // -----------------------------------------------------------------------

    /// Records a prediction for a reading.
    ///
    /// Fails with `DuplicateKey` if the reading already has a prediction from
    /// the same model version.
    pub async fn create_prediction(&self, input: NewPrediction) -> StoreResult<DocumentId> {
        let prediction = SensorPrediction {
            id: DocumentId::new_random(),
            cluster_id: input.cluster_id,
            model_version: input.model_version,
            confidence_score: input.confidence_score,
            prediction_time: Timestamp::now(),
            mlflow_run_id: input.mlflow_run_id,
            model_name: input
                .model_name
                .unwrap_or_else(|| DEFAULT_MODEL_NAME.to_owned()),
            reading_id: input.reading_id,
        };
        self.create_document(&prediction).await
    }

    /// Records a trained cluster model.
    ///
    /// When the new model is active, every previously active model is
    /// deactivated first so at most one model is active.
    pub async fn create_cluster_model(&self, input: NewClusterModel) -> StoreResult<DocumentId> {
        let cluster = Cluster {
            id: DocumentId::new_random(),
            mlflow_run_id: input.mlflow_run_id,
            mlflow_model_version: input.mlflow_model_version,
            created_at: Timestamp::now(),
            is_active: input.is_active,
            n_clusters: input.n_clusters,
            silhouette_score: input.silhouette_score,
            cluster_profiles: input.cluster_profiles,
        };
        let id = self.create_document(&cluster).await?;

        // Inserted first so a rejected model leaves the current one active.
        if cluster.is_active {
            let deactivated = self
                .store
                .update_many(
                    Collection::Clusters,
                    &Filter::new().eq("is_active", true).ne(ID_FIELD, id),
                    fields([("is_active", Value::Bool(false))]),
                )
                .await?;
            debug!(deactivated, "Deactivated previous cluster models");
        }
        Ok(id)
    }

    /// Returns the active cluster model, if any.
    pub async fn active_cluster_model(&self) -> StoreResult<Option<Cluster>> {
        let filter = Filter::new().eq("is_active", true);
        let options = FindOptions::newest_first("created_at").limit(1);
        Ok(self
            .get_documents::<Cluster>(&filter, &options)
            .await?
            .into_iter()
            .next())
    }

    /// Records a drift detection, detected now.
    pub async fn create_drift_event(
        &self,
        drift_score: f64,
        reference_distribution: Value,
        current_distribution: Value,
    ) -> StoreResult<DocumentId> {
        let drift = DriftEvent {
            id: DocumentId::new_random(),
            detection_time: Timestamp::now(),
            drift_score,
            reference_distribution,
            current_distribution,
        };
        self.create_document(&drift).await
    }

    /// Registers a model version.
    pub async fn create_model_version(
        &self,
        version: impl Into<String>,
        run_id: impl Into<String>,
        is_processed: bool,
    ) -> StoreResult<DocumentId> {
        let model_version = ModelVersion {
            id: DocumentId::new_random(),
            version: version.into(),
            run_id: run_id.into(),
            created_at: Timestamp::now(),
            is_processed,
        };
        self.create_document(&model_version).await
    }

    /// Marks a model version as picked up. Returns `true` if it exists.
    pub async fn mark_model_version_processed(&self, id: DocumentId) -> StoreResult<bool> {
        self.update_document(
            Collection::Versions,
            id,
            fields([("is_processed", Value::Bool(true))]),
        )
        .await
    }

    /// Model versions not yet picked up, oldest first.
    pub async fn unprocessed_model_versions(&self) -> StoreResult<Vec<ModelVersion>> {
        let filter = Filter::new().eq("is_processed", false);
        let options =
            FindOptions::new().sort_by("created_at", crate::store::SortOrder::Ascending);
        self.get_documents(&filter, &options).await
    }

    // -----------------------------------------------------------------------
    // Relationship queries
    // -----------------------------------------------------------------------

    /// Readings produced by a machine, newest first.
    pub async fn get_machine_readings(&self, machine_id: DocumentId) -> StoreResult<Vec<SensorReading>> {
        self.get_documents(
            &Filter::new().eq("machine_id", machine_id),
            &FindOptions::newest_first("timestamp"),
        )
        .await
    }

    /// Failures of a machine, newest first.
    pub async fn get_machine_failures(&self, machine_id: DocumentId) -> StoreResult<Vec<Failure>> {
        self.get_documents(
            &Filter::new().eq("machine_id", machine_id),
            &FindOptions::newest_first("start_time"),
        )
        .await
    }

    /// Readings taken during a failure, newest first.
    pub async fn get_failure_readings(&self, failure_id: DocumentId) -> StoreResult<Vec<SensorReading>> {
        self.get_documents(
            &Filter::new().eq("failure_id", failure_id),
            &FindOptions::newest_first("timestamp"),
        )
        .await
    }

    /// Predictions made for a reading.
    pub async fn get_reading_predictions(
        &self,
        reading_id: DocumentId,
    ) -> StoreResult<Vec<SensorPrediction>> {
        self.get_documents(
            &Filter::new().eq("reading_id", reading_id),
            &FindOptions::new(),
        )
        .await
    }

    /// Every active failure across all machines, newest first.
    pub async fn get_active_failures(&self) -> StoreResult<Vec<Failure>> {
        self.get_documents(
            &Filter::new().eq("is_active", true),
            &FindOptions::newest_first("start_time"),
        )
        .await
    }

    /// Readings of a machine with `start <= timestamp <= end`, newest first.
    pub async fn get_readings_in_timerange(
        &self,
        machine_id: DocumentId,
        start: Timestamp,
        end: Timestamp,
    ) -> StoreResult<Vec<SensorReading>> {
        let filter = Filter::new()
            .eq("machine_id", machine_id)
            .gte("timestamp", start)
            .lte("timestamp", end);
        self.get_documents(&filter, &FindOptions::newest_first("timestamp"))
            .await
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn to_map<D: Document>(collection: Collection, document: &D) -> StoreResult<Map<String, Value>> {
    match serde_json::to_value(document)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Malformed {
            collection,
            reason: format!("expected an object, got {other}"),
        }),
    }
}

fn from_map<D: Document>(map: Map<String, Value>) -> StoreResult<D> {
    Ok(serde_json::from_value(Value::Object(map))?)
}

fn json_of(value: impl serde::Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn fields<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect()
}
