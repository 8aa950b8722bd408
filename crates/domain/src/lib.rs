//! Core domain for the sensor failure detection system.
//!
//! This crate contains every domain concept shared by the producer and its
//! adapters: identifiers, value types, the stored document models, and the
//! port traits infrastructure crates implement.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate performs no network or
//! file I/O. It defines *what* is needed; infrastructure crates define *how*
//! to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`DocumentId`, `MachineId`) |
//! | [`types`] | Value types (`Timestamp`, `SensorValues`, `MachineStatus`) |
//! | [`models`] | Stored document models and their collections |
//! | [`store`] | `DocumentStore` port and the in-memory store |
//! | [`repository`] | Typed CRUD and relationship queries |
//! | [`ports`] | `EventPublisher`, `SecretProvider`, `SensorEvent` |
//! | [`errors`] | Error types and `RetryPolicy` |

pub mod errors;
pub mod identifiers;
pub mod models;
pub mod ports;
pub mod repository;
pub mod store;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use errors::{PublishError, RetryPolicy, SecretError, StoreError, StoreResult};
pub use identifiers::{DocumentId, MachineId};
pub use models::{
    Cluster, Collection, Document, DriftEvent, Failure, Machine, ModelVersion, SensorPrediction,
    SensorReading,
};
pub use ports::{EventPublisher, SecretProvider, SensorEvent};
pub use repository::{NewClusterModel, NewPrediction, SensorRepository};
pub use store::{DocumentStore, Filter, FindOptions, MemoryStore, SortOrder};
pub use types::{MachineStatus, SensorValues, Timestamp};
