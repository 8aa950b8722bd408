//! Sensor fleet simulation and event emission.
//!
//! ## Architectural Layer
//!
//! **Orchestration.** Depends only on `domain` ports; the concrete publisher
//! and store are supplied by the composition root.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`dataset`] | CSV dataset loading and synthetic data |
//! | [`fleet`] | Simulated machines replaying the dataset |
//! | [`tracker`] | Failure episode tracking against `SensorRepository` |
//! | [`producer`] | The emission loop, retries, and metrics |
//! | [`status`] | Health state shared with the probes |
//! | [`publishers`] | `LogPublisher` for dry runs |

pub mod dataset;
pub mod fleet;
pub mod producer;
pub mod publishers;
pub mod status;
pub mod tracker;

pub use dataset::{DatasetError, DatasetRow, SensorDataset};
pub use fleet::Fleet;
pub use producer::{
    metric_names, Producer, ProducerError, ProducerSettings, RunSummary, StopReason,
};
pub use publishers::LogPublisher;
pub use status::{HealthSnapshot, HealthState, ProducerStatus};
pub use tracker::FailureTracker;
