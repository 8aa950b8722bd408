//! HTTP probe endpoints for the sensor producer.
//!
//! Two listeners: the health router (`/health`, `/ready`) and the Prometheus
//! metrics router (`/metrics`). Both stop gracefully when their
//! `CancellationToken` fires.

pub mod error;
pub mod exporter;
pub mod health;
pub mod server;

pub use error::ProbeError;
pub use exporter::{build_recorder, describe_metrics, install_recorder, metrics_router};
pub use health::health_router;
pub use server::{bind, serve};
