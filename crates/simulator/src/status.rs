//! Producer health shared with the probe endpoints.

use std::sync::{PoisonError, RwLock};

use chrono::Utc;
use serde::Serialize;

use domain::Timestamp;

/// Lifecycle status of the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerStatus {
    /// Running, nothing published yet.
    Starting,
    /// The last batch was published.
    Healthy,
    /// One or more batches in a row have been dropped.
    Degraded,
    /// The emission loop has ended.
    Stopped,
}

impl ProducerStatus {
    /// Returns `true` for statuses the liveness probe reports as passing.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Healthy)
    }
}

/// Point-in-time copy of the producer's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub status: ProducerStatus,
    pub started_at: Timestamp,
    pub last_publish: Option<Timestamp>,
    pub consecutive_failures: u32,
    pub events_published: u64,
    pub batches_published: u64,
    pub batches_failed: u64,
    pub active_failures: usize,
    pub machines: usize,
}

impl HealthSnapshot {
    /// Seconds since the producer started.
    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at.as_datetime()).num_seconds().max(0)
    }

    /// Returns `true` once at least one batch has been published.
    pub fn is_ready(&self) -> bool {
        self.batches_published > 0
    }
}

/// Health state written by the producer loop and read by the probes.
#[derive(Debug)]
pub struct HealthState {
    inner: RwLock<HealthSnapshot>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Creates a state in [`ProducerStatus::Starting`].
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HealthSnapshot {
                status: ProducerStatus::Starting,
                started_at: Timestamp::now(),
                last_publish: None,
                consecutive_failures: 0,
                events_published: 0,
                batches_published: 0,
                batches_failed: 0,
                active_failures: 0,
                machines: 0,
            }),
        }
    }

    /// Copies the current state.
    pub fn snapshot(&self) -> HealthSnapshot {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut HealthSnapshot)) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    /// Records a published batch of `events` events.
    pub fn record_published(&self, events: usize) {
        self.update(|s| {
            if s.status != ProducerStatus::Stopped {
                s.status = ProducerStatus::Healthy;
            }
            s.last_publish = Some(Timestamp::now());
            s.consecutive_failures = 0;
            s.events_published += events as u64;
            s.batches_published += 1;
        });
    }

    /// Records a dropped batch; `consecutive` is the current failure streak.
    pub fn record_failure(&self, consecutive: u32) {
        self.update(|s| {
            if s.status != ProducerStatus::Stopped {
                s.status = ProducerStatus::Degraded;
            }
            s.consecutive_failures = consecutive;
            s.batches_failed += 1;
        });
    }

    /// Sets the number of open failure episodes.
    pub fn set_active_failures(&self, count: usize) {
        self.update(|s| s.active_failures = count);
    }

    /// Sets the fleet size.
    pub fn set_machines(&self, count: usize) {
        self.update(|s| s.machines = count);
    }

    /// Marks the emission loop as finished.
    pub fn mark_stopped(&self) {
        self.update(|s| s.status = ProducerStatus::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_follows_publish_outcomes() {
        let health = HealthState::new();
        assert_eq!(health.snapshot().status, ProducerStatus::Starting);
        assert!(!health.snapshot().is_ready());

        health.record_published(5);
        let snap = health.snapshot();
        assert_eq!(snap.status, ProducerStatus::Healthy);
        assert_eq!(snap.events_published, 5);
        assert!(snap.is_ready());
        assert!(snap.last_publish.is_some());

        health.record_failure(1);
        health.record_failure(2);
        let snap = health.snapshot();
        assert_eq!(snap.status, ProducerStatus::Degraded);
        assert_eq!(snap.consecutive_failures, 2);
        assert_eq!(snap.batches_failed, 2);
        assert!(!snap.status.is_live());

        health.record_published(1);
        assert_eq!(health.snapshot().consecutive_failures, 0);
        assert!(health.snapshot().status.is_live());
    }

    #[test]
    fn stopped_is_terminal() {
        let health = HealthState::new();
        health.mark_stopped();
        health.record_published(1);
        assert_eq!(health.snapshot().status, ProducerStatus::Stopped);
        assert_eq!(health.snapshot().events_published, 1);
    }
}
