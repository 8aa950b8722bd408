//! The emission loop.
//!
//! Every tick the [`Producer`] collects one event per active machine, runs the
//! batch through the [`FailureTracker`], and hands it to the configured
//! [`EventPublisher`].
//!
//! ## Failure handling
//!
//! | Outcome | Action |
//! |---------|--------|
//! | retryable error | retry with exponential backoff (or the server's `Retry-After`) |
//! | retries exhausted | drop the batch, count one consecutive failure |
//! | `max_consecutive_failures` reached | stop with [`ProducerError::TooManyFailures`] |
//! | non-retryable error | stop with [`ProducerError::Publish`] |
//! | store error | stop with [`ProducerError::Store`] |
//!
//! A published batch resets the consecutive failure count.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use thiserror::Error;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use domain::{EventPublisher, PublishError, RetryPolicy, SensorEvent, StoreError, Timestamp};

use crate::fleet::Fleet;
use crate::status::HealthState;
use crate::tracker::FailureTracker;

/// Metric names recorded by the producer.
pub mod metric_names {
    pub const EVENTS_PUBLISHED: &str = "producer_events_published_total";
    pub const BATCHES_FAILED: &str = "producer_batches_failed_total";
    pub const PUBLISH_RETRIES: &str = "producer_publish_retries_total";
    pub const PUBLISH_DURATION: &str = "producer_publish_duration_seconds";
    pub const ACTIVE_FAILURES: &str = "producer_active_failures";
    pub const MACHINES: &str = "producer_machines";
}

// ---------------------------------------------------------------------------
// Settings and results
// ---------------------------------------------------------------------------

/// Tuning for the emission loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerSettings {
    /// Time between ticks.
    pub interval: Duration,
    /// Retries per batch for retryable errors.
    pub max_retries: u32,
    /// Dropped batches in a row before giving up.
    pub max_consecutive_failures: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on the computed backoff.
    pub max_backoff: Duration,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            max_retries: 3,
            max_consecutive_failures: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl ProducerSettings {
    /// Backoff before retry number `attempt` (0-based): doubles from
    /// `initial_backoff` and is capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

/// Why the loop ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The cancellation token fired.
    Cancelled,
    /// Every machine reached the end of the dataset.
    DatasetExhausted,
}

/// Totals for one run of the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Ticks processed, including ticks that produced no events.
    pub ticks: u64,
    /// Events accepted by the publisher.
    pub events_published: u64,
    /// Batches accepted by the publisher.
    pub batches_published: u64,
    /// Batches dropped after exhausting their retries.
    pub batches_failed: u64,
    /// Publish retries across all batches.
    pub retries: u64,
    /// Why the loop ended.
    pub stop_reason: StopReason,
}

/// Fatal producer errors.
#[derive(Debug, Error)]
pub enum ProducerError {
    /// The publisher returned an error that retrying cannot fix.
    #[error("publisher '{publisher}' failed permanently: {source}")]
    Publish {
        /// Name of the publisher that failed.
        publisher: String,
        /// The non-retryable error.
        #[source]
        source: PublishError,
    },

    /// Too many batches in a row were dropped.
    #[error("{count} consecutive batches failed, last error: {last}")]
    TooManyFailures {
        /// Consecutive dropped batches.
        count: u32,
        /// Error that dropped the last batch.
        last: PublishError,
    },

    /// The failure tracker could not update the document store.
    #[error("failure tracking failed: {0}")]
    Store(#[from] StoreError),
}

enum PublishFailure {
    Fatal(PublishError),
    Exhausted(PublishError),
    Cancelled,
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

/// Drives a [`Fleet`] and publishes its events.
pub struct Producer {
    fleet: Fleet,
    tracker: FailureTracker,
    publisher: Arc<dyn EventPublisher>,
    health: Arc<HealthState>,
    settings: ProducerSettings,
    consecutive_failures: u32,
    ticks: u64,
    events_published: u64,
    batches_published: u64,
    batches_failed: u64,
    retries: u64,
}

impl Producer {
    /// Creates a producer. Nothing runs until [`Producer::run`].
    pub fn new(
        fleet: Fleet,
        tracker: FailureTracker,
        publisher: Arc<dyn EventPublisher>,
        health: Arc<HealthState>,
        settings: ProducerSettings,
    ) -> Self {
        Self {
            fleet,
            tracker,
            publisher,
            health,
            settings,
            consecutive_failures: 0,
            ticks: 0,
            events_published: 0,
            batches_published: 0,
            batches_failed: 0,
            retries: 0,
        }
    }

    /// Runs until cancelled, the dataset is exhausted, or a fatal error.
    ///
    /// The health state is marked stopped on every exit path.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<RunSummary, ProducerError> {
        info!(
            publisher = self.publisher.name(),
            machines = self.fleet.len(),
            interval_ms = self.settings.interval.as_millis() as u64,
            "Producer started"
        );
        let result = self.run_loop(&cancel).await;
        self.health.mark_stopped();

        match &result {
            Ok(stop_reason) => info!(
                ?stop_reason,
                ticks = self.ticks,
                events = self.events_published,
                failed_batches = self.batches_failed,
                "Producer stopped"
            ),
            Err(e) => warn!(error = %e, ticks = self.ticks, "Producer stopped on error"),
        }

        result.map(|stop_reason| RunSummary {
            ticks: self.ticks,
            events_published: self.events_published,
            batches_published: self.batches_published,
            batches_failed: self.batches_failed,
            retries: self.retries,
            stop_reason,
        })
    }

    async fn run_loop(&mut self, cancel: &CancellationToken) -> Result<StopReason, ProducerError> {
        self.health.set_machines(self.fleet.len());
        gauge!(metric_names::MACHINES).set(self.fleet.len() as f64);

        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(StopReason::Cancelled),
                _ = ticker.tick() => {}
            }
            if self.fleet.is_exhausted() {
                return Ok(StopReason::DatasetExhausted);
            }
            self.tick(cancel).await?;
        }
    }

    #[instrument(name = "tick", skip_all, fields(tick = self.ticks))]
    async fn tick(&mut self, cancel: &CancellationToken) -> Result<(), ProducerError> {
        self.ticks += 1;
        let mut events = self.fleet.tick(Timestamp::now());
        if events.is_empty() {
            return Ok(());
        }

        self.tracker.observe_batch(&mut events).await?;
        let active = self.tracker.active_failures();
        self.health.set_active_failures(active);
        gauge!(metric_names::ACTIVE_FAILURES).set(active as f64);

        match self.publish_with_retry(&events, cancel).await {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.events_published += events.len() as u64;
                self.batches_published += 1;
                self.health.record_published(events.len());
                counter!(metric_names::EVENTS_PUBLISHED).increment(events.len() as u64);
                Ok(())
            }
            Err(PublishFailure::Cancelled) => {
                warn!(events = events.len(), "Shutdown during retry, batch dropped");
                Ok(())
            }
            Err(PublishFailure::Fatal(source)) => Err(ProducerError::Publish {
                publisher: self.publisher.name().to_owned(),
                source,
            }),
            Err(PublishFailure::Exhausted(last)) => {
                self.consecutive_failures += 1;
                self.batches_failed += 1;
                self.health.record_failure(self.consecutive_failures);
                counter!(metric_names::BATCHES_FAILED).increment(1);
                warn!(
                    events = events.len(),
                    consecutive_failures = self.consecutive_failures,
                    error = %last,
                    "Batch dropped after retries"
                );
                if self.consecutive_failures >= self.settings.max_consecutive_failures {
                    return Err(ProducerError::TooManyFailures {
                        count: self.consecutive_failures,
                        last,
                    });
                }
                Ok(())
            }
        }
    }

    #[instrument(name = "publish", skip_all, fields(publisher = self.publisher.name(), events = events.len()))]
    async fn publish_with_retry(
        &mut self,
        events: &[SensorEvent],
        cancel: &CancellationToken,
    ) -> Result<(), PublishFailure> {
        let mut attempt = 0;
        loop {
            let started = Instant::now();
            let result = self.publisher.publish(events).await;
            histogram!(metric_names::PUBLISH_DURATION).record(started.elapsed().as_secs_f64());

            let error = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            let delay = match error.retry_policy() {
                RetryPolicy::NonRetryable => return Err(PublishFailure::Fatal(error)),
                RetryPolicy::Retryable { .. } if attempt >= self.settings.max_retries => {
                    return Err(PublishFailure::Exhausted(error));
                }
                RetryPolicy::Retryable { after } => {
                    after.unwrap_or_else(|| self.settings.backoff(attempt))
                }
            };

            attempt += 1;
            self.retries += 1;
            counter!(metric_names::PUBLISH_RETRIES).increment(1);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Publish failed, retrying"
            );

            tokio::select! {
                () = cancel.cancelled() => return Err(PublishFailure::Cancelled),
                () = sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let settings = ProducerSettings::default();
        assert_eq!(settings.backoff(0), Duration::from_millis(200));
        assert_eq!(settings.backoff(1), Duration::from_millis(400));
        assert_eq!(settings.backoff(2), Duration::from_millis(800));
        assert_eq!(settings.backoff(6), Duration::from_secs(10));
        assert_eq!(settings.backoff(40), Duration::from_secs(10));
    }
}
