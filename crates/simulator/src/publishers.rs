//! Publishers that do not leave the process.

use async_trait::async_trait;
use tracing::{debug, info};

use domain::{EventPublisher, PublishError, SensorEvent};

/// Logs batches instead of sending them. Used for dry runs.
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(&self, events: &[SensorEvent]) -> Result<(), PublishError> {
        if events.is_empty() {
            return Ok(());
        }
        let failing = events.iter().filter(|e| e.machine_status.is_failure()).count();
        info!(events = events.len(), failing, "Dry run: batch not sent");
        for event in events {
            debug!(
                machine = %event.machine_id,
                sequence = event.sequence,
                status = %event.machine_status,
                payload = %serde_json::to_string(event)?,
                "Event"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{MachineId, MachineStatus, Timestamp};

    #[tokio::test]
    async fn log_publisher_accepts_every_batch() {
        let event = SensorEvent {
            event_id: uuid::Uuid::new_v4(),
            machine_id: MachineId::simulated(0),
            sequence: 3,
            timestamp: Timestamp::now(),
            source_timestamp: None,
            values: [("s", 1.0)].into_iter().collect(),
            machine_status: MachineStatus::Broken,
            failure_id: None,
        };
        let publisher = LogPublisher;
        assert_eq!(publisher.name(), "log");
        publisher.publish(&[]).await.unwrap();
        publisher.publish(&[event]).await.unwrap();
    }
}
