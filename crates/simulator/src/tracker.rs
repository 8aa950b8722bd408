//! Failure episode tracking.
//!
//! The tracker keeps the document store in step with the event stream:
//! machines are registered on first sight, a transition into a failure status
//! opens a [`domain::Failure`], and the return to `NORMAL` resolves it. Events
//! emitted during an episode carry its id.

use std::collections::HashMap;

use tracing::{debug, info};

use domain::{DocumentId, MachineId, SensorEvent, SensorRepository, StoreResult};

#[derive(Debug)]
struct TrackedMachine {
    document_id: DocumentId,
    active_failure: Option<DocumentId>,
}

/// Follows machine status transitions and records failures.
#[derive(Debug)]
pub struct FailureTracker {
    repository: SensorRepository,
    machines: HashMap<MachineId, TrackedMachine>,
}

impl FailureTracker {
    /// Creates a tracker writing to `repository`.
    pub fn new(repository: SensorRepository) -> Self {
        Self {
            repository,
            machines: HashMap::new(),
        }
    }

    /// The repository failures are written to.
    pub fn repository(&self) -> &SensorRepository {
        &self.repository
    }

    /// Number of machines with an open failure.
    pub fn active_failures(&self) -> usize {
        self.machines
            .values()
            .filter(|m| m.active_failure.is_some())
            .count()
    }

    /// Observes every event in order.
    pub async fn observe_batch(&mut self, events: &mut [SensorEvent]) -> StoreResult<()> {
        for event in events.iter_mut() {
            self.observe(event).await?;
        }
        Ok(())
    }

    async fn register(&self, machine_id: &MachineId) -> StoreResult<DocumentId> {
        let document_id = match self.repository.find_machine(machine_id).await? {
            Some(machine) => {
                self.repository.update_machine_last_seen(machine.id).await?;
                machine.id
            }
            None => self.repository.create_machine(machine_id.clone()).await?,
        };
        debug!(machine = %machine_id, %document_id, "Registered machine");
        Ok(document_id)
    }

    /// Updates machine and failure state for `event` and sets its `failure_id`.
    pub async fn observe(&mut self, event: &mut SensorEvent) -> StoreResult<()> {
        let document_id = match self.machines.get(&event.machine_id) {
            Some(tracked) => {
                let id = tracked.document_id;
                self.repository.update_machine_last_seen(id).await?;
                id
            }
            None => self.register(&event.machine_id).await?,
        };
        let tracked = self
            .machines
            .entry(event.machine_id.clone())
            .or_insert(TrackedMachine {
                document_id,
                active_failure: None,
            });

        match (event.machine_status.is_failure(), tracked.active_failure) {
            (true, None) => {
                let failure_id = self
                    .repository
                    .create_failure(tracked.document_id, Some(event.timestamp))
                    .await?;
                info!(
                    machine = %event.machine_id,
                    %failure_id,
                    status = %event.machine_status,
                    "Failure started"
                );
                tracked.active_failure = Some(failure_id);
            }
            (false, Some(failure_id)) => {
                self.repository
                    .resolve_failure(failure_id, Some(event.timestamp))
                    .await?;
                info!(machine = %event.machine_id, %failure_id, "Failure resolved");
                tracked.active_failure = None;
            }
            _ => {}
        }

        event.failure_id = tracked.active_failure;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use domain::{MachineStatus, MemoryStore, Timestamp};

    fn event(machine: u32, status: MachineStatus) -> SensorEvent {
        SensorEvent {
            event_id: uuid::Uuid::new_v4(),
            machine_id: MachineId::simulated(machine),
            sequence: 0,
            timestamp: Timestamp::now(),
            source_timestamp: None,
            values: [("s", 1.0)].into_iter().collect(),
            machine_status: status,
            failure_id: None,
        }
    }

    fn tracker() -> FailureTracker {
        FailureTracker::new(SensorRepository::new(Arc::new(MemoryStore::new())))
    }

    #[tokio::test]
    async fn machines_are_registered_once() {
        let mut tracker = tracker();
        for _ in 0..3 {
            tracker.observe(&mut event(4, MachineStatus::Normal)).await.unwrap();
        }
        let machine = tracker
            .repository()
            .find_machine(&MachineId::simulated(4))
            .await
            .unwrap()
            .unwrap();
        assert!(machine.last_seen >= machine.first_seen);
        assert_eq!(tracker.machines.len(), 1);
    }

    #[tokio::test]
    async fn failure_episode_opens_and_resolves() {
        let mut tracker = tracker();

        let mut normal = event(1, MachineStatus::Normal);
        tracker.observe(&mut normal).await.unwrap();
        assert_eq!(normal.failure_id, None);

        let mut broken = event(1, MachineStatus::Broken);
        tracker.observe(&mut broken).await.unwrap();
        let failure_id = broken.failure_id.expect("failure opened");
        assert_eq!(tracker.active_failures(), 1);

        let mut recovering = event(1, MachineStatus::Recovering);
        tracker.observe(&mut recovering).await.unwrap();
        assert_eq!(recovering.failure_id, Some(failure_id));

        let active = tracker.repository().get_active_failures().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, failure_id);

        let mut back = event(1, MachineStatus::Normal);
        tracker.observe(&mut back).await.unwrap();
        assert_eq!(back.failure_id, None);
        assert_eq!(tracker.active_failures(), 0);
        assert!(tracker.repository().get_active_failures().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failures_are_tracked_per_machine() {
        let mut tracker = tracker();
        let mut batch = vec![
            event(0, MachineStatus::Broken),
            event(1, MachineStatus::Normal),
            event(2, MachineStatus::Broken),
        ];
        tracker.observe_batch(&mut batch).await.unwrap();
        assert_eq!(tracker.active_failures(), 2);
        assert!(batch[0].failure_id.is_some());
        assert!(batch[1].failure_id.is_none());
        assert_ne!(batch[0].failure_id, batch[2].failure_id);
    }
}
