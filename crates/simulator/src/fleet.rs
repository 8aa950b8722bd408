//! Simulated machines replaying the dataset.

use std::sync::Arc;

use uuid::Uuid;

use domain::{MachineId, SensorEvent, Timestamp};

use crate::dataset::SensorDataset;

#[derive(Debug)]
struct SimulatedMachine {
    id: MachineId,
    cursor: usize,
    sequence: u64,
    exhausted: bool,
}

/// A fleet of machines, each replaying a staggered section of one dataset.
///
/// Machine `i` of `n` starts at row `i * rows / n`. At the end of the dataset
/// a machine wraps to row 0 when looping, or stops emitting otherwise.
#[derive(Debug)]
pub struct Fleet {
    dataset: Arc<SensorDataset>,
    machines: Vec<SimulatedMachine>,
    loop_dataset: bool,
}

impl Fleet {
    /// Creates `count` machines over `dataset`.
    pub fn new(dataset: Arc<SensorDataset>, count: u32, loop_dataset: bool) -> Self {
        let rows = dataset.len();
        let n = count.max(1) as usize;
        let machines = (0..count)
            .map(|i| SimulatedMachine {
                id: MachineId::simulated(i),
                cursor: i as usize * rows / n,
                sequence: 0,
                exhausted: rows == 0,
            })
            .collect();
        Self {
            dataset,
            machines,
            loop_dataset,
        }
    }

    /// Number of machines, exhausted or not.
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    /// Returns `true` if the fleet has no machines.
    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Identifiers of every machine.
    pub fn machine_ids(&self) -> impl Iterator<Item = &MachineId> {
        self.machines.iter().map(|m| &m.id)
    }

    /// Returns `true` once no machine has rows left to emit.
    pub fn is_exhausted(&self) -> bool {
        self.machines.iter().all(|m| m.exhausted)
    }

    /// Emits one event per active machine, stamped with `now`.
    ///
    /// Events carry no failure id; the failure tracker fills it in.
    pub fn tick(&mut self, now: Timestamp) -> Vec<SensorEvent> {
        let rows = self.dataset.len();
        let mut events = Vec::with_capacity(self.machines.len());

        for machine in self.machines.iter_mut().filter(|m| !m.exhausted) {
            let Some(row) = self.dataset.row(machine.cursor) else {
                machine.exhausted = true;
                continue;
            };
            events.push(SensorEvent {
                event_id: Uuid::new_v4(),
                machine_id: machine.id.clone(),
                sequence: machine.sequence,
                timestamp: now,
                source_timestamp: row.source_timestamp,
                values: row.values.clone(),
                machine_status: row.status,
                failure_id: None,
            });
            machine.sequence += 1;
            machine.cursor += 1;
            if machine.cursor >= rows {
                if self.loop_dataset {
                    machine.cursor = 0;
                } else {
                    machine.exhausted = true;
                }
            }
        }

        events
    }
}
