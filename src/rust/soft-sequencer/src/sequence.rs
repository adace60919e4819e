// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use seq_registers::layout::{control, ram};

use crate::manager::{IrqState, ScanEvent, Shared};
use crate::trigger::{DEFAULT_SOURCE, TriggerSource};
use crate::{Error, Result};

/// Index of a soft sequence in the interrupt visible state of its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SequenceId(usize);

impl SequenceId {
    pub(crate) fn new(index: usize) -> Self {
        SequenceId(index)
    }

    pub(crate) fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum RunMode {
    /// Re-arm on every trigger
    Normal = 0,
    /// Disarm after one run
    #[default]
    Single = 2,
}

impl RunMode {
    pub(crate) fn repeat_bits(self) -> u32 {
        match self {
            RunMode::Normal => control::REPEAT_NORMAL,
            RunMode::Single => control::REPEAT_SINGLE,
        }
    }
}

impl TryFrom<u32> for RunMode {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(RunMode::Normal),
            2 => Ok(RunMode::Single),
            _ => Err(Error::new(format!("Unknown sequencer run mode {value}"))),
        }
    }
}

/// Timestamp/event code table plus how it is triggered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceConfig {
    /// Event clock ticks
    pub times: Vec<u64>,
    pub codes: Vec<u8>,
    pub mode: RunMode,
    /// Encoded [`TriggerSource`]
    pub source: u32,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        SequenceConfig {
            times: Vec::new(),
            codes: Vec::new(),
            mode: RunMode::Single,
            source: DEFAULT_SOURCE,
        }
    }
}

impl SequenceConfig {
    /// Committed configuration of a sequence never committed: the sentinel alone.
    pub(crate) fn idle() -> Self {
        SequenceConfig {
            times: vec![0],
            codes: vec![ram::END_OF_SEQUENCE_CODE],
            ..Default::default()
        }
    }

    /// Freeze into the form written to hardware.
    ///
    /// The tables are cut to the shorter of the two, and terminated with the
    /// end-of-sequence code one tick after the last event unless they already
    /// end with it. Timestamps must be strictly increasing and below the
    /// rollover value.
    pub fn pack(&self, capacity: usize) -> Result<SequenceConfig> {
        let mut conf = self.clone();
        let len = conf.times.len().min(conf.codes.len());
        conf.times.truncate(len);
        conf.codes.truncate(len);
        validate_timestamps(&conf.times)?;

        if conf.codes.last() != Some(&ram::END_OF_SEQUENCE_CODE) {
            let time = conf.times.last().map_or(0, |last| last + 1);
            if time >= ram::ROLLOVER_TIMESTAMP {
                return Err(Error::new(
                    "Time overflow: no room for the end-of-sequence event",
                ));
            }
            conf.times.push(time);
            conf.codes.push(ram::END_OF_SEQUENCE_CODE);
        }

        if conf.times.len() > capacity {
            return Err(Error::new(format!(
                "Sequence too long: {} entries, at most {capacity}",
                conf.times.len()
            )));
        }
        Ok(conf)
    }
}

/// Strictly increasing and below the rollover value.
pub(crate) fn validate_timestamps(times: &[u64]) -> Result<()> {
    if let Some(index) = times.iter().position(|t| *t >= ram::ROLLOVER_TIMESTAMP) {
        return Err(Error::new(format!(
            "Time overflow at index {index}, rollover not supported"
        )));
    }
    if let Some(index) = times.windows(2).position(|w| w[1] <= w[0]) {
        return Err(Error::new(format!(
            "Non-monotonic timestamp array at index {}",
            index + 1
        )));
    }
    Ok(())
}

pub(crate) fn seconds_to_ticks(seconds: &[f64], clock_frequency: f64) -> Result<Vec<u64>> {
    seconds
        .iter()
        .map(|&s| {
            if !s.is_finite() || s < 0.0 {
                return Err(Error::new(format!("Invalid timestamp {s} s")));
            }
            let ticks = (s * clock_frequency).round();
            if ticks >= ram::ROLLOVER_TIMESTAMP as f64 {
                return Err(Error::new(format!(
                    "Time overflow: {s} s exceeds the sequencer range"
                )));
            }
            Ok(ticks as u64)
        })
        .collect()
}

/// Task context part of a soft sequence, behind the sequence lock.
#[derive(Debug)]
struct TaskState {
    scratch: SequenceConfig,
    /// Scratch has been frozen into the committed configuration
    committed: bool,
    last_error: String,
}

/// A software defined sequence competing for the engines of its manager.
///
/// Edits go to a scratch configuration. [`SoftSequence::commit`] freezes it,
/// and the frozen configuration is what [`SoftSequence::load`] puts into an
/// engine. Dropping the sequence unloads it.
pub struct SoftSequence {
    id: SequenceId,
    name: Arc<str>,
    shared: Arc<Shared>,
    task: Mutex<TaskState>,
}

impl SoftSequence {
    pub(crate) fn new(id: SequenceId, name: Arc<str>, shared: Arc<Shared>) -> Self {
        SoftSequence {
            id,
            name,
            shared,
            task: Mutex::new(TaskState {
                scratch: SequenceConfig::default(),
                committed: false,
                last_error: String::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_task(&self) -> MutexGuard<'_, TaskState> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `op` under the sequence lock.
    ///
    /// `op` reports whether observers should be told about a change. Failures
    /// are kept as the last error text.
    fn run(&self, op: impl FnOnce(&mut TaskState) -> Result<bool>) -> Result<()> {
        let mut task = self.lock_task();
        let result = op(&mut task);
        if let Err(err) = &result {
            task.last_error = err.to_string();
        }
        drop(task);

        match result {
            Ok(changed) => {
                if changed {
                    self.shared.notify(&self.name, ScanEvent::Changed);
                }
                Ok(())
            }
            Err(err) => {
                self.shared.notify(&self.name, ScanEvent::Error);
                Err(err)
            }
        }
    }

    fn edit_scratch(&self, edit: impl FnOnce(&mut SequenceConfig)) -> Result<()> {
        self.run(|task| {
            edit(&mut task.scratch);
            task.committed = false;
            Ok(true)
        })
    }

    pub fn set_timestamps(&self, times: &[u64]) -> Result<()> {
        let checked = validate_timestamps(times);
        self.run(|task| {
            checked?;
            task.scratch.times = times.to_vec();
            task.committed = false;
            Ok(true)
        })
    }

    /// Set timestamps given in seconds, scaled by the event clock.
    pub fn set_timestamps_seconds(&self, seconds: &[f64]) -> Result<()> {
        let clock = self.shared.family.clock_frequency();
        let ticks = seconds_to_ticks(seconds, clock)
            .and_then(|ticks| validate_timestamps(&ticks).map(|_| ticks));
        self.run(|task| {
            task.scratch.times = ticks?;
            task.committed = false;
            Ok(true)
        })
    }

    pub fn set_event_codes(&self, codes: &[u8]) -> Result<()> {
        self.edit_scratch(|scratch| scratch.codes = codes.to_vec())
    }

    /// Set the encoded trigger source, see [`TriggerSource`].
    pub fn set_trigger_source(&self, source: u32) -> Result<()> {
        let checked = TriggerSource::decode(source)
            .and_then(|decoded| self.shared.family.check_trigger_source(decoded));
        self.run(|task| {
            checked?;
            task.scratch.source = source;
            task.committed = false;
            Ok(true)
        })
    }

    pub fn set_run_mode(&self, mode: u32) -> Result<()> {
        let mode = RunMode::try_from(mode);
        self.run(|task| {
            task.scratch.mode = mode?;
            task.committed = false;
            Ok(true)
        })
    }

    /// Validate the scratch configuration and make it the committed one.
    ///
    /// If the sequence is loaded, the engine is disarmed and reprogrammed now
    /// when idle, or at its next end-of-sequence otherwise.
    pub fn commit(&self) -> Result<()> {
        self.run(|task| {
            if task.committed {
                return Ok(false);
            }
            let packed = task.scratch.pack(self.shared.family.traits().ram_capacity)?;

            let shared = &self.shared;
            let mut irq = shared.irq.mask();
            let seq = irq.sequence_mut(self.id);
            let previous = std::mem::replace(&mut seq.committed, packed);
            let was_in_sync = std::mem::replace(&mut seq.in_sync, false);

            if let Some(index) = seq.hw {
                let busy = match irq.slots[index].disarm(shared.bus.as_ref(), shared.family.as_ref())
                {
                    Ok(busy) => busy,
                    Err(err) => {
                        let seq = irq.sequence_mut(self.id);
                        seq.committed = previous;
                        seq.in_sync = was_in_sync;
                        return Err(err);
                    }
                };
                if busy {
                    seq_log::diagnostic!(
                        "Sequence '{}': sequencer {} busy, sync deferred",
                        self.name,
                        index
                    );
                } else if let Err(err) = shared.sync(&mut irq, self.id) {
                    // RAM may hold part of the new table
                    let seq = irq.sequence_mut(self.id);
                    seq.committed = previous;
                    seq.in_sync = false;
                    return Err(err);
                }
            }
            task.committed = true;
            seq_log::info!(
                "Sequence '{}': committed {} entries",
                self.name,
                irq.sequence(self.id).committed.times.len()
            );
            Ok(true)
        })
    }

    /// Lease a free engine and program it with the committed configuration.
    pub fn load(&self) -> Result<()> {
        self.run(|_task| {
            let shared = &self.shared;
            let mut irq = shared.irq.mask();
            if irq.sequence(self.id).hw.is_some() {
                return Ok(false);
            }
            let Some(index) = irq.slots.iter().position(|slot| slot.loaded.is_none()) else {
                return Err(Error::NoFreeSlot);
            };
            irq.slots[index].loaded = Some(self.id);
            let seq = irq.sequence_mut(self.id);
            seq.hw = Some(index);
            seq.in_sync = false;

            if let Err(err) = self.program(&mut irq, index) {
                irq.slots[index].loaded = None;
                let seq = irq.sequence_mut(self.id);
                seq.hw = None;
                seq.in_sync = false;
                return Err(err);
            }
            seq_log::info!("Sequence '{}': loaded on sequencer {}", self.name, index);
            Ok(true)
        })
    }

    /// Clear stale input routing of a freshly leased engine and sync it.
    fn program(&self, irq: &mut IrqState, index: usize) -> Result<()> {
        let shared = &self.shared;
        shared.family.map_external_trigger(index, 0)?;
        if irq.slots[index].disarm(shared.bus.as_ref(), shared.family.as_ref())? {
            seq_log::diagnostic!(
                "Sequence '{}': sequencer {} busy, sync deferred",
                self.name,
                index
            );
            return Ok(());
        }
        shared.sync(irq, self.id)?;
        Ok(())
    }

    /// Release the leased engine, disarming it on a best effort basis.
    pub fn unload(&self) -> Result<()> {
        self.run(|_task| {
            let shared = &self.shared;
            let mut irq = shared.irq.mask();
            let Some(index) = irq.sequence(self.id).hw else {
                return Ok(false);
            };
            if let Err(err) = irq.slots[index].disarm(shared.bus.as_ref(), shared.family.as_ref())
            {
                seq_log::warn!(
                    "Sequence '{}': disarming sequencer {} on unload failed: {}",
                    self.name,
                    index,
                    err
                );
            }
            irq.slots[index].loaded = None;
            let seq = irq.sequence_mut(self.id);
            seq.hw = None;
            seq.in_sync = false;
            seq_log::info!("Sequence '{}': unloaded from sequencer {}", self.name, index);
            Ok(true)
        })
    }

    pub fn enable(&self) -> Result<()> {
        self.run(|_task| {
            let shared = &self.shared;
            let mut irq = shared.irq.mask();
            let seq = irq.sequence(self.id);
            if seq.enabled {
                return Ok(false);
            }
            // An engine still waiting for its sync is armed by the sync
            if let (Some(index), true) = (seq.hw, seq.in_sync) {
                irq.slots[index].arm(shared.bus.as_ref())?;
            }
            irq.sequence_mut(self.id).enabled = true;
            Ok(true)
        })
    }

    pub fn disable(&self) -> Result<()> {
        self.run(|_task| {
            let shared = &self.shared;
            let mut irq = shared.irq.mask();
            let seq = irq.sequence(self.id);
            if !seq.enabled {
                return Ok(false);
            }
            if let Some(index) = seq.hw {
                irq.slots[index].disarm(shared.bus.as_ref(), shared.family.as_ref())?;
            }
            irq.sequence_mut(self.id).enabled = false;
            Ok(true)
        })
    }

    /// Pulse the software trigger of the leased engine.
    ///
    /// Has no effect unless the sequence is both loaded and enabled.
    pub fn soft_trigger(&self) -> Result<()> {
        self.run(|_task| {
            let shared = &self.shared;
            let irq = shared.irq.mask();
            let seq = irq.sequence(self.id);
            if let (Some(index), true) = (seq.hw, seq.enabled) {
                irq.slots[index].software_trigger(shared.bus.as_ref())?;
            }
            Ok(false)
        })
    }

    /// Committed timestamps in event clock ticks.
    pub fn timestamps(&self) -> Vec<u64> {
        self.shared.irq.mask().sequence(self.id).committed.times.clone()
    }

    /// Committed timestamps in seconds.
    pub fn timestamps_seconds(&self) -> Vec<f64> {
        let clock = self.shared.family.clock_frequency();
        self.timestamps()
            .into_iter()
            .map(|t| t as f64 / clock)
            .collect()
    }

    pub fn event_codes(&self) -> Vec<u8> {
        self.shared.irq.mask().sequence(self.id).committed.codes.clone()
    }

    pub fn trigger_source(&self) -> u32 {
        self.shared.irq.mask().sequence(self.id).committed.source
    }

    pub fn run_mode(&self) -> RunMode {
        self.shared.irq.mask().sequence(self.id).committed.mode
    }

    pub fn committed(&self) -> SequenceConfig {
        self.shared.irq.mask().sequence(self.id).committed.clone()
    }

    pub fn scratch(&self) -> SequenceConfig {
        self.lock_task().scratch.clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded_slot().is_some()
    }

    pub fn loaded_slot(&self) -> Option<usize> {
        self.shared.irq.mask().sequence(self.id).hw
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.irq.mask().sequence(self.id).enabled
    }

    pub fn is_committed(&self) -> bool {
        self.lock_task().committed
    }

    /// The engine holds the committed configuration.
    pub fn is_in_sync(&self) -> bool {
        self.shared.irq.mask().sequence(self.id).in_sync
    }

    pub fn error_text(&self) -> String {
        self.lock_task().last_error.clone()
    }

    pub fn start_count(&self) -> u32 {
        self.shared.irq.mask().sequence(self.id).start_count
    }

    pub fn end_count(&self) -> u32 {
        self.shared.irq.mask().sequence(self.id).end_count
    }

    /// Whether the interrupt handler left an anomaly for this sequence.
    pub fn needs_attention(&self) -> bool {
        self.shared.irq.mask().sequence(self.id).anomaly.is_some()
    }

    pub fn take_anomaly(&self) -> Option<String> {
        self.shared.irq.mask().sequence_mut(self.id).anomaly.take()
    }

    #[cfg(test)]
    pub(crate) fn sync_now(&self) -> Result<crate::manager::SyncOutcome> {
        let mut irq = self.shared.irq.mask();
        self.shared.sync(&mut irq, self.id)
    }
}

impl Drop for SoftSequence {
    fn drop(&mut self) {
        if let Err(err) = self.unload() {
            seq_log::warn!("Sequence '{}': unload on drop failed: {}", self.name, err);
        }
        self.shared.irq.mask().sequences[self.id.index()] = None;
        self.shared.registry().shift_remove(&*self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(times: Vec<u64>, codes: Vec<u8>) -> SequenceConfig {
        SequenceConfig {
            times,
            codes,
            ..Default::default()
        }
    }

    #[test]
    fn test_pack_terminates_table() {
        let packed = config(vec![10, 20, 30], vec![1, 2]).pack(2048).unwrap();
        assert_eq!(packed.times, vec![10, 20, 21]);
        assert_eq!(packed.codes, vec![1, 2, ram::END_OF_SEQUENCE_CODE]);

        let packed = config(vec![], vec![]).pack(2048).unwrap();
        assert_eq!(packed, SequenceConfig::idle());

        assert!(config(vec![10, 20], vec![1, 2]).pack(2).is_err());
    }

    #[test]
    fn test_pack_rejects_unvalidated_tables() {
        let err = config(vec![20, 10], vec![1, 2]).pack(2048).unwrap_err();
        assert_eq!(err.to_string(), "Non-monotonic timestamp array at index 1");

        assert!(config(vec![u64::MAX], vec![1]).pack(2048).is_err());
        assert!(
            config(vec![ram::ROLLOVER_TIMESTAMP], vec![ram::END_OF_SEQUENCE_CODE])
                .pack(2048)
                .is_err()
        );

        // entries cut off by truncation are not checked
        assert!(config(vec![10, 5], vec![1]).pack(2048).is_ok());
    }

    #[test]
    fn test_run_mode_from_register_value() {
        assert_eq!(RunMode::try_from(0).unwrap(), RunMode::Normal);
        assert_eq!(RunMode::try_from(2).unwrap(), RunMode::Single);
        assert!(RunMode::try_from(1).is_err());
        assert_eq!(RunMode::Single.repeat_bits(), control::REPEAT_SINGLE);
    }
}
