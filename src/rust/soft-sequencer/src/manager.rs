// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;

use seq_registers::RegisterBus;
use seq_registers::layout::irq;

use crate::family::{DeviceFamily, FamilyKind, SlotLayout};
use crate::irq::InterruptLock;
use crate::sequence::{RunMode, SequenceConfig, SequenceId, SoftSequence};
use crate::slot::HwSlot;
use crate::trigger::TriggerSource;
use crate::{Error, Result};

/// Notifications raised towards the record layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanEvent {
    /// Configuration or state of the sequence changed
    Changed,
    Start,
    End,
    /// The last error text was updated
    Error,
}

/// Receiver of scan requests, one call per event.
///
/// Start and end events are raised from the interrupt handler. Implementations
/// must queue the request rather than process it in place.
pub trait ScanListener: Send + Sync {
    fn scan_request(&self, sequence: &str, event: ScanEvent);
}

pub struct NoopListener;

impl ScanListener for NoopListener {
    fn scan_request(&self, _sequence: &str, _event: ScanEvent) {}
}

/// Part of a soft sequence the interrupt handler reads and writes.
#[derive(Debug)]
pub(crate) struct SequenceIrq {
    pub(crate) name: Arc<str>,
    /// Engine currently leased
    pub(crate) hw: Option<usize>,
    /// The only configuration ever written to hardware
    pub(crate) committed: SequenceConfig,
    /// User intent to arm, cleared by single-shot completion
    pub(crate) enabled: bool,
    /// `committed` is what the leased engine holds in RAM
    pub(crate) in_sync: bool,
    pub(crate) start_count: u32,
    pub(crate) end_count: u32,
    pub(crate) anomaly: Option<String>,
}

impl SequenceIrq {
    pub(crate) fn new(name: Arc<str>) -> Self {
        SequenceIrq {
            name,
            hw: None,
            committed: SequenceConfig::idle(),
            enabled: false,
            in_sync: false,
            start_count: 0,
            end_count: 0,
            anomaly: None,
        }
    }

    fn raise_anomaly(&mut self, msg: String) {
        seq_log::warn!("Sequence '{}': {}", self.name, msg);
        self.anomaly = Some(msg);
    }
}

/// Everything guarded by the interrupt section.
#[derive(Debug)]
pub(crate) struct IrqState {
    pub(crate) slots: Vec<HwSlot>,
    /// Indexed by [`SequenceId`], `None` for released entries
    pub(crate) sequences: Vec<Option<SequenceIrq>>,
    pub(crate) anomaly: Option<String>,
}

impl IrqState {
    pub(crate) fn sequence(&self, id: SequenceId) -> &SequenceIrq {
        self.sequences[id.index()]
            .as_ref()
            .expect("Sequence entry must outlive its handle")
    }

    pub(crate) fn sequence_mut(&mut self, id: SequenceId) -> &mut SequenceIrq {
        self.sequences[id.index()]
            .as_mut()
            .expect("Sequence entry must outlive its handle")
    }

    fn raise_device_anomaly(&mut self, msg: String) {
        seq_log::warn!("{}", msg);
        self.anomaly = Some(msg);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncOutcome {
    Written,
    AlreadyInSync,
    /// Engine unexpectedly active, nothing written
    Refused,
}

pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) family: Box<dyn DeviceFamily>,
    pub(crate) bus: Arc<dyn RegisterBus>,
    pub(crate) irq: InterruptLock<IrqState>,
    pub(crate) registry: Mutex<IndexMap<String, SequenceId>>,
    listener: Arc<dyn ScanListener>,
}

impl Shared {
    pub(crate) fn notify(&self, sequence: &str, event: ScanEvent) {
        self.listener.scan_request(sequence, event);
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, IndexMap<String, SequenceId>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write the committed table of `id` into the engine it leases.
    ///
    /// Must be called inside the interrupt section, with the engine disarmed
    /// and proven idle. Does nothing if the engine already holds the table.
    pub(crate) fn sync(&self, irq: &mut IrqState, id: SequenceId) -> Result<SyncOutcome> {
        let IrqState {
            slots, sequences, ..
        } = irq;
        let seq = sequences[id.index()]
            .as_mut()
            .expect("Sequence entry must outlive its handle");
        if seq.in_sync {
            return Ok(SyncOutcome::AlreadyInSync);
        }
        let index = seq
            .hw
            .ok_or_else(|| Error::new(format!("Sequence '{}' is not loaded", seq.name)))?;
        let slot = &mut slots[index];

        if slot.running || slot.is_active(self.bus.as_ref())? {
            seq.raise_anomaly(format!(
                "sync of sequencer {index} refused while running/enabled"
            ));
            return Ok(SyncOutcome::Refused);
        }

        let traits = self.family.traits();
        let source = TriggerSource::decode(seq.committed.source).unwrap_or_else(|err| {
            seq_log::warn!("Sequence '{}': {}, trigger disabled", seq.name, err);
            TriggerSource::Disabled
        });
        if let TriggerSource::External(raw) = source {
            self.family.map_external_trigger(index, raw)?;
        }
        slot.set_control(
            seq.committed.mode.repeat_bits(),
            source.control_code(traits, index),
        );
        slot.write_table(self.bus.as_ref(), &seq.committed)?;
        slot.write_control(self.bus.as_ref(), seq.enabled)?;
        seq.in_sync = true;
        seq_log::diagnostic!(
            "Sequence '{}': {} entries written to sequencer {}, control {:#010x}",
            seq.name,
            seq.committed.times.len(),
            index,
            slot.control_shadow()
        );
        Ok(SyncOutcome::Written)
    }
}

/// Owner of the sequencer engines of one card.
pub struct SequenceManager {
    shared: Arc<Shared>,
}

impl SequenceManager {
    /// Take over the engines at `layouts`, one slot per entry.
    pub fn new(
        name: impl Into<String>,
        family: Box<dyn DeviceFamily>,
        bus: Arc<dyn RegisterBus>,
        layouts: &[SlotLayout],
    ) -> Result<Self> {
        Self::with_listener(name, family, bus, layouts, Arc::new(NoopListener))
    }

    pub fn with_listener(
        name: impl Into<String>,
        family: Box<dyn DeviceFamily>,
        bus: Arc<dyn RegisterBus>,
        layouts: &[SlotLayout],
        listener: Arc<dyn ScanListener>,
    ) -> Result<Self> {
        let name = name.into();
        let traits = family.traits();
        if layouts.is_empty() || layouts.len() > traits.max_sequencers {
            return Err(Error::new(format!(
                "{} supports 1 to {} sequencers, got {}",
                traits.kind,
                traits.max_sequencers,
                layouts.len()
            )));
        }
        let slots = layouts
            .iter()
            .enumerate()
            .map(|(index, layout)| HwSlot::new(index, *layout, bus.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        seq_log::info!(
            "{}: {} sequence manager with {} sequencer(s)",
            name,
            traits.kind,
            slots.len()
        );
        Ok(SequenceManager {
            shared: Arc::new(Shared {
                name,
                family,
                bus,
                irq: InterruptLock::new(IrqState {
                    slots,
                    sequences: Vec::new(),
                    anomaly: None,
                }),
                registry: Mutex::new(IndexMap::new()),
                listener,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn family_kind(&self) -> FamilyKind {
        self.shared.family.kind()
    }

    pub fn clock_frequency(&self) -> f64 {
        self.shared.family.clock_frequency()
    }

    pub fn slot_count(&self) -> usize {
        self.shared.irq.mask().slots.len()
    }

    pub fn slot_layout(&self, slot: usize) -> Option<SlotLayout> {
        self.shared.irq.mask().slots.get(slot).map(HwSlot::layout)
    }

    /// Name of the sequence leasing `slot`.
    pub fn slot_owner(&self, slot: usize) -> Option<String> {
        let irq = self.shared.irq.mask();
        let id = irq.slots.get(slot)?.loaded?;
        Some(irq.sequence(id).name.to_string())
    }

    pub fn is_slot_running(&self, slot: usize) -> bool {
        self.shared
            .irq
            .mask()
            .slots
            .get(slot)
            .is_some_and(|s| s.running)
    }

    /// Create a new, unloaded soft sequence.
    pub fn create_sequence(&self, name: &str) -> Result<SoftSequence> {
        let mut registry = self.shared.registry();
        if registry.contains_key(name) {
            return Err(Error::new(format!("Sequence '{name}' already exists")));
        }
        let name: Arc<str> = Arc::from(name);
        let id = {
            let mut irq = self.shared.irq.mask();
            let entry = SequenceIrq::new(Arc::clone(&name));
            match irq.sequences.iter().position(Option::is_none) {
                Some(free) => {
                    irq.sequences[free] = Some(entry);
                    SequenceId::new(free)
                }
                None => {
                    irq.sequences.push(Some(entry));
                    SequenceId::new(irq.sequences.len() - 1)
                }
            }
        };
        registry.insert(name.to_string(), id);
        seq_log::info!("{}: created sequence '{}'", self.shared.name, name);
        Ok(SoftSequence::new(id, name, Arc::clone(&self.shared)))
    }

    pub fn sequence_names(&self) -> Vec<String> {
        self.shared.registry().keys().cloned().collect()
    }

    /// Handle for the interrupt handler of the card.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Take the last anomaly the interrupt handler saw that concerned no sequence.
    pub fn take_anomaly(&self) -> Option<String> {
        self.shared.irq.mask().anomaly.take()
    }
}

/// Interrupt context view of a [`SequenceManager`].
///
/// Only ever enters the interrupt section, never the per-sequence locks, and
/// never fails: problems are kept as anomalies for task context to pick up.
#[derive(Clone)]
pub struct InterruptHandle {
    shared: Arc<Shared>,
}

impl InterruptHandle {
    pub fn do_start_of_sequence(&self, slot: usize) {
        let mut irq = self.shared.irq.mask();
        if slot >= irq.slots.len() {
            irq.raise_device_anomaly(format!(
                "{}: start-of-sequence for unknown sequencer {slot}",
                self.shared.name
            ));
            return;
        }
        let hw = &mut irq.slots[slot];
        hw.running = true;
        let Some(id) = hw.loaded else {
            return;
        };
        let seq = irq.sequence_mut(id);
        seq.start_count = seq.start_count.wrapping_add(1);
        let name = Arc::clone(&seq.name);
        drop(irq);

        self.shared.notify(&name, ScanEvent::Start);
    }

    pub fn do_end_of_sequence(&self, slot: usize) {
        let mut irq = self.shared.irq.mask();
        if slot >= irq.slots.len() {
            irq.raise_device_anomaly(format!(
                "{}: end-of-sequence for unknown sequencer {slot}",
                self.shared.name
            ));
            return;
        }
        let hw = &mut irq.slots[slot];
        hw.running = false;
        let Some(id) = hw.loaded else {
            return;
        };
        let seq = irq.sequence_mut(id);
        let disabled = seq.committed.mode == RunMode::Single && seq.enabled;
        if disabled {
            seq.enabled = false;
        }
        seq.end_count = seq.end_count.wrapping_add(1);
        let name = Arc::clone(&seq.name);
        let in_sync = seq.in_sync;

        if !in_sync {
            seq_log::diagnostic!("Sequence '{}': deferred sync on sequencer {}", name, slot);
            if let Err(err) = self.shared.sync(&mut irq, id) {
                irq.sequence_mut(id)
                    .raise_anomaly(format!("deferred sync failed: {err}"));
            }
        }
        drop(irq);

        self.shared.notify(&name, ScanEvent::End);
        if disabled {
            self.shared.notify(&name, ScanEvent::Changed);
        }
    }

    /// Service the active bits of the interrupt flag register.
    ///
    /// Starts are handled before ends, so that a short sequence whose start and
    /// end are flagged together ends up not running.
    pub fn dispatch(&self, active_flags: u32) {
        let slots = self.shared.irq.mask().slots.len();
        for slot in 0..slots {
            if active_flags & irq::start_of_sequence(slot) != 0 {
                self.do_start_of_sequence(slot);
            }
        }
        for slot in 0..slots {
            if active_flags & irq::end_of_sequence(slot) != 0 {
                self.do_end_of_sequence(slot);
            }
        }
    }
}
