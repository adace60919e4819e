// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use seq_registers::layout::{control, ram};
use seq_registers::RegisterBus;

use crate::Result;
use crate::family::{DeviceFamily, SlotLayout};
use crate::sequence::{SequenceConfig, SequenceId};

/// One physical sequencer engine.
///
/// Only reachable through an open interrupt section, which is what guards
/// `loaded`, `running` and the control shadow.
#[derive(Debug)]
pub(crate) struct HwSlot {
    index: usize,
    layout: SlotLayout,
    /// Sequence currently leasing the engine
    pub(crate) loaded: Option<SequenceId>,
    /// Between start-of-sequence and end-of-sequence
    pub(crate) running: bool,
    /// Last written software owned bits of the control register
    control_shadow: u32,
}

impl HwSlot {
    /// Take over an engine: latch the software owned bits and reset it.
    pub(crate) fn new(index: usize, layout: SlotLayout, bus: &dyn RegisterBus) -> Result<Self> {
        let control_shadow = bus.read32(layout.control)? & control::SOFTWARE_OWNED;
        bus.write32(layout.control, control_shadow | control::RESET)?;
        Ok(HwSlot {
            index,
            layout,
            loaded: None,
            running: false,
            control_shadow,
        })
    }

    pub(crate) fn layout(&self) -> SlotLayout {
        self.layout
    }

    pub(crate) fn control_shadow(&self) -> u32 {
        self.control_shadow
    }

    /// Stop the engine from starting again.
    ///
    /// Returns `true` when the engine may still be playing its RAM, in which case
    /// the RAM must not be touched before the next end-of-sequence. The software
    /// `running` flag alone is not enough: the start-of-sequence interrupt may be
    /// raised but not yet serviced.
    pub(crate) fn disarm(&self, bus: &dyn RegisterBus, family: &dyn DeviceFamily) -> Result<bool> {
        bus.write32(self.layout.control, self.control_shadow | control::DISABLE)?;
        let hw_running = bus.read32(self.layout.control)? & control::RUNNING != 0;
        let busy = self.running || hw_running || family.start_of_sequence_pending(self.index)?;
        seq_log::diagnostic!(
            "Sequencer {}: disarmed, running={} hw_running={} busy={}",
            self.index,
            self.running,
            hw_running,
            busy
        );
        Ok(busy)
    }

    pub(crate) fn arm(&self, bus: &dyn RegisterBus) -> Result<()> {
        bus.write32(self.layout.control, self.control_shadow | control::ARM)?;
        Ok(())
    }

    pub(crate) fn software_trigger(&self, bus: &dyn RegisterBus) -> Result<()> {
        bus.write32(
            self.layout.control,
            self.control_shadow | control::SW_TRIGGER,
        )?;
        Ok(())
    }

    /// Whether the control register reports the engine running or armed.
    pub(crate) fn is_active(&self, bus: &dyn RegisterBus) -> Result<bool> {
        Ok(bus.read32(self.layout.control)? & control::STATUS_MASK != 0)
    }

    /// Recompute the software owned bits from the run mode and source code.
    pub(crate) fn set_control(&mut self, repeat_bits: u32, source_code: u8) {
        self.control_shadow &= !(control::REPEAT_MASK | control::SOURCE_MASK);
        self.control_shadow |= repeat_bits & control::REPEAT_MASK;
        self.control_shadow |= source_code as u32;
    }

    /// Copy a committed table into the engine RAM.
    ///
    /// Entries past the sentinel are never read by the engine and are left as is.
    pub(crate) fn write_table(&self, bus: &dyn RegisterBus, config: &SequenceConfig) -> Result<()> {
        for (entry, (time, code)) in config.times.iter().zip(&config.codes).enumerate() {
            bus.write32(ram::timestamp_offset(self.layout.ram, entry), *time as u32)?;
            bus.write32(ram::code_offset(self.layout.ram, entry), *code as u32)?;
        }
        Ok(())
    }

    /// Write the control register with the arm or disarm pulse.
    pub(crate) fn write_control(&self, bus: &dyn RegisterBus, armed: bool) -> Result<()> {
        let pulse = if armed {
            control::ARM
        } else {
            control::DISABLE
        };
        bus.write32(self.layout.control, self.control_shadow | pulse)?;
        Ok(())
    }
}
