// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Points of variation between the supported card families.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use seq_registers::layout::{evg, evr, irq, ram};
use seq_registers::RegisterBus;

use crate::trigger::TriggerSource;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FamilyKind {
    /// "Classic" 230/300 series EVG as well as EVM
    Evg,
    /// 300DC EVR
    Evr,
}

impl FamilyKind {
    pub const fn traits(&self) -> &'static FamilyTraits {
        match self {
            FamilyKind::Evg => &EVG_TRAITS,
            FamilyKind::Evr => &EVR_TRAITS,
        }
    }
}

impl FromStr for FamilyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "evg" | "evm" => Ok(FamilyKind::Evg),
            "evr" => Ok(FamilyKind::Evr),
            _ => Err(Error::new(format!("Unknown device family: {s}"))),
        }
    }
}

impl fmt::Display for FamilyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FamilyKind::Evg => write!(f, "EVG"),
            FamilyKind::Evr => write!(f, "EVR"),
        }
    }
}

/// Register offsets of one sequencer engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLayout {
    pub control: usize,
    pub ram: usize,
}

/// Family specific constants of the sequencer engines.
pub struct FamilyTraits {
    pub kind: FamilyKind,
    pub max_sequencers: usize,
    /// Highest raw trigger source code accepted
    pub max_raw_source: u8,
    /// Source code that never triggers
    pub disabled_source: u8,
    software_trigger_base: u8,
    /// Whether every engine has its own software trigger code
    software_trigger_per_engine: bool,
    /// Source code of the input-mapped trigger of engine 0, if inputs can be mapped
    external_trigger_base: Option<u8>,
    pub ram_capacity: usize,
    seq_control: fn(usize) -> usize,
    seq_ram: fn(usize) -> usize,
}

impl FamilyTraits {
    pub fn software_trigger_code(&self, slot: usize) -> u8 {
        if self.software_trigger_per_engine {
            self.software_trigger_base + slot as u8
        } else {
            self.software_trigger_base
        }
    }

    pub fn external_trigger_code(&self, slot: usize) -> Option<u8> {
        self.external_trigger_base.map(|base| base + slot as u8)
    }

    pub fn supports_external_trigger(&self) -> bool {
        self.external_trigger_base.is_some()
    }

    /// Standard register layout of the first `count` engines.
    pub fn default_layout(&self, count: usize) -> Vec<SlotLayout> {
        (0..count.min(self.max_sequencers))
            .map(|n| SlotLayout {
                control: (self.seq_control)(n),
                ram: (self.seq_ram)(n),
            })
            .collect()
    }
}

pub const EVG_TRAITS: FamilyTraits = FamilyTraits {
    kind: FamilyKind::Evg,
    max_sequencers: evg::SEQUENCERS,
    max_raw_source: 31,
    disabled_source: 31,
    software_trigger_base: 17,
    software_trigger_per_engine: true,
    external_trigger_base: Some(24),
    ram_capacity: ram::CAPACITY,
    seq_control: evg::seq_control,
    seq_ram: evg::seq_ram,
};

pub const EVR_TRAITS: FamilyTraits = FamilyTraits {
    kind: FamilyKind::Evr,
    max_sequencers: evr::SEQUENCERS,
    max_raw_source: 63,
    disabled_source: 63,
    software_trigger_base: 62,
    software_trigger_per_engine: false,
    external_trigger_base: None,
    ram_capacity: ram::CAPACITY,
    seq_control: evr::seq_control,
    seq_ram: evr::seq_ram,
};

/// Hooks a concrete card family supplies to the sequence manager.
///
/// `map_external_trigger` and `start_of_sequence_pending` may run with the
/// sequencer interrupt masked or from the interrupt handler itself and must
/// not block.
pub trait DeviceFamily: Send + Sync {
    fn traits(&self) -> &'static FamilyTraits;

    fn kind(&self) -> FamilyKind {
        self.traits().kind
    }

    /// Event clock in Hz, used to scale timestamps given in seconds.
    fn clock_frequency(&self) -> f64;

    /// Route the external input selected by `source` to engine `slot`.
    ///
    /// `source == 0` removes any input routed to the engine.
    fn map_external_trigger(&self, slot: usize, source: u32) -> Result<()>;

    /// Whether engine `slot` has raised a start-of-sequence that the interrupt
    /// handler has not processed yet.
    fn start_of_sequence_pending(&self, _slot: usize) -> Result<bool> {
        Ok(false)
    }

    /// Reject trigger sources this family cannot honor.
    fn check_trigger_source(&self, source: TriggerSource) -> Result<()> {
        let traits = self.traits();
        match source {
            TriggerSource::Raw(code) if code > traits.max_raw_source => Err(Error::new(format!(
                "Raw trigger source {code} out of range for {} (0..={})",
                traits.kind, traits.max_raw_source
            ))),
            TriggerSource::External(_) if !traits.supports_external_trigger() => Err(Error::new(
                format!("{} does not support external sequencer triggers", traits.kind),
            )),
            _ => Ok(()),
        }
    }
}

/// Input types of the EVG as encoded in external trigger sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvgInput {
    FrontPanel = 1,
    Universal = 2,
    Backplane = 3,
}

impl EvgInput {
    const ALL: [EvgInput; 3] = [EvgInput::FrontPanel, EvgInput::Universal, EvgInput::Backplane];

    fn count(self) -> usize {
        match self {
            EvgInput::FrontPanel => evg::FRONT_INPUTS,
            EvgInput::Universal => evg::UNIVERSAL_INPUTS,
            EvgInput::Backplane => evg::BACKPLANE_INPUTS,
        }
    }

    fn map_register(self, n: usize) -> usize {
        match self {
            EvgInput::FrontPanel => evg::front_in_map(n),
            EvgInput::Universal => evg::universal_in_map(n),
            EvgInput::Backplane => evg::backplane_in_map(n),
        }
    }

    fn inputs() -> impl Iterator<Item = (EvgInput, usize)> {
        Self::ALL
            .into_iter()
            .flat_map(|kind| (0..kind.count()).map(move |n| (kind, n)))
    }
}

pub struct EvgFamily {
    bus: Arc<dyn RegisterBus>,
    clock_frequency: f64,
}

impl EvgFamily {
    pub fn new(bus: Arc<dyn RegisterBus>, clock_frequency: f64) -> Self {
        EvgFamily {
            bus,
            clock_frequency,
        }
    }

    fn lookup_input(source: TriggerSource) -> Option<(EvgInput, usize)> {
        let input_type = source.input_type()?;
        let index = source.input_index()? as usize;
        EvgInput::inputs().find(|(kind, n)| *kind as u8 == input_type && *n == index)
    }
}

impl DeviceFamily for EvgFamily {
    fn traits(&self) -> &'static FamilyTraits {
        &EVG_TRAITS
    }

    fn clock_frequency(&self) -> f64 {
        self.clock_frequency
    }

    fn map_external_trigger(&self, slot: usize, source: u32) -> Result<()> {
        if slot >= EVG_TRAITS.max_sequencers {
            return Err(Error::new(format!("No sequencer {slot} on the EVG")));
        }
        let target = if source == 0 {
            None
        } else {
            let decoded = TriggerSource::decode(source)?;
            if !matches!(decoded, TriggerSource::External(_)) {
                return Ok(());
            }
            Some(Self::lookup_input(decoded).ok_or_else(|| {
                Error::new(format!("Trigger source {source:#010x} names no EVG input"))
            })?)
        };
        let bit = evg::in_map_seq_trig(slot);
        for (kind, n) in EvgInput::inputs() {
            let offset = kind.map_register(n);
            let current = self.bus.read32(offset)?;
            let updated = if target == Some((kind, n)) {
                current | bit
            } else {
                current & !bit
            };
            if updated != current {
                self.bus.write32(offset, updated)?;
            }
        }
        Ok(())
    }

    fn check_trigger_source(&self, source: TriggerSource) -> Result<()> {
        match source {
            TriggerSource::External(raw) if Self::lookup_input(source).is_none() => Err(
                Error::new(format!("Trigger source {raw:#010x} names no EVG input")),
            ),
            TriggerSource::Raw(code) if code > EVG_TRAITS.max_raw_source => Err(Error::new(
                format!("Raw trigger source {code} out of range for EVG (0..=31)"),
            )),
            _ => Ok(()),
        }
    }
}

pub struct EvrFamily {
    bus: Arc<dyn RegisterBus>,
    clock_frequency: f64,
}

impl EvrFamily {
    pub fn new(bus: Arc<dyn RegisterBus>, clock_frequency: f64) -> Self {
        EvrFamily {
            bus,
            clock_frequency,
        }
    }
}

impl DeviceFamily for EvrFamily {
    fn traits(&self) -> &'static FamilyTraits {
        &EVR_TRAITS
    }

    fn clock_frequency(&self) -> f64 {
        self.clock_frequency
    }

    fn map_external_trigger(&self, slot: usize, source: u32) -> Result<()> {
        seq_log::diagnostic!(
            "EVR sequencer {}: external trigger mappings unsupported ({:#010x})",
            slot,
            source
        );
        Ok(())
    }

    fn start_of_sequence_pending(&self, slot: usize) -> Result<bool> {
        let flags = self.bus.read32(irq::FLAG)?;
        Ok(flags & irq::start_of_sequence(slot) != 0)
    }
}

/// Build the family hooks for `kind` on top of `bus`.
pub fn family_for(
    kind: FamilyKind,
    bus: Arc<dyn RegisterBus>,
    clock_frequency: f64,
) -> Box<dyn DeviceFamily> {
    match kind {
        FamilyKind::Evg => Box::new(EvgFamily::new(bus, clock_frequency)),
        FamilyKind::Evr => Box::new(EvrFamily::new(bus, clock_frequency)),
    }
}
