// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Trigger source selector of a soft sequence.
//!
//! The stored value is a 32 bit word whose most significant byte selects how
//! the rest is interpreted:
//!
//! | class  | meaning                                              |
//! |--------|------------------------------------------------------|
//! | `0x00` | raw, device specific source code in the low byte     |
//! | `0x01` | software trigger of whichever engine runs the sequence |
//! | `0x02` | external input, `0x02TT00II` (input type, input index) |
//! | `0x03` | disabled                                             |

use crate::family::FamilyTraits;
use crate::{Error, Result};

pub const CLASS_RAW: u8 = 0x00;
pub const CLASS_SOFTWARE: u8 = 0x01;
pub const CLASS_EXTERNAL: u8 = 0x02;
pub const CLASS_DISABLED: u8 = 0x03;

/// Default source of a new sequence: its own software trigger.
pub const DEFAULT_SOURCE: u32 = (CLASS_SOFTWARE as u32) << 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Raw(u8),
    Software,
    /// The full encoded word, forwarded to the input mapping hook.
    External(u32),
    Disabled,
}

impl TriggerSource {
    pub fn decode(raw: u32) -> Result<Self> {
        match (raw >> 24) as u8 {
            CLASS_RAW => Ok(TriggerSource::Raw((raw & 0xff) as u8)),
            CLASS_SOFTWARE => Ok(TriggerSource::Software),
            CLASS_EXTERNAL => Ok(TriggerSource::External(raw)),
            CLASS_DISABLED => Ok(TriggerSource::Disabled),
            class => Err(Error::new(format!(
                "Invalid trigger source {raw:#010x}: unknown encoding class {class:#04x}"
            ))),
        }
    }

    pub fn encode(self) -> u32 {
        match self {
            TriggerSource::Raw(code) => code as u32,
            TriggerSource::Software => DEFAULT_SOURCE,
            TriggerSource::External(raw) => raw,
            TriggerSource::Disabled => (CLASS_DISABLED as u32) << 24,
        }
    }

    /// External input type, `TT` in `0x02TT00II`.
    pub fn input_type(self) -> Option<u8> {
        match self {
            TriggerSource::External(raw) => Some((raw >> 16) as u8),
            _ => None,
        }
    }

    /// External input index, `II` in `0x02TT00II`.
    pub fn input_index(self) -> Option<u8> {
        match self {
            TriggerSource::External(raw) => Some(raw as u8),
            _ => None,
        }
    }

    /// Source code to program into the control register of engine `slot`.
    pub(crate) fn control_code(self, traits: &FamilyTraits, slot: usize) -> u8 {
        match self {
            TriggerSource::Raw(code) => code,
            TriggerSource::Software => traits.software_trigger_code(slot),
            TriggerSource::External(_) => traits
                .external_trigger_code(slot)
                .unwrap_or(traits.disabled_source),
            TriggerSource::Disabled => traits.disabled_source,
        }
    }
}
