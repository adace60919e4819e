// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Register level contract of the sequencer engines on MRF timing cards.
//!
//! Everything in [`layout`] is bit-exact with the devices. Access goes through
//! [`RegisterBus`], which the surrounding driver implements on top of the
//! mapped register window. [`SimulatedBus`] stands in for the card in tests.

pub mod layout;
mod sim;

pub use sim::SimulatedBus;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Bus access at offset {offset:#06x} failed: {reason}")]
    Bus { offset: usize, reason: String },

    #[error("Register offset {0:#06x} is not 32 bit aligned")]
    Misaligned(usize),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Whole-word access to a device register window.
///
/// Offsets are byte offsets from the start of the window. Implementations must
/// be callable from interrupt context, so they must never block.
pub trait RegisterBus: Send + Sync {
    fn read32(&self, offset: usize) -> Result<u32>;

    fn write32(&self, offset: usize, value: u32) -> Result<()>;
}

/// Check that `offset` addresses a whole 32 bit word.
pub fn check_aligned(offset: usize) -> Result<usize> {
    if !offset.is_multiple_of(4) {
        return Err(Error::Misaligned(offset));
    }
    Ok(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_aligned() {
        assert_eq!(check_aligned(0x70), Ok(0x70));
        assert_eq!(check_aligned(0x8004), Ok(0x8004));
        assert_eq!(check_aligned(0x73), Err(Error::Misaligned(0x73)));
    }

    #[test]
    fn test_error_message() {
        let err = Error::Bus {
            offset: 0x70,
            reason: "timeout".to_string(),
        };
        assert_eq!(err.to_string(), "Bus access at offset 0x0070 failed: timeout");
    }
}
