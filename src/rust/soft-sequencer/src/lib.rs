// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Soft sequences for the hardware sequencer engines of MRF timing cards.
//!
//! A card has one or two sequencer engines. A [`SequenceManager`] owns them,
//! and any number of [`SoftSequence`]s compete for them: a sequence is edited
//! and committed at any time, and is only written to hardware while it leases
//! an engine and that engine is idle. The card interrupt handler drives the
//! [`InterruptHandle`] of the manager, which finishes writes that had to wait
//! for a running sequence to end.

pub mod config;
pub mod error;
pub mod family;
pub mod trigger;

mod irq;
mod manager;
mod sequence;
mod slot;

pub use crate::config::{DeviceConfig, SanitizationChange};
pub use crate::error::{Error, Result};
pub use crate::family::{
    DeviceFamily, EvgFamily, EvrFamily, FamilyKind, FamilyTraits, SlotLayout, family_for,
};
pub use crate::manager::{InterruptHandle, NoopListener, ScanEvent, ScanListener, SequenceManager};
pub use crate::sequence::{RunMode, SequenceConfig, SoftSequence};
pub use crate::trigger::TriggerSource;

#[cfg(test)]
mod tests;
