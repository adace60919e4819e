// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Card level configuration of the sequence manager.
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use seq_registers::RegisterBus;
use seq_registers::layout::ram;

use crate::family::{FamilyKind, SlotLayout, family_for};
use crate::manager::{NoopListener, ScanListener, SequenceManager};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct SanitizationChange {
    pub field: &'static str,
    pub original: String,
    pub sanitized: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub family: FamilyKind,
    pub clock_frequency_hz: f64,
    /// Register offsets of the engines to manage, the family default if absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slots: Option<Vec<SlotLayout>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl DeviceConfig {
    pub fn new(family: FamilyKind, clock_frequency_hz: f64) -> Self {
        DeviceConfig {
            family,
            clock_frequency_hz,
            slots: None,
            name: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config = serde_json::from_str(json).context("Invalid device configuration")?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize device configuration")?;
        Ok(json)
    }

    /// Engine layouts to take over.
    pub fn slot_layouts(&self) -> Vec<SlotLayout> {
        let traits = self.family.traits();
        self.slots
            .clone()
            .unwrap_or_else(|| traits.default_layout(traits.max_sequencers))
    }

    pub fn device_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.family.to_string())
    }

    /// Reject configurations no card can have, fill in what was left out.
    pub fn sanitize(&mut self) -> Result<Vec<SanitizationChange>> {
        let mut changes = vec![];
        if !self.clock_frequency_hz.is_finite() || self.clock_frequency_hz <= 0.0 {
            return Err(Error::new(format!(
                "Invalid event clock frequency {} Hz",
                self.clock_frequency_hz
            )));
        }

        let layouts = self.slot_layouts();
        check_layouts(self.family, &layouts)?;
        if self.slots.is_none() {
            changes.push(SanitizationChange {
                field: "slots",
                original: "none".to_string(),
                sanitized: format!("{layouts:?}"),
                reason: format!("Standard {} layout.", self.family),
            });
            self.slots = Some(layouts);
        }

        if self.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            let sanitized = self.family.to_string();
            changes.push(SanitizationChange {
                field: "name",
                original: format!("{:?}", self.name),
                sanitized: sanitized.clone(),
                reason: "Empty device name.".to_string(),
            });
            self.name = Some(sanitized);
        }
        Ok(changes)
    }

    /// Sanitize and build the manager for the card behind `bus`.
    pub fn build(self, bus: Arc<dyn RegisterBus>) -> Result<SequenceManager> {
        self.build_with_listener(bus, Arc::new(NoopListener))
    }

    pub fn build_with_listener(
        mut self,
        bus: Arc<dyn RegisterBus>,
        listener: Arc<dyn ScanListener>,
    ) -> Result<SequenceManager> {
        for change in self.sanitize()? {
            seq_log::diagnostic!(
                "Device configuration: {} changed from {} to {}: {}",
                change.field,
                change.original,
                change.sanitized,
                change.reason
            );
        }
        let family = family_for(self.family, Arc::clone(&bus), self.clock_frequency_hz);
        SequenceManager::with_listener(
            self.device_name(),
            family,
            bus,
            &self.slot_layouts(),
            listener,
        )
    }
}

fn check_layouts(family: FamilyKind, layouts: &[SlotLayout]) -> Result<()> {
    let max = family.traits().max_sequencers;
    if layouts.is_empty() || layouts.len() > max {
        return Err(Error::new(format!(
            "{family} supports 1 to {max} sequencers, got {}",
            layouts.len()
        )));
    }
    let mut windows = Vec::with_capacity(layouts.len());
    for layout in layouts {
        seq_registers::check_aligned(layout.control)?;
        seq_registers::check_aligned(layout.ram)?;
        let end = layout.ram.checked_add(ram::WINDOW_BYTES).ok_or_else(|| {
            Error::new(format!(
                "Sequencer RAM window at {:#06x} exceeds the address space",
                layout.ram
            ))
        })?;
        windows.push(layout.ram..end);
    }
    for (i, a) in layouts.iter().enumerate() {
        for (j, b) in layouts.iter().enumerate().skip(i + 1) {
            if a.control == b.control {
                return Err(Error::new(format!(
                    "Sequencers share the control register at {:#06x}",
                    a.control
                )));
            }
            if windows[i].start < windows[j].end && windows[j].start < windows[i].end {
                return Err(Error::new(format!(
                    "Sequencer RAM windows at {:#06x} and {:#06x} overlap",
                    a.ram, b.ram
                )));
            }
        }
    }
    Ok(())
}
