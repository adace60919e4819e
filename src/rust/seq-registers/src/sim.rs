// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::layout::control;
use crate::{Error, RegisterBus, Result, check_aligned};

#[derive(Debug, Default)]
struct Engine {
    latched: u32,
    enabled: bool,
    running: bool,
    software_triggers: u32,
}

#[derive(Debug, Default)]
struct State {
    words: HashMap<usize, u32>,
    engines: HashMap<usize, Engine>,
    faults: HashSet<usize>,
    record_writes: bool,
    writes: Vec<(usize, u32)>,
}

/// In-memory register file emulating a timing card.
///
/// Plain offsets behave as memory. Offsets registered with
/// [`SimulatedBus::add_sequencer`] behave like a sequencer control register:
/// pulse bits act on the engine and are not latched, and reads report the
/// running/enabled status of the engine.
///
/// Writes are only logged after [`SimulatedBus::record_writes`] switched the
/// log on, so a long running bus does not grow without bound.
#[derive(Debug, Default)]
pub struct SimulatedBus {
    state: Mutex<State>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Emulate a sequencer control register at `control_offset`.
    pub fn add_sequencer(&self, control_offset: usize) {
        self.state().engines.entry(control_offset).or_default();
    }

    /// Force the running status of an engine, as the card does when a trigger arrives.
    pub fn set_running(&self, control_offset: usize, running: bool) {
        if let Some(engine) = self.state().engines.get_mut(&control_offset) {
            engine.running = running;
        }
    }

    /// An external trigger arrives. Returns whether the engine started.
    pub fn trigger(&self, control_offset: usize) -> bool {
        match self.state().engines.get_mut(&control_offset) {
            Some(engine) if engine.enabled => {
                engine.running = true;
                true
            }
            _ => false,
        }
    }

    /// Let an engine finish its sequence; single-shot engines disarm themselves.
    pub fn complete(&self, control_offset: usize) {
        if let Some(engine) = self.state().engines.get_mut(&control_offset) {
            engine.running = false;
            if engine.latched & control::REPEAT_MASK == control::REPEAT_SINGLE {
                engine.enabled = false;
            }
        }
    }

    pub fn is_armed(&self, control_offset: usize) -> bool {
        self.state()
            .engines
            .get(&control_offset)
            .is_some_and(|engine| engine.enabled)
    }

    pub fn software_triggers(&self, control_offset: usize) -> u32 {
        self.state()
            .engines
            .get(&control_offset)
            .map_or(0, |engine| engine.software_triggers)
    }

    /// Current content of a plain register, bypassing fault injection.
    pub fn peek(&self, offset: usize) -> u32 {
        let state = self.state();
        match state.engines.get(&offset) {
            Some(engine) => engine_status(engine),
            None => state.words.get(&offset).copied().unwrap_or(0),
        }
    }

    /// Set a plain register, e.g. raise an interrupt flag.
    pub fn poke(&self, offset: usize, value: u32) {
        self.state().words.insert(offset, value);
    }

    /// Read `entries` (timestamp, code) word pairs starting at `base`.
    pub fn ram(&self, base: usize, entries: usize) -> Vec<(u32, u32)> {
        let state = self.state();
        (0..entries)
            .map(|i| {
                let ts = state.words.get(&(base + 8 * i)).copied().unwrap_or(0);
                let code = state.words.get(&(base + 8 * i + 4)).copied().unwrap_or(0);
                (ts, code)
            })
            .collect()
    }

    /// Make every access to `offset` fail.
    pub fn inject_fault(&self, offset: usize) {
        self.state().faults.insert(offset);
    }

    pub fn clear_fault(&self, offset: usize) {
        self.state().faults.remove(&offset);
    }

    /// Start or stop logging writes. Stopping also drops the log.
    pub fn record_writes(&self, enabled: bool) {
        let mut state = self.state();
        state.record_writes = enabled;
        if !enabled {
            state.writes = Vec::new();
        }
    }

    /// All writes logged so far, in order.
    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.state().writes.clone()
    }

    /// Writes to a single offset, in order.
    pub fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.state()
            .writes
            .iter()
            .filter(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }
}

fn engine_status(engine: &Engine) -> u32 {
    let mut value = engine.latched;
    if engine.running {
        value |= control::RUNNING;
    }
    if engine.enabled {
        value |= control::ENABLED;
    }
    value
}

fn bus_fault(offset: usize) -> Error {
    Error::Bus {
        offset,
        reason: "injected fault".to_string(),
    }
}

impl RegisterBus for SimulatedBus {
    fn read32(&self, offset: usize) -> Result<u32> {
        let offset = check_aligned(offset)?;
        let state = self.state();
        if state.faults.contains(&offset) {
            return Err(bus_fault(offset));
        }
        Ok(match state.engines.get(&offset) {
            Some(engine) => engine_status(engine),
            None => state.words.get(&offset).copied().unwrap_or(0),
        })
    }

    fn write32(&self, offset: usize, value: u32) -> Result<()> {
        let offset = check_aligned(offset)?;
        let mut state = self.state();
        if state.faults.contains(&offset) {
            return Err(bus_fault(offset));
        }
        if state.record_writes {
            state.writes.push((offset, value));
        }
        match state.engines.get_mut(&offset) {
            Some(engine) => {
                engine.latched = value & control::WRITABLE_MASK & !control::PULSE_MASK;
                if value & control::RESET != 0 {
                    engine.enabled = false;
                    engine.running = false;
                }
                if value & control::DISABLE != 0 {
                    engine.enabled = false;
                }
                if value & control::ARM != 0 {
                    engine.enabled = true;
                }
                if value & control::SW_TRIGGER != 0 && engine.enabled {
                    engine.running = true;
                    engine.software_triggers += 1;
                }
            }
            None => {
                state.words.insert(offset, value);
            }
        }
        Ok(())
    }
}
