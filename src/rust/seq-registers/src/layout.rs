// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Register map of the sequencer engines.
//!
//! NOTE: Mirrors the firmware register maps of the 230/300 series EVG and the
//! 300DC EVR. Ensure that the values do match when changing.

/// Bits of the per-engine sequencer control register.
pub mod control {
    /// Engine is playing its RAM (read only)
    pub const RUNNING: u32 = 0x0200_0000;
    /// Engine is armed (read only)
    pub const ENABLED: u32 = 0x0100_0000;

    /// Software trigger pulse
    pub const SW_TRIGGER: u32 = 0x0020_0000;
    /// Reset pulse, stops the engine and rewinds the RAM pointer
    pub const RESET: u32 = 0x0004_0000;
    /// Disarm pulse
    pub const DISABLE: u32 = 0x0002_0000;
    /// Arm pulse
    pub const ARM: u32 = 0x0001_0000;

    pub const WRITABLE_MASK: u32 = 0x00ff_ffff;
    pub const PULSE_MASK: u32 = SW_TRIGGER | RESET | DISABLE | ARM;
    pub const STATUS_MASK: u32 = RUNNING | ENABLED;

    pub const REPEAT_MASK: u32 = 0x0018_0000;
    /// Re-arm on every trigger
    pub const REPEAT_NORMAL: u32 = 0x0000_0000;
    /// Disarm once the sequence completes
    pub const REPEAT_SINGLE: u32 = 0x0010_0000;
    /// Restart immediately on completion
    pub const REPEAT_RECYCLE: u32 = 0x0008_0000;

    pub const SOURCE_MASK: u32 = 0x0000_00ff;

    /// Fields owned by software and kept in the control register shadow.
    pub const SOFTWARE_OWNED: u32 = REPEAT_MASK | SOURCE_MASK;
}

/// Interrupt flag register, shared layout between EVG and EVR.
pub mod irq {
    pub const FLAG: usize = 0x0008;
    pub const ENABLE: usize = 0x000c;

    const START_OF_SEQUENCE_BASE: u32 = 0x0000_0100;
    const END_OF_SEQUENCE_BASE: u32 = 0x0000_1000;

    /// Start-of-sequence flag of engine `n`.
    pub const fn start_of_sequence(n: usize) -> u32 {
        START_OF_SEQUENCE_BASE << n
    }

    /// End-of-sequence flag of engine `n`.
    pub const fn end_of_sequence(n: usize) -> u32 {
        END_OF_SEQUENCE_BASE << n
    }
}

/// Sequence RAM: consecutive (timestamp, event code) word pairs.
pub mod ram {
    pub const ENTRY_BYTES: usize = 8;
    /// Entries per engine, including the terminating sentinel.
    pub const CAPACITY: usize = 2048;
    pub const WINDOW_BYTES: usize = ENTRY_BYTES * CAPACITY;

    /// Event code terminating a sequence.
    pub const END_OF_SEQUENCE_CODE: u8 = 0x7f;
    /// Timestamp the firmware reserves for controlled rollover.
    pub const ROLLOVER_TIMESTAMP: u64 = 0xffff_ffff;

    pub const fn timestamp_offset(base: usize, entry: usize) -> usize {
        base + ENTRY_BYTES * entry
    }

    pub const fn code_offset(base: usize, entry: usize) -> usize {
        base + ENTRY_BYTES * entry + 4
    }
}

/// EVG (230/300 series, EVM) register offsets.
pub mod evg {
    pub const SEQUENCERS: usize = 2;

    const SEQ_CONTROL_BASE: usize = 0x0070;
    const SEQ_RAM_BASE: usize = 0x8000;
    const SEQ_RAM_STRIDE: usize = 0x4000;

    pub const fn seq_control(n: usize) -> usize {
        SEQ_CONTROL_BASE + 4 * n
    }

    pub const fn seq_ram(n: usize) -> usize {
        SEQ_RAM_BASE + SEQ_RAM_STRIDE * n
    }

    pub const FRONT_INPUTS: usize = 2;
    pub const UNIVERSAL_INPUTS: usize = 4;
    pub const BACKPLANE_INPUTS: usize = 16;

    const FRONT_IN_MAP_BASE: usize = 0x0500;
    const UNIVERSAL_IN_MAP_BASE: usize = 0x0540;
    const BACKPLANE_IN_MAP_BASE: usize = 0x0600;

    pub const fn front_in_map(n: usize) -> usize {
        FRONT_IN_MAP_BASE + 4 * n
    }

    pub const fn universal_in_map(n: usize) -> usize {
        UNIVERSAL_IN_MAP_BASE + 4 * n
    }

    pub const fn backplane_in_map(n: usize) -> usize {
        BACKPLANE_IN_MAP_BASE + 4 * n
    }

    /// Sequencer trigger field of an input mapping register, one bit per engine.
    pub const IN_MAP_SEQ_TRIG_SHIFT: u32 = 24;
    pub const IN_MAP_SEQ_TRIG_MASK: u32 = 0x0300_0000;

    pub const fn in_map_seq_trig(n: usize) -> u32 {
        1 << (IN_MAP_SEQ_TRIG_SHIFT + n as u32)
    }
}

/// EVR (300DC) register offsets.
pub mod evr {
    pub const SEQUENCERS: usize = 1;

    const SEQ_CONTROL_BASE: usize = 0x00e0;
    const SEQ_RAM_BASE: usize = 0xc000;
    const SEQ_RAM_STRIDE: usize = 0x4000;

    pub const fn seq_control(n: usize) -> usize {
        SEQ_CONTROL_BASE + 4 * n
    }

    pub const fn seq_ram(n: usize) -> usize {
        SEQ_RAM_BASE + SEQ_RAM_STRIDE * n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_software_owned_bits() {
        assert_eq!(control::SOFTWARE_OWNED, 0x0018_00ff);
        assert_eq!(control::SOFTWARE_OWNED & control::PULSE_MASK, 0);
        assert_eq!(control::STATUS_MASK, 0x0300_0000);
    }

    #[test]
    fn test_engine_offsets() {
        assert_eq!(evg::seq_control(1), 0x0074);
        assert_eq!(evg::seq_ram(1), 0xc000);
        assert_eq!(ram::timestamp_offset(evg::seq_ram(0), 3), 0x8018);
        assert_eq!(ram::code_offset(evg::seq_ram(0), 3), 0x801c);
        assert!(evg::seq_ram(0) + ram::WINDOW_BYTES <= evg::seq_ram(1));
    }

    #[test]
    fn test_irq_bits() {
        assert_eq!(irq::start_of_sequence(0), 0x100);
        assert_eq!(irq::start_of_sequence(1), 0x200);
        assert_eq!(irq::end_of_sequence(1), 0x2000);
        assert_eq!(evg::in_map_seq_trig(1), 0x0200_0000);
        assert_eq!(
            evg::in_map_seq_trig(0) | evg::in_map_seq_trig(1),
            evg::IN_MAP_SEQ_TRIG_MASK
        );
    }
}
