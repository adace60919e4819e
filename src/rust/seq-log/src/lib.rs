// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Logging for the soft sequencer crates.
//!
//! Every record carries the target `mrf.seq::<module path>`, so a driver can
//! filter the sequencer out of its own log with a single prefix.
use std::sync::{atomic::AtomicBool, atomic::Ordering};

#[doc(hidden)]
pub use log as _log;

#[macro_export]
macro_rules! info {
    ($msg:literal, $($arg:tt)+) => {
        seq_log::_log::info!(target: concat!("mrf.seq::", module_path!()), $msg, $($arg)+);
    };
    ($msg:literal) => {
        seq_log::_log::info!(target: concat!("mrf.seq::", module_path!()), $msg);
    };
}

#[macro_export]
macro_rules! warn {
    ($msg:literal, $($arg:tt)+) => {
        seq_log::_log::warn!(target: concat!("mrf.seq::", module_path!()), $msg, $($arg)+);
    };
    ($msg:literal) => {
        seq_log::_log::warn!(target: concat!("mrf.seq::", module_path!()), $msg);
    };
}

/// Log a diagnostic message at debug level if diagnostics logging is enabled.
///
/// Diagnostics cover the per-operation chatter of the sequencer (disarm
/// results, deferred RAM writes), which is too noisy for normal operation.
#[macro_export]
macro_rules! diagnostic {
    ($msg:literal, $($arg:tt)+) => {
        if seq_log::is_diagnostics_enabled() {
            seq_log::_log::debug!(target: concat!("mrf.seq::", module_path!()), $msg, $($arg)+);
        }
    };
    ($msg:literal) => {
        if seq_log::is_diagnostics_enabled() {
            seq_log::_log::debug!(target: concat!("mrf.seq::", module_path!()), $msg);
        }
    };
}

static DIAGNOSTICS_ENABLED: AtomicBool = AtomicBool::new(false);

#[inline]
pub fn is_diagnostics_enabled() -> bool {
    DIAGNOSTICS_ENABLED.load(Ordering::Acquire)
}

/// Set whether sequencer diagnostics are logged.
///
/// Diagnostics are the debug level records of the register level work:
/// the running and armed state seen by each disarm, syncs deferred to the
/// end-of-sequence interrupt, every table written to sequencer RAM, external
/// trigger mappings an EVR cannot honour, and the fields device configuration
/// sanitizing filled in. Info and warning records are always emitted.
///
/// The embedding driver picks the `log` backend; none is installed here.
pub fn init_logging(with_diagnostics: bool) {
    DIAGNOSTICS_ENABLED.store(with_diagnostics, Ordering::Release);
}
