// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// State shared between task context and the interrupt handler.
///
/// Holding an [`IrqSection`] stands for running with the sequencer interrupt
/// masked: the handler never observes the state while a section is open, and
/// task code never observes a half-finished handler. On hosted targets the
/// handler is a thread, so the mask is a short mutex that is never held across
/// anything but register accesses.
pub(crate) struct InterruptLock<T> {
    inner: Mutex<T>,
}

pub(crate) struct IrqSection<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<T> InterruptLock<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Enter the masked section.
    ///
    /// A panic while masked leaves no partially applied state behind that a
    /// later section could not cope with, so poisoning is ignored.
    pub(crate) fn mask(&self) -> IrqSection<'_, T> {
        IrqSection {
            guard: self.inner.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

impl<T> Deref for IrqSection<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSection<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
