// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Display;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Rejected configuration, e.g. a non-monotonic timestamp table.
    #[error("{0}")]
    Configuration(String),

    #[error("All hardware sequencers are in use")]
    NoFreeSlot,

    #[error(transparent)]
    Hardware(#[from] seq_registers::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    pub fn new<T>(msg: T) -> Self
    where
        T: Display,
    {
        Error::Configuration(msg.to_string())
    }
}
