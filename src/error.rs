use std::{io, path::PathBuf};

use thiserror::Error;

use crate::{
    alarm::{AlarmId, Category},
    lock_order::LockName,
};

#[derive(Debug, Error)]
pub enum AlarmError {
    #[error("alarm {0} not found")]
    NotFound(AlarmId),

    #[error("all {capacity} display groups are busy, category {category} left unassigned")]
    CapacityExhausted { category: Category, capacity: usize },

    #[error("invalid category {0:?}: expected one or two characters")]
    InvalidCategory(String),

    #[error("{0} lock poisoned")]
    LockPoisoned(LockName),

    #[error("couldn't start display worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("invalid config: {field} {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: &'static str,
    },

    #[error("couldn't read config {path}: {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("couldn't parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("couldn't serialize config: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("couldn't write config {path}: {source}")]
    ConfigWrite { path: PathBuf, source: io::Error },

    #[error("couldn't find a config directory for this platform")]
    NoConfigDir,
}

impl AlarmError {
    /// Lock and spawn failures leave the shared registries in an unknown state.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::LockPoisoned(_) | Self::Spawn(_))
    }
}

/// Terminates the process after a fatal error on a background thread.
pub fn fatal(context: &str, err: &AlarmError) -> ! {
    log::error!("{context}: {err}");
    eprintln!("FATAL: {context}: {err}");
    std::process::exit(1)
}
