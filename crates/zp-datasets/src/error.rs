// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for dataset management operations

use thiserror::Error;

/// Result type alias for dataset operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the dataset directory.
///
/// Every variant that concerns a concrete dataset carries its name and host
/// so failures can be attributed when several storage hosts are in play.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    /// A caller contract violation rather than a runtime failure.
    #[error("programmer error: {0}")]
    Programmer(String),

    #[error("dataset '{name}' not found on host '{host}'")]
    NotFound { name: String, host: String },

    #[error("dataset '{name}' already exists on host '{host}'")]
    AlreadyExists { name: String, host: String },

    #[error("{operation} failed for dataset '{name}' on host '{host}': {message}")]
    Remote {
        operation: &'static str,
        name: String,
        host: String,
        message: String,
    },

    #[error("could not update permissions of dataset '{name}' on host '{host}': {message}")]
    Permission {
        name: String,
        host: String,
        message: String,
    },

    #[error("could not select host '{host}' for dataset '{name}': {source}")]
    Environment {
        name: String,
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for malformed input, including caller contract violations.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::Programmer(_))
    }

    pub fn is_programmer(&self) -> bool {
        matches!(self, Error::Programmer(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Remote { .. })
    }

    pub fn is_permission(&self) -> bool {
        matches!(self, Error::Permission { .. })
    }

    pub fn is_environment(&self) -> bool {
        matches!(self, Error::Environment { .. })
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
