// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Storage subsystem seam.
//!
//! Backends receive the target host explicitly on every call. Whether they
//! also depend on the ambient host selector is declared through
//! [`DatasetBackend::isolation`]; the directory picks its locking mode from it.

use crate::dataset::{DatasetHandle, DestroyMode};
use crate::host::HostIsolation;
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod zfs;

#[cfg(any(test, feature = "test-utils"))]
pub use memory::{BackendCall, InMemoryBackend};
pub use zfs::{HostDelivery, ZfsCommandBackend};

/// Dataset creation options, passed through to the subsystem verbatim.
pub type DatasetProperties = BTreeMap<String, String>;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Failures reported by a storage backend, before dataset/host context is added.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("dataset does not exist")]
    NotFound,

    #[error("dataset already exists")]
    AlreadyExists,

    #[error("{0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatasetBackend: Send + Sync {
    /// How calls for different hosts must be isolated.
    fn isolation(&self) -> HostIsolation;

    async fn get_dataset(&self, host: &str, name: &str) -> BackendResult<DatasetHandle>;

    async fn create_filesystem(
        &self,
        host: &str,
        name: &str,
        properties: &DatasetProperties,
    ) -> BackendResult<DatasetHandle>;

    async fn destroy(
        &self,
        host: &str,
        handle: &DatasetHandle,
        mode: DestroyMode,
    ) -> BackendResult<()>;
}
