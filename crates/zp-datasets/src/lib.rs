// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Host-scoped ZFS dataset management for the volume provisioner.
//!
//! This crate provides:
//! - [`Dataset`] value objects and the [`DestroyMode`] vocabulary
//! - [`HostLock`], the critical section guarding the ambient host selector
//! - [`DatasetDirectory`] with lookup, create, destroy and set-permissions
//! - [`PermissionSetter`], an external helper with a group-write fallback
//! - A `zfs` command-line backend and layered configuration

pub mod backend;
pub mod config;
pub mod dataset;
pub mod directory;
pub mod error;
pub mod host;
pub mod permissions;

pub use backend::{
    BackendError, DatasetBackend, DatasetProperties, HostDelivery, ZfsCommandBackend,
};
#[cfg(any(test, feature = "test-utils"))]
pub use backend::{BackendCall, InMemoryBackend};
pub use config::DatasetsConfig;
pub use dataset::{Dataset, DatasetHandle, DestroyMode};
pub use directory::{DatasetDirectory, DatasetManager};
pub use error::{Error, Result};
pub use host::{EnvHostSelector, HostIsolation, HostLock, HostSelector};
pub use permissions::{PermissionOutcome, PermissionSetter};
