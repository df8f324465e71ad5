// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Dataset value objects and the destroy mode vocabulary.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A dataset record as reported by the storage subsystem.
///
/// Holding a handle means the dataset was resolved against its host at some
/// point; it is not re-validated before use.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DatasetHandle {
    pub name: String,
    pub mountpoint: String,
    pub kind: String,
    pub properties: BTreeMap<String, String>,
}

impl DatasetHandle {
    pub fn new(name: impl Into<String>, mountpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mountpoint: mountpoint.into(),
            kind: "filesystem".to_string(),
            properties: BTreeMap::new(),
        }
    }
}

/// One storage unit living on a specific host.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Dataset {
    pub name: String,
    #[serde(default)]
    pub mountpoint: String,
    pub host: String,
    #[serde(skip)]
    handle: Option<DatasetHandle>,
}

impl Dataset {
    /// Build an unresolved dataset reference.
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mountpoint: String::new(),
            host: host.into(),
            handle: None,
        }
    }

    pub fn with_mountpoint(mut self, mountpoint: impl Into<String>) -> Self {
        self.mountpoint = mountpoint.into();
        self
    }

    /// Build a resolved dataset from a subsystem record.
    pub(crate) fn from_handle(handle: DatasetHandle, host: &str) -> Self {
        Self {
            name: handle.name.clone(),
            mountpoint: handle.mountpoint.clone(),
            host: host.to_string(),
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> Option<&DatasetHandle> {
        self.handle.as_ref()
    }

    pub fn is_resolved(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn set_handle(&mut self, handle: DatasetHandle) {
        self.handle = Some(handle);
    }

    /// Check the fields every operation other than lookup relies on.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation(format!(
                "undefined dataset name on host '{}'",
                self.host
            )));
        }
        if self.host.is_empty() {
            return Err(Error::Validation(format!(
                "required hostname parameter not given for dataset '{}'",
                self.name
            )));
        }
        Ok(())
    }
}

impl PartialEq for Dataset {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.mountpoint == other.mountpoint && self.host == other.host
    }
}

impl Eq for Dataset {}

/// Destroy semantics understood by the storage subsystem.
///
/// Raw values match the subsystem's flag bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DestroyMode {
    Default = 1,
    Recursive = 2,
    RecursiveClones = 4,
    DeferDeletion = 8,
    ForceUnmount = 16,
}

impl DestroyMode {
    pub const ALL: [DestroyMode; 5] = [
        DestroyMode::Default,
        DestroyMode::Recursive,
        DestroyMode::RecursiveClones,
        DestroyMode::DeferDeletion,
        DestroyMode::ForceUnmount,
    ];

    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// Extra `zfs destroy` arguments for this mode.
    pub fn zfs_args(self) -> &'static [&'static str] {
        match self {
            DestroyMode::Default => &[],
            DestroyMode::Recursive => &["-r"],
            DestroyMode::RecursiveClones => &["-R"],
            DestroyMode::DeferDeletion => &["-d"],
            DestroyMode::ForceUnmount => &["-f"],
        }
    }
}

impl fmt::Display for DestroyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestroyMode::Default => write!(f, "default"),
            DestroyMode::Recursive => write!(f, "recursive"),
            DestroyMode::RecursiveClones => write!(f, "recursive-clones"),
            DestroyMode::DeferDeletion => write!(f, "defer-deletion"),
            DestroyMode::ForceUnmount => write!(f, "force-unmount"),
        }
    }
}

impl TryFrom<u32> for DestroyMode {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        DestroyMode::ALL
            .into_iter()
            .find(|mode| mode.as_raw() == raw)
            .ok_or_else(|| Error::Programmer(format!("flag not implemented: {}", raw)))
    }
}

impl FromStr for DestroyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DestroyMode::ALL
            .into_iter()
            .find(|mode| mode.to_string() == s.to_lowercase())
            .ok_or_else(|| Error::Programmer(format!("unknown destroy mode: {}", s)))
    }
}
