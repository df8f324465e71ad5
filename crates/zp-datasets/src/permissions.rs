// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Ownership and mode updates for dataset mountpoints.
//!
//! An external helper program does the real work when it is installed. When
//! it cannot be found on the search path the mountpoint only gains the group
//! write bit; uid and gid are left as they are.
//!
//! The helper child always receives the dataset's host in the configured
//! host variable, so it reaches the right host whether or not the process
//! environment names it.

use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::host::DEFAULT_HOST_ENV_VAR;
use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

pub const DEFAULT_PERMISSION_HELPER: &str = "update-permissions";

const GROUP_WRITE: u32 = 0o020;

/// What [`PermissionSetter::apply`] ended up doing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PermissionOutcome {
    Helper { program: PathBuf },
    GroupWriteFallback { previous_mode: u32, mode: u32 },
}

#[derive(Clone, Debug)]
pub struct PermissionSetter {
    helper: String,
    host_env_var: String,
    search_path: Option<OsString>,
}

impl Default for PermissionSetter {
    fn default() -> Self {
        Self::new(DEFAULT_PERMISSION_HELPER)
    }
}

impl PermissionSetter {
    pub fn new(helper: impl Into<String>) -> Self {
        Self {
            helper: helper.into(),
            host_env_var: DEFAULT_HOST_ENV_VAR.to_string(),
            search_path: None,
        }
    }

    /// Search these directories instead of `PATH`.
    pub fn with_search_path(mut self, path: impl Into<OsString>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    pub fn with_host_env_var(mut self, key: impl Into<String>) -> Self {
        self.host_env_var = key.into();
        self
    }

    /// Locate the helper. Evaluated on every call so installs are picked up.
    pub fn resolve_helper(&self) -> Option<PathBuf> {
        match &self.search_path {
            Some(paths) => {
                let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
                which::which_in(&self.helper, Some(paths), cwd).ok()
            }
            None => which::which(&self.helper).ok(),
        }
    }

    pub async fn apply(
        &self,
        dataset: &Dataset,
        uid: &str,
        gid: &str,
        perm: &str,
    ) -> Result<PermissionOutcome> {
        match self.resolve_helper() {
            Some(program) => self.run_helper(dataset, program, uid, gid, perm).await,
            None => {
                warn!(operation = "set_permissions", helper = %self.helper, dataset = %dataset.name, host = %dataset.host, "permission helper not found, only adding group write bit");
                add_group_write(dataset).await
            }
        }
    }

    async fn run_helper(
        &self,
        dataset: &Dataset,
        program: PathBuf,
        uid: &str,
        gid: &str,
        perm: &str,
    ) -> Result<PermissionOutcome> {
        debug!(operation = "set_permissions", program = %program.display(), mountpoint = %dataset.mountpoint, uid = %uid, gid = %gid, perm = %perm, "Running permission helper");

        let output = Command::new(&program)
            .args([dataset.mountpoint.as_str(), uid, gid, perm])
            .env(&self.host_env_var, &dataset.host)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                permission_error(
                    dataset,
                    format!("could not run '{}': {}", program.display(), e),
                )
            })?;

        if output.status.success() {
            info!(operation = "set_permissions", dataset = %dataset.name, host = %dataset.host, "permissions updated by helper");
            return Ok(PermissionOutcome::Helper { program });
        }

        // stdout then stderr; the two streams are captured separately, not interleaved
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        let combined = String::from_utf8_lossy(&combined);
        error!(operation = "set_permissions", dataset = %dataset.name, host = %dataset.host, status = %output.status, "permission helper failed");
        Err(permission_error(
            dataset,
            format!("{}: {}", output.status, combined.trim()),
        ))
    }
}

async fn add_group_write(dataset: &Dataset) -> Result<PermissionOutcome> {
    let path = &dataset.mountpoint;
    let metadata = tokio::fs::symlink_metadata(path)
        .await
        .map_err(|e| permission_error(dataset, format!("could not stat '{}': {}", path, e)))?;

    let previous_mode = metadata.permissions().mode() & 0o7777;
    let mode = previous_mode | GROUP_WRITE;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| permission_error(dataset, format!("could not chmod '{}': {}", path, e)))?;

    debug!(operation = "set_permissions", mountpoint = %path, previous_mode = %format!("{:o}", previous_mode), mode = %format!("{:o}", mode), "added group write bit");
    Ok(PermissionOutcome::GroupWriteFallback {
        previous_mode,
        mode,
    })
}

fn permission_error(dataset: &Dataset, message: String) -> Error {
    Error::Permission {
        name: dataset.name.clone(),
        host: dataset.host.clone(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn missing_helper() -> PermissionSetter {
        PermissionSetter::new("zp-no-such-permission-helper").with_search_path("/nonexistent")
    }

    #[tokio::test]
    async fn fallback_only_adds_group_write() {
        for (before, after) in [(0o644, 0o664), (0o750, 0o770), (0o700, 0o720), (0o664, 0o664)] {
            let dir = tempfile::tempdir().unwrap();
            let mount = dir.path().join("vol");
            fs::create_dir(&mount).unwrap();
            fs::set_permissions(&mount, fs::Permissions::from_mode(before)).unwrap();

            let ds = Dataset::new("tank/vol", "node-a").with_mountpoint(mount.to_str().unwrap());
            let outcome = missing_helper().apply(&ds, "1000", "1000", "0775").await.unwrap();

            assert_eq!(
                outcome,
                PermissionOutcome::GroupWriteFallback {
                    previous_mode: before,
                    mode: after
                }
            );
            let mode = fs::metadata(&mount).unwrap().permissions().mode() & 0o7777;
            assert_eq!(mode, after, "mode {:o} should become {:o}", before, after);
        }
    }

    #[tokio::test]
    async fn fallback_reports_missing_mountpoint() {
        let ds = Dataset::new("tank/gone", "node-b").with_mountpoint("/nonexistent/zp/mount");
        let err = missing_helper().apply(&ds, "0", "0", "0770").await.unwrap_err();
        assert!(err.is_permission());
        let text = err.to_string();
        assert!(text.contains("tank/gone"));
        assert!(text.contains("node-b"));
    }

    #[tokio::test]
    async fn helper_child_gets_host_variable() {
        let scripts = tempfile::tempdir().unwrap();
        let helper = scripts.path().join("update-permissions");
        fs::write(
            &helper,
            "#!/bin/sh\necho \"$ZP_TEST_HELPER_HOST\" > \"$(dirname \"$0\")/host\"\n",
        )
        .unwrap();
        fs::set_permissions(&helper, fs::Permissions::from_mode(0o755)).unwrap();

        let setter = PermissionSetter::default()
            .with_search_path(scripts.path())
            .with_host_env_var("ZP_TEST_HELPER_HOST");
        let mount = tempfile::tempdir().unwrap();
        let ds = Dataset::new("tank/vol", "node-h").with_mountpoint(mount.path().to_str().unwrap());

        let outcome = setter.apply(&ds, "1000", "1000", "0770").await.unwrap();
        assert!(matches!(outcome, PermissionOutcome::Helper { .. }));
        let host = fs::read_to_string(scripts.path().join("host")).unwrap();
        assert_eq!(host.trim(), "node-h");
        assert!(std::env::var("ZP_TEST_HELPER_HOST").is_err());
    }

    #[test]
    fn helper_is_not_resolved_outside_search_path() {
        assert!(missing_helper().resolve_helper().is_none());
    }
}
