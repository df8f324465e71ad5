// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Backend driving the `zfs` command-line tool.
//!
//! On provisioner nodes `zfs` is usually a wrapper that forwards the command
//! to the storage host named by an environment variable. With
//! [`HostDelivery::Ambient`] the child inherits that variable from the
//! process, so callers must hold the process-wide host lock. With
//! [`HostDelivery::PerCommand`] the variable is set on each child only.

use super::{BackendError, BackendResult, DatasetBackend, DatasetProperties};
use crate::dataset::{DatasetHandle, DestroyMode};
use crate::host::{DEFAULT_HOST_ENV_VAR, HostIsolation};
use async_trait::async_trait;
use libc::geteuid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, error, info};

/// Columns requested from `zfs list`, in output order.
const LIST_COLUMNS: &[&str] = &[
    "name",
    "type",
    "mountpoint",
    "origin",
    "used",
    "avail",
    "quota",
    "recordsize",
    "compression",
];

/// How the target host reaches the `zfs` child process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostDelivery {
    /// Inherit the process-wide host selector.
    #[default]
    Ambient,
    /// Set the host variable on each child process.
    PerCommand,
}

#[derive(Clone, Debug)]
pub struct ZfsCommandBackend {
    binary: String,
    host_env_var: String,
    delivery: HostDelivery,
    use_sudo: bool,
}

impl Default for ZfsCommandBackend {
    fn default() -> Self {
        Self {
            binary: "zfs".to_string(),
            host_env_var: DEFAULT_HOST_ENV_VAR.to_string(),
            delivery: HostDelivery::Ambient,
            use_sudo: false,
        }
    }
}

impl ZfsCommandBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_host_env_var(mut self, key: impl Into<String>) -> Self {
        self.host_env_var = key.into();
        self
    }

    pub fn with_delivery(mut self, delivery: HostDelivery) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_sudo(mut self, use_sudo: bool) -> Self {
        self.use_sudo = use_sudo;
        self
    }

    fn command(&self, host: &str, args: &[String]) -> Command {
        let elevate = self.use_sudo && !running_as_root();
        let mut cmd = if elevate {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n");
            match self.delivery {
                HostDelivery::Ambient => {
                    cmd.arg(format!("--preserve-env={}", self.host_env_var));
                }
                HostDelivery::PerCommand => {
                    cmd.arg(format!("{}={}", self.host_env_var, host));
                }
            }
            cmd.arg(&self.binary);
            cmd
        } else {
            Command::new(&self.binary)
        };
        cmd.args(args);
        if self.delivery == HostDelivery::PerCommand {
            cmd.env(&self.host_env_var, host);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    async fn run(&self, host: &str, args: Vec<String>) -> BackendResult<Output> {
        debug!(operation = "run_zfs", program = %self.binary, host = %host, args = ?args, "Running command");

        let output = self.command(host, &args).output().await?;
        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_failure(stderr.trim(), output.status.code()))
        }
    }
}

#[async_trait]
impl DatasetBackend for ZfsCommandBackend {
    fn isolation(&self) -> HostIsolation {
        match self.delivery {
            HostDelivery::Ambient => HostIsolation::Process,
            HostDelivery::PerCommand => HostIsolation::PerHost,
        }
    }

    async fn get_dataset(&self, host: &str, name: &str) -> BackendResult<DatasetHandle> {
        let output = self.run(host, list_args(name)).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .find(|line| !line.trim().is_empty())
            .ok_or(BackendError::NotFound)?;
        let handle = parse_list_line(line)?;
        if handle.name != name {
            debug!(operation = "zfs_list", requested = %name, listed = %handle.name, "zfs listed a different dataset");
            return Err(BackendError::NotFound);
        }
        Ok(handle)
    }

    async fn create_filesystem(
        &self,
        host: &str,
        name: &str,
        properties: &DatasetProperties,
    ) -> BackendResult<DatasetHandle> {
        info!(operation = "zfs_create", dataset = %name, host = %host, properties = ?properties, "creating dataset");
        self.run(host, create_args(name, properties)).await?;
        self.get_dataset(host, name).await
    }

    async fn destroy(
        &self,
        host: &str,
        handle: &DatasetHandle,
        mode: DestroyMode,
    ) -> BackendResult<()> {
        info!(operation = "zfs_destroy", dataset = %handle.name, host = %host, mode = %mode, "destroying dataset");
        self.run(host, destroy_args(&handle.name, mode))
            .await
            .map(|_| ())
            .inspect_err(|e| {
                error!(operation = "zfs_destroy", dataset = %handle.name, host = %host, error = %e, "Failed to destroy dataset");
            })
    }
}

fn running_as_root() -> bool {
    unsafe { geteuid() == 0 }
}

fn list_args(name: &str) -> Vec<String> {
    vec![
        "list".to_string(),
        "-H".to_string(),
        "-p".to_string(),
        "-t".to_string(),
        "all".to_string(),
        "-o".to_string(),
        LIST_COLUMNS.join(","),
        "--".to_string(),
        name.to_string(),
    ]
}

fn create_args(name: &str, properties: &DatasetProperties) -> Vec<String> {
    let mut args = vec!["create".to_string()];
    for (key, value) in properties {
        args.push("-o".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push("--".to_string());
    args.push(name.to_string());
    args
}

fn destroy_args(name: &str, mode: DestroyMode) -> Vec<String> {
    let mut args = vec!["destroy".to_string()];
    args.extend(mode.zfs_args().iter().map(|s| s.to_string()));
    args.push("--".to_string());
    args.push(name.to_string());
    args
}

/// Map `zfs` stderr onto the typed backend errors.
fn classify_failure(stderr: &str, code: Option<i32>) -> BackendError {
    if stderr.contains("dataset does not exist") || stderr.contains("no such pool") {
        BackendError::NotFound
    } else if stderr.contains("dataset already exists") {
        BackendError::AlreadyExists
    } else if stderr.is_empty() {
        BackendError::Failed(format!("zfs exited with status {:?}", code))
    } else {
        BackendError::Failed(stderr.to_string())
    }
}

/// Parse one tab-separated `zfs list -H` line laid out as [`LIST_COLUMNS`].
fn parse_list_line(line: &str) -> BackendResult<DatasetHandle> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != LIST_COLUMNS.len() {
        return Err(BackendError::Failed(format!(
            "unexpected zfs list output: expected {} columns, got {}",
            LIST_COLUMNS.len(),
            fields.len()
        )));
    }

    let mountpoint = match fields[2] {
        "-" | "none" | "legacy" => String::new(),
        other => other.to_string(),
    };
    let properties: BTreeMap<String, String> = LIST_COLUMNS[3..]
        .iter()
        .zip(&fields[3..])
        .filter(|(_, value)| **value != "-")
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();

    Ok(DatasetHandle {
        name: fields[0].to_string(),
        kind: fields[1].to_string(),
        mountpoint,
        properties,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_filesystem_line() {
        let line = "tank/pv-1\tfilesystem\t/tank/pv-1\t-\t98304\t1073741824\t10737418240\t131072\tlz4";
        let handle = parse_list_line(line).unwrap();
        assert_eq!(handle.name, "tank/pv-1");
        assert_eq!(handle.kind, "filesystem");
        assert_eq!(handle.mountpoint, "/tank/pv-1");
        assert_eq!(handle.properties.get("quota").map(String::as_str), Some("10737418240"));
        assert!(!handle.properties.contains_key("origin"));
    }

    #[test]
    fn unmounted_datasets_have_empty_mountpoint() {
        for mp in ["-", "none", "legacy"] {
            let line = format!("tank/x\tfilesystem\t{}\t-\t1\t2\t0\t131072\toff", mp);
            assert_eq!(parse_list_line(&line).unwrap().mountpoint, "");
        }
    }

    #[test]
    fn rejects_truncated_output() {
        let err = parse_list_line("tank/x\tfilesystem").unwrap_err();
        assert!(matches!(err, BackendError::Failed(_)));
    }

    #[test]
    fn classifies_stderr() {
        assert!(matches!(
            classify_failure("cannot open 'tank/x': dataset does not exist", Some(1)),
            BackendError::NotFound
        ));
        assert!(matches!(
            classify_failure("cannot create 'tank/x': dataset already exists", Some(1)),
            BackendError::AlreadyExists
        ));
        match classify_failure("cannot destroy 'tank/x': pool is busy", Some(1)) {
            BackendError::Failed(msg) => assert!(msg.contains("pool is busy")),
            other => panic!("unexpected classification: {:?}", other),
        }
        match classify_failure("", Some(2)) {
            BackendError::Failed(msg) => assert!(msg.contains("Some(2)")),
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[test]
    fn builds_command_arguments() {
        let mut props = DatasetProperties::new();
        props.insert("quota".into(), "10G".into());
        props.insert("recordsize".into(), "16k".into());
        assert_eq!(
            create_args("data/vol1", &props),
            vec!["create", "-o", "quota=10G", "-o", "recordsize=16k", "--", "data/vol1"]
        );
        assert_eq!(
            destroy_args("data/vol1", DestroyMode::Recursive),
            vec!["destroy", "-r", "--", "data/vol1"]
        );
        let list = list_args("-r");
        assert_eq!(&list[list.len() - 2..], &["--", "-r"]);
    }

    #[test]
    fn delivery_selects_isolation() {
        assert_eq!(ZfsCommandBackend::new().isolation(), HostIsolation::Process);
        assert_eq!(
            ZfsCommandBackend::new()
                .with_delivery(HostDelivery::PerCommand)
                .isolation(),
            HostIsolation::PerHost
        );
    }
}
