// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration for the dataset directory.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `ZP_*` environment variables (`ZP_USE_SUDO=true` sets `use-sudo`).

use crate::backend::{HostDelivery, ZfsCommandBackend};
use crate::directory::DatasetDirectory;
use crate::error::{Error, Result};
use crate::host::{DEFAULT_HOST_ENV_VAR, EnvHostSelector};
use crate::permissions::{DEFAULT_PERMISSION_HELPER, PermissionSetter};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub const ENV_PREFIX: &str = "ZP";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DatasetsConfig {
    /// Environment variable naming the target storage host
    pub host_env_var: String,
    /// `zfs` executable, resolved through `PATH` when not absolute
    pub zfs_binary: String,
    /// External program updating ownership and mode of mountpoints
    pub permission_helper: String,
    /// Run `zfs` through `sudo -n` when not already root
    pub use_sudo: bool,
    pub host_delivery: HostDelivery,
}

impl Default for DatasetsConfig {
    fn default() -> Self {
        Self {
            host_env_var: DEFAULT_HOST_ENV_VAR.to_string(),
            zfs_binary: "zfs".to_string(),
            permission_helper: DEFAULT_PERMISSION_HELPER.to_string(),
            use_sudo: false,
            host_delivery: HostDelivery::Ambient,
        }
    }
}

impl DatasetsConfig {
    /// Load defaults, then `file` (if given), then `ZP_*` environment variables.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let built = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .convert_case(config::Case::Kebab)
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host_env_var.is_empty() {
            return Err(Error::Config("host-env-var must not be empty".to_string()));
        }
        if self.zfs_binary.is_empty() {
            return Err(Error::Config("zfs-binary must not be empty".to_string()));
        }
        if self.permission_helper.is_empty() {
            return Err(Error::Config(
                "permission-helper must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn backend(&self) -> ZfsCommandBackend {
        ZfsCommandBackend::new()
            .with_binary(&self.zfs_binary)
            .with_host_env_var(&self.host_env_var)
            .with_delivery(self.host_delivery)
            .with_sudo(self.use_sudo)
    }

    pub fn selector(&self) -> EnvHostSelector {
        EnvHostSelector::new(&self.host_env_var)
    }

    pub fn permission_setter(&self) -> PermissionSetter {
        PermissionSetter::new(&self.permission_helper).with_host_env_var(&self.host_env_var)
    }
}

impl DatasetDirectory<ZfsCommandBackend> {
    pub fn from_config(config: &DatasetsConfig) -> Self {
        DatasetDirectory::with_selector(config.backend(), Arc::new(config.selector()))
            .with_permission_setter(config.permission_setter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostIsolation;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn parses_kebab_case_toml() {
        let config = DatasetsConfig::from_toml_str(
            r#"
host-env-var = "STORAGE_HOST"
use-sudo = true
host-delivery = "per-command"
"#,
        )
        .unwrap();
        assert_eq!(config.host_env_var, "STORAGE_HOST");
        assert!(config.use_sudo);
        assert_eq!(config.host_delivery, HostDelivery::PerCommand);
        assert_eq!(config.zfs_binary, "zfs");
    }

    #[test]
    fn rejects_empty_values() {
        let err = DatasetsConfig::from_toml_str("zfs-binary = \"\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    #[serial]
    fn load_layers_file_and_environment() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "zfs-binary = \"/usr/local/sbin/zfs\"").unwrap();
        writeln!(file, "permission-helper = \"set-perms\"").unwrap();

        std::env::set_var("ZP_PERMISSION_HELPER", "env-perms");
        std::env::set_var("ZP_USE_SUDO", "true");
        let loaded = DatasetsConfig::load(Some(file.path()));
        std::env::remove_var("ZP_PERMISSION_HELPER");
        std::env::remove_var("ZP_USE_SUDO");

        let config = loaded.unwrap();
        assert_eq!(config.zfs_binary, "/usr/local/sbin/zfs");
        assert_eq!(config.permission_helper, "env-perms");
        assert!(config.use_sudo);
        assert_eq!(config.host_env_var, DEFAULT_HOST_ENV_VAR);
    }

    #[test]
    #[serial]
    fn load_without_file_yields_defaults() {
        let config = DatasetsConfig::load(None).unwrap();
        assert_eq!(config, DatasetsConfig::default());
    }

    #[test]
    fn directory_follows_delivery() {
        let config = DatasetsConfig {
            host_delivery: HostDelivery::PerCommand,
            ..Default::default()
        };
        let dir = DatasetDirectory::from_config(&config);
        assert_eq!(dir.host_lock().isolation(), HostIsolation::PerHost);
        assert_eq!(
            DatasetDirectory::from_config(&DatasetsConfig::default())
                .host_lock()
                .isolation(),
            HostIsolation::Process
        );
    }
}
