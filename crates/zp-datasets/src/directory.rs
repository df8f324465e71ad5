// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Host-scoped dataset operations used by the volume provisioner.
//!
//! Every remote call runs inside [`HostLock::with_host`]. With a backend that
//! relies on the ambient host selector this caps the whole process at one
//! in-flight storage call, whatever host it targets. That ceiling is accepted
//! for these low-frequency administrative calls.
//!
//! Destroy may need to resolve its dataset first. The lookup runs in its own
//! critical section which is released before the destroy section starts; the
//! lock is not reentrant and nesting the two would deadlock.

use crate::backend::{BackendError, DatasetBackend, DatasetProperties};
use crate::dataset::{Dataset, DestroyMode};
use crate::error::{Error, Result};
use crate::host::{EnvHostSelector, HostLock, HostSelector};
use crate::permissions::{PermissionOutcome, PermissionSetter};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Dataset operations as consumed by the provisioning controller.
#[async_trait]
pub trait DatasetManager: Send + Sync {
    async fn get_dataset(&self, name: &str, host: &str) -> Result<Dataset>;

    async fn create_dataset(
        &self,
        name: &str,
        host: &str,
        properties: &DatasetProperties,
    ) -> Result<Dataset>;

    async fn destroy_dataset(&self, dataset: &mut Dataset, mode: DestroyMode) -> Result<()>;

    async fn set_permissions(
        &self,
        dataset: &Dataset,
        uid: &str,
        gid: &str,
        perm: &str,
    ) -> Result<PermissionOutcome>;
}

pub struct DatasetDirectory<B> {
    backend: B,
    lock: HostLock,
    permissions: PermissionSetter,
}

impl<B: DatasetBackend> DatasetDirectory<B> {
    /// Use the default `ZFS_HOST` environment selector.
    pub fn new(backend: B) -> Self {
        Self::with_selector(backend, Arc::new(EnvHostSelector::default()))
    }

    pub fn with_selector(backend: B, selector: Arc<dyn HostSelector>) -> Self {
        let lock = HostLock::new(backend.isolation(), selector);
        Self {
            backend,
            lock,
            permissions: PermissionSetter::default(),
        }
    }

    pub fn with_permission_setter(mut self, permissions: PermissionSetter) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn host_lock(&self) -> &HostLock {
        &self.lock
    }

    /// Resolve `name` on `host`. Nonexistent datasets may be probed freely.
    pub async fn lookup(&self, name: &str, host: &str) -> Result<Dataset> {
        self.lock
            .with_host(name, host, || async {
                let handle = self
                    .backend
                    .get_dataset(host, name)
                    .await
                    .map_err(|e| remote_error("lookup", name, host, e))?;
                Ok(Dataset::from_handle(handle, host))
            })
            .await
    }

    pub async fn create(
        &self,
        name: &str,
        host: &str,
        properties: &DatasetProperties,
    ) -> Result<Dataset> {
        self.lock
            .with_host(name, host, || async {
                info!(operation = "create_dataset", dataset = %name, host = %host, "creating dataset");
                let handle = self
                    .backend
                    .create_filesystem(host, name, properties)
                    .await
                    .map_err(|e| remote_error("create", name, host, e))?;
                Ok(Dataset::from_handle(handle, host))
            })
            .await
    }

    /// Destroy the dataset. Only [`DestroyMode::Recursive`] is supported.
    ///
    /// An unresolved dataset is looked up first and its handle stored in
    /// `dataset`. An existing handle is trusted as-is; if the dataset vanished
    /// meanwhile the subsystem's error is returned unchanged.
    pub async fn destroy(&self, dataset: &mut Dataset, mode: DestroyMode) -> Result<()> {
        dataset.validate()?;
        if mode != DestroyMode::Recursive {
            return Err(Error::Programmer(format!(
                "flag not implemented: {} ({}) for dataset '{}' on host '{}'",
                mode.as_raw(),
                mode,
                dataset.name,
                dataset.host
            )));
        }

        if !dataset.is_resolved() {
            debug!(operation = "destroy_dataset", dataset = %dataset.name, host = %dataset.host, "resolving dataset before destroy");
            let resolved = self.lookup(&dataset.name, &dataset.host).await?;
            if let Some(handle) = resolved.handle() {
                dataset.set_handle(handle.clone());
            }
            if dataset.mountpoint.is_empty() {
                dataset.mountpoint = resolved.mountpoint;
            }
        }

        let name = dataset.name.as_str();
        let host = dataset.host.as_str();
        let handle = dataset.handle().ok_or_else(|| Error::NotFound {
            name: name.to_string(),
            host: host.to_string(),
        })?;

        self.lock
            .with_host(name, host, || async {
                info!(operation = "destroy_dataset", dataset = %name, host = %host, mode = %mode, "destroying dataset");
                self.backend
                    .destroy(host, handle, mode)
                    .await
                    .map_err(|e| remote_error("destroy", name, host, e))
            })
            .await
    }

    /// Apply ownership and mode to the dataset's mountpoint.
    pub async fn set_permissions(
        &self,
        dataset: &Dataset,
        uid: &str,
        gid: &str,
        perm: &str,
    ) -> Result<PermissionOutcome> {
        dataset.validate()?;
        if dataset.mountpoint.is_empty() {
            return Err(Error::Validation(format!(
                "undefined mountpoint for dataset '{}' on host '{}'",
                dataset.name, dataset.host
            )));
        }

        self.lock
            .with_host(&dataset.name, &dataset.host, || {
                self.permissions.apply(dataset, uid, gid, perm)
            })
            .await
    }
}

#[async_trait]
impl<B: DatasetBackend> DatasetManager for DatasetDirectory<B> {
    async fn get_dataset(&self, name: &str, host: &str) -> Result<Dataset> {
        self.lookup(name, host).await
    }

    async fn create_dataset(
        &self,
        name: &str,
        host: &str,
        properties: &DatasetProperties,
    ) -> Result<Dataset> {
        self.create(name, host, properties).await
    }

    async fn destroy_dataset(&self, dataset: &mut Dataset, mode: DestroyMode) -> Result<()> {
        self.destroy(dataset, mode).await
    }

    async fn set_permissions(
        &self,
        dataset: &Dataset,
        uid: &str,
        gid: &str,
        perm: &str,
    ) -> Result<PermissionOutcome> {
        DatasetDirectory::set_permissions(self, dataset, uid, gid, perm).await
    }
}

fn remote_error(operation: &'static str, name: &str, host: &str, err: BackendError) -> Error {
    match err {
        BackendError::NotFound => Error::NotFound {
            name: name.to_string(),
            host: host.to_string(),
        },
        BackendError::AlreadyExists => Error::AlreadyExists {
            name: name.to_string(),
            host: host.to_string(),
        },
        other => Error::Remote {
            operation,
            name: name.to_string(),
            host: host.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockDatasetBackend;
    use crate::dataset::DatasetHandle;
    use crate::host::HostIsolation;
    use mockall::predicate::eq;
    use std::io;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestSelector(Mutex<Option<String>>);

    impl HostSelector for TestSelector {
        fn select(&self, host: &str) -> io::Result<()> {
            *self.0.lock().unwrap() = Some(host.to_string());
            Ok(())
        }

        fn current(&self) -> Option<String> {
            self.0.lock().unwrap().clone()
        }
    }

    fn directory(backend: MockDatasetBackend) -> DatasetDirectory<MockDatasetBackend> {
        DatasetDirectory::with_selector(backend, Arc::new(TestSelector::default()))
    }

    fn mock() -> MockDatasetBackend {
        let mut backend = MockDatasetBackend::new();
        backend
            .expect_isolation()
            .return_const(HostIsolation::Process);
        backend
    }

    #[tokio::test]
    async fn destroy_unresolved_dataset_looks_up_once() {
        let mut backend = mock();
        backend
            .expect_get_dataset()
            .with(eq("node-a"), eq("tank/pv-1"))
            .times(1)
            .returning(|_, name| Ok(DatasetHandle::new(name, "/tank/pv-1")));
        backend
            .expect_destroy()
            .withf(|host, handle, mode| {
                host == "node-a" && handle.name == "tank/pv-1" && *mode == DestroyMode::Recursive
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let dir = directory(backend);
        let mut ds = Dataset::new("tank/pv-1", "node-a");
        dir.destroy(&mut ds, DestroyMode::Recursive).await.unwrap();
        assert!(ds.is_resolved());
        assert_eq!(ds.mountpoint, "/tank/pv-1");
    }

    #[tokio::test]
    async fn destroy_resolved_dataset_skips_lookup() {
        let mut backend = mock();
        backend.expect_get_dataset().times(0);
        backend
            .expect_destroy()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let dir = directory(backend);
        let mut ds = Dataset::from_handle(DatasetHandle::new("tank/pv-2", "/tank/pv-2"), "node-b");
        dir.destroy(&mut ds, DestroyMode::Recursive).await.unwrap();
    }

    #[tokio::test]
    async fn destroy_rejects_unsupported_modes_without_remote_calls() {
        for mode in DestroyMode::ALL {
            if mode == DestroyMode::Recursive {
                continue;
            }
            let mut backend = mock();
            backend.expect_get_dataset().times(0);
            backend.expect_destroy().times(0);

            let dir = directory(backend);
            let mut ds = Dataset::new("tank/pv-3", "node-a");
            let err = dir.destroy(&mut ds, mode).await.unwrap_err();
            assert!(err.is_programmer(), "mode {} should be rejected", mode);
            let text = err.to_string();
            assert!(text.contains("tank/pv-3"), "{}", text);
            assert!(text.contains("node-a"), "{}", text);
            assert!(!ds.is_resolved());
        }
    }

    #[tokio::test]
    async fn destroy_of_vanished_dataset_reports_not_found() {
        let mut backend = mock();
        backend
            .expect_get_dataset()
            .times(1)
            .returning(|_, _| Err(BackendError::NotFound));
        backend.expect_destroy().times(0);

        let dir = directory(backend);
        let mut ds = Dataset::new("tank/pv-4", "node-c");
        let err = dir.destroy(&mut ds, DestroyMode::Recursive).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("node-c"));
    }

    #[tokio::test]
    async fn invalid_entities_fail_before_remote_calls() {
        let mut backend = mock();
        backend.expect_get_dataset().times(0);
        backend.expect_destroy().times(0);
        let dir = directory(backend);

        let mut no_host = Dataset::new("tank/pv-5", "");
        assert!(dir
            .destroy(&mut no_host, DestroyMode::Recursive)
            .await
            .unwrap_err()
            .is_validation());

        let mut no_name = Dataset::new("", "node-a");
        let err = dir
            .destroy(&mut no_name, DestroyMode::Recursive)
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("node-a"));

        let no_mount = Dataset::new("tank/pv-5", "node-a");
        let err = dir
            .set_permissions(&no_mount, "1000", "1000", "0770")
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("undefined mountpoint"));
    }

    #[tokio::test]
    async fn backend_failures_carry_context() {
        let mut backend = mock();
        backend
            .expect_create_filesystem()
            .times(1)
            .returning(|_, _, _| Err(BackendError::Failed("out of space".into())));
        backend
            .expect_get_dataset()
            .returning(|_, _| Err(BackendError::AlreadyExists));

        let dir = directory(backend);
        let err = dir
            .create("tank/pv-6", "node-d", &DatasetProperties::new())
            .await
            .unwrap_err();
        match &err {
            Error::Remote {
                operation,
                name,
                host,
                message,
            } => {
                assert_eq!(*operation, "create");
                assert_eq!(name, "tank/pv-6");
                assert_eq!(host, "node-d");
                assert_eq!(message, "out of space");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        assert!(dir
            .lookup("tank/pv-6", "node-d")
            .await
            .unwrap_err()
            .is_already_exists());
    }

    #[tokio::test]
    async fn lookup_sets_requested_host() {
        let mut backend = mock();
        backend
            .expect_get_dataset()
            .returning(|_, name| Ok(DatasetHandle::new(name, "/export/vol1")));

        let selector = Arc::new(TestSelector::default());
        let dir = DatasetDirectory::with_selector(backend, selector.clone());
        let ds = dir.lookup("data/vol1", "node-a").await.unwrap();
        assert_eq!(ds.host, "node-a");
        assert_eq!(ds.mountpoint, "/export/vol1");
        assert_eq!(selector.current().as_deref(), Some("node-a"));
    }
}
