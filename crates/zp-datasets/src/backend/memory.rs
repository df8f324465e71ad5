// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory backend for tests.
//!
//! Keeps one dataset table per host, records every call, and audits the
//! ambient host selector: when built with a selector, each call checks that
//! the selector names the call's host both on entry and after its simulated
//! latency, and records any mismatch.

use super::{BackendError, BackendResult, DatasetBackend, DatasetProperties};
use crate::dataset::{DatasetHandle, DestroyMode};
use crate::host::{HostIsolation, HostSelector};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendCall {
    Get {
        host: String,
        name: String,
    },
    Create {
        host: String,
        name: String,
        properties: DatasetProperties,
    },
    Destroy {
        host: String,
        name: String,
        mode: DestroyMode,
    },
}

/// A call that ran while the ambient selector named another host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectorMismatch {
    pub expected: String,
    pub observed: Option<String>,
}

#[derive(Default)]
struct State {
    hosts: HashMap<String, BTreeMap<String, DatasetHandle>>,
    calls: Vec<BackendCall>,
    mismatches: Vec<SelectorMismatch>,
    failures: HashMap<&'static str, String>,
}

pub struct InMemoryBackend {
    isolation: HostIsolation,
    selector: Option<Arc<dyn HostSelector>>,
    latency: Duration,
    mount_root: Option<String>,
    state: Mutex<State>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            isolation: HostIsolation::Process,
            selector: None,
            latency: Duration::ZERO,
            mount_root: None,
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_isolation(mut self, isolation: HostIsolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// Audit the given selector on every call.
    pub fn with_selector(mut self, selector: Arc<dyn HostSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Sleep this long inside every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Mount new datasets at `<root>/<last name component>` instead of `/<name>`.
    pub fn with_mount_root(mut self, root: impl Into<String>) -> Self {
        self.mount_root = Some(root.into());
        self
    }

    pub fn insert(&self, host: &str, handle: DatasetHandle) {
        self.state()
            .hosts
            .entry(host.to_string())
            .or_default()
            .insert(handle.name.clone(), handle);
    }

    pub fn contains(&self, host: &str, name: &str) -> bool {
        self.state()
            .hosts
            .get(host)
            .is_some_and(|table| table.contains_key(name))
    }

    /// Make every subsequent call of `operation` ("get", "create" or "destroy") fail.
    pub fn fail_operation(&self, operation: &'static str, message: impl Into<String>) {
        self.state().failures.insert(operation, message.into());
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state().calls.clone()
    }

    pub fn get_calls(&self) -> usize {
        self.count(|call| matches!(call, BackendCall::Get { .. }))
    }

    pub fn create_calls(&self) -> usize {
        self.count(|call| matches!(call, BackendCall::Create { .. }))
    }

    pub fn destroy_calls(&self) -> usize {
        self.count(|call| matches!(call, BackendCall::Destroy { .. }))
    }

    pub fn selector_mismatches(&self) -> Vec<SelectorMismatch> {
        self.state().mismatches.clone()
    }

    fn count(&self, pred: impl Fn(&BackendCall) -> bool) -> usize {
        self.state().calls.iter().filter(|call| pred(call)).count()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn audit_selector(&self, host: &str) {
        if self.isolation != HostIsolation::Process {
            return;
        }
        if let Some(selector) = &self.selector {
            let observed = selector.current();
            if observed.as_deref() != Some(host) {
                self.state().mismatches.push(SelectorMismatch {
                    expected: host.to_string(),
                    observed,
                });
            }
        }
    }

    /// Record the call and simulate a remote round trip.
    async fn enter(&self, operation: &'static str, call: BackendCall) -> BackendResult<()> {
        let host = match &call {
            BackendCall::Get { host, .. }
            | BackendCall::Create { host, .. }
            | BackendCall::Destroy { host, .. } => host.clone(),
        };
        self.state().calls.push(call);
        self.audit_selector(&host);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
            self.audit_selector(&host);
        }
        match self.state().failures.get(operation) {
            Some(message) => Err(BackendError::Failed(message.clone())),
            None => Ok(()),
        }
    }

    fn mountpoint_for(&self, name: &str, properties: &DatasetProperties) -> String {
        if let Some(mountpoint) = properties.get("mountpoint") {
            return mountpoint.clone();
        }
        match &self.mount_root {
            Some(root) => {
                let leaf = name.rsplit('/').next().unwrap_or(name);
                format!("{}/{}", root.trim_end_matches('/'), leaf)
            }
            None => format!("/{}", name),
        }
    }
}

#[async_trait]
impl DatasetBackend for InMemoryBackend {
    fn isolation(&self) -> HostIsolation {
        self.isolation
    }

    async fn get_dataset(&self, host: &str, name: &str) -> BackendResult<DatasetHandle> {
        self.enter(
            "get",
            BackendCall::Get {
                host: host.to_string(),
                name: name.to_string(),
            },
        )
        .await?;
        let state = self.state();
        state
            .hosts
            .get(host)
            .and_then(|table| table.get(name))
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    async fn create_filesystem(
        &self,
        host: &str,
        name: &str,
        properties: &DatasetProperties,
    ) -> BackendResult<DatasetHandle> {
        self.enter(
            "create",
            BackendCall::Create {
                host: host.to_string(),
                name: name.to_string(),
                properties: properties.clone(),
            },
        )
        .await?;

        let mut handle = DatasetHandle::new(name, self.mountpoint_for(name, properties));
        handle.properties = properties.clone();

        let mut state = self.state();
        let table = state.hosts.entry(host.to_string()).or_default();
        if table.contains_key(name) {
            return Err(BackendError::AlreadyExists);
        }
        table.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    async fn destroy(
        &self,
        host: &str,
        handle: &DatasetHandle,
        mode: DestroyMode,
    ) -> BackendResult<()> {
        self.enter(
            "destroy",
            BackendCall::Destroy {
                host: host.to_string(),
                name: handle.name.clone(),
                mode,
            },
        )
        .await?;

        let mut state = self.state();
        let table = state.hosts.get_mut(host).ok_or(BackendError::NotFound)?;
        if !table.contains_key(&handle.name) {
            return Err(BackendError::NotFound);
        }
        let prefix = format!("{}/", handle.name);
        let has_children = table.keys().any(|key| key.starts_with(&prefix));
        if has_children && mode == DestroyMode::Default {
            return Err(BackendError::Failed(format!(
                "cannot destroy '{}': filesystem has children",
                handle.name
            )));
        }
        table.retain(|key, _| key != &handle.name && !key.starts_with(&prefix));
        Ok(())
    }
}
