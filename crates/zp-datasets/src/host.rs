// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Host selection and the critical section guarding it.
//!
//! The `zfs` tooling on provisioner nodes addresses a remote storage host
//! through a single process environment variable rather than a per-call
//! argument. Any call that relies on that ambient selector must own it for
//! the whole duration of the remote call, so all such calls in the process
//! run one at a time regardless of which host they target.
//!
//! The lock is not reentrant. Code already inside [`HostLock::with_host`]
//! must not call back into it; compose separate critical sections instead.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, OwnedMutexGuard};
use tracing::{debug, trace};

/// Environment variable read by the host-aware `zfs` wrapper.
pub const DEFAULT_HOST_ENV_VAR: &str = "ZFS_HOST";

/// Shared by every ambient-selector user in the process.
static PROCESS_SELECTOR_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// The ambient "current host" addressing mechanism.
pub trait HostSelector: Send + Sync {
    /// Point subsequent remote calls at `host`.
    fn select(&self, host: &str) -> io::Result<()>;

    /// The currently selected host, if any.
    fn current(&self) -> Option<String>;
}

/// Selects the host by writing a process environment variable.
#[derive(Clone, Debug)]
pub struct EnvHostSelector {
    key: String,
}

impl EnvHostSelector {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Default for EnvHostSelector {
    fn default() -> Self {
        Self::new(DEFAULT_HOST_ENV_VAR)
    }
}

impl HostSelector for EnvHostSelector {
    fn select(&self, host: &str) -> io::Result<()> {
        // set_var panics on these instead of reporting them
        if self.key.is_empty() || self.key.contains(['=', '\0']) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid host selector variable name '{}'", self.key),
            ));
        }
        if host.contains('\0') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "host identifier contains a NUL byte",
            ));
        }
        std::env::set_var(&self.key, host);
        Ok(())
    }

    fn current(&self) -> Option<String> {
        std::env::var(&self.key).ok()
    }
}

/// How remote calls for different hosts are isolated from each other.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostIsolation {
    /// One process-wide critical section; the ambient selector is set on entry.
    #[default]
    Process,
    /// One critical section per host; the ambient selector is never touched.
    PerHost,
}

enum HostGuard {
    Process(#[allow(dead_code)] MutexGuard<'static, ()>),
    Host(#[allow(dead_code)] OwnedMutexGuard<()>),
}

/// Scoped exclusive access to a host for the duration of one remote call.
pub struct HostLock {
    isolation: HostIsolation,
    selector: Arc<dyn HostSelector>,
    per_host: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl HostLock {
    pub fn new(isolation: HostIsolation, selector: Arc<dyn HostSelector>) -> Self {
        Self {
            isolation,
            selector,
            per_host: Mutex::new(HashMap::new()),
        }
    }

    /// A lock using the process-wide critical section and the given selector.
    pub fn process_wide(selector: Arc<dyn HostSelector>) -> Self {
        Self::new(HostIsolation::Process, selector)
    }

    pub fn isolation(&self) -> HostIsolation {
        self.isolation
    }

    /// Run `op` while holding exclusive access to `host`.
    ///
    /// In [`HostIsolation::Process`] mode the ambient selector is pointed at
    /// `host` first; if that fails `op` is never invoked. The guard is
    /// released when this future completes, whatever `op` returned.
    pub async fn with_host<F, Fut, T>(&self, dataset: &str, host: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        debug!(operation = "acquire_host_lock", host = %host, dataset = %dataset, isolation = ?self.isolation, "acquiring lock...");
        let _guard = self.acquire(host).await;
        trace!(operation = "acquire_host_lock", host = %host, "lock acquired");

        if self.isolation == HostIsolation::Process {
            self.selector.select(host).map_err(|source| Error::Environment {
                name: dataset.to_string(),
                host: host.to_string(),
                source,
            })?;
        }

        let result = op().await;
        trace!(operation = "release_host_lock", host = %host, ok = result.is_ok(), "releasing lock");
        result
    }

    async fn acquire(&self, host: &str) -> HostGuard {
        match self.isolation {
            HostIsolation::Process => HostGuard::Process(PROCESS_SELECTOR_LOCK.lock().await),
            HostIsolation::PerHost => {
                let lock = {
                    let mut locks = self.per_host.lock().unwrap_or_else(|p| p.into_inner());
                    // Only the map holds idle entries.
                    locks.retain(|_, lock| Arc::strong_count(lock) > 1);
                    locks.entry(host.to_string()).or_default().clone()
                };
                HostGuard::Host(lock.lock_owned().await)
            }
        }
    }
}

#[cfg(test)]
impl HostLock {
    fn tracked_hosts(&self) -> usize {
        self.per_host.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl std::fmt::Debug for HostLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostLock").field("isolation", &self.isolation).finish()
    }
}
