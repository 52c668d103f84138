//! Sandbox configuration supplied by the embedder.
//!
//! A sandbox restricts what a script can see: a filesystem root and mounts
//! (fed into the [`PathTranslator`](crate::path::PathTranslator)), replacement
//! stdio streams, a network admission predicate, and optionally a shared
//! async pool so many sandboxed scripts don't each get their own.

use crate::runtime::pools::AsyncPoolHandle;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Predicate deciding whether a script may touch a network address.
pub type NetworkPolicy = Arc<dyn Fn(&SocketAddr) -> bool + Send + Sync>;

/// Embedder-supplied restrictions for one script runtime.
#[derive(Default)]
pub struct Sandbox {
    /// Physical directory exposed to the script as `/`.
    pub filesystem_root: Option<PathBuf>,
    /// Virtual working directory. Defaults to `/` when a root is set.
    pub working_directory: Option<String>,
    /// Virtual prefix -> physical directory mounts.
    pub mounts: Vec<(String, PathBuf)>,
    /// Shared async pool override.
    pub async_pool: Option<AsyncPoolHandle>,
    /// Replacement stdin.
    pub stdin: Option<Box<dyn Read + Send>>,
    /// Replacement stdout. Closed at shutdown.
    pub stdout: Option<Box<dyn Write + Send>>,
    /// Replacement stderr. Closed at shutdown.
    pub stderr: Option<Box<dyn Write + Send>>,
    /// Network admission predicate; `None` allows everything.
    pub network_policy: Option<NetworkPolicy>,
}

impl Sandbox {
    /// Creates an unrestricted sandbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the filesystem root.
    #[must_use]
    pub fn with_filesystem_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.filesystem_root = Some(root.into());
        self
    }

    /// Sets the virtual working directory.
    #[must_use]
    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Adds a mount.
    #[must_use]
    pub fn with_mount(mut self, prefix: impl Into<String>, physical: impl Into<PathBuf>) -> Self {
        self.mounts.push((prefix.into(), physical.into()));
        self
    }

    /// Uses a shared async pool instead of a per-runtime one.
    #[must_use]
    pub fn with_async_pool(mut self, pool: AsyncPoolHandle) -> Self {
        self.async_pool = Some(pool);
        self
    }

    /// Sets the network admission predicate.
    #[must_use]
    pub fn with_network_policy(mut self, policy: NetworkPolicy) -> Self {
        self.network_policy = Some(policy);
        self
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("filesystem_root", &self.filesystem_root)
            .field("working_directory", &self.working_directory)
            .field("mounts", &self.mounts)
            .field("async_pool", &self.async_pool.is_some())
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("network_policy", &self.network_policy.is_some())
            .finish()
    }
}
