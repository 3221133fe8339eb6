use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// A workload package installed on this agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagePath {
    pub name: String,
    pub path: PathBuf,
}

impl PackagePath {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn join(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.path.join(relative)
    }
}

/// Looks up installed packages by name.
pub trait PackageResolver: Send + Sync {
    /// `Ok(None)` when the package is not installed or registered.
    fn get_package(&self, name: &str) -> Result<Option<PackagePath>>;
}

/// Packages are subdirectories of a single root, named after the package.
#[derive(Debug, Clone)]
pub struct DirectoryPackageResolver {
    root: PathBuf,
}

impl DirectoryPackageResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PackageResolver for DirectoryPackageResolver {
    fn get_package(&self, name: &str) -> Result<Option<PackagePath>> {
        let path = self.root.join(name);
        if path.is_dir() {
            debug!(package = name, path = %path.display(), "Resolved package");
            Ok(Some(PackagePath::new(name, path)))
        } else {
            debug!(package = name, root = %self.root.display(), "Package not found");
            Ok(None)
        }
    }
}

/// Explicitly registered packages. Later registrations win.
#[derive(Debug, Clone, Default)]
pub struct StaticPackageResolver {
    packages: HashMap<String, PathBuf>,
}

impl StaticPackageResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.packages.insert(name.into(), path.into());
        self
    }
}

impl PackageResolver for StaticPackageResolver {
    fn get_package(&self, name: &str) -> Result<Option<PackagePath>> {
        Ok(self
            .packages
            .get(name)
            .map(|path| PackagePath::new(name, path.clone())))
    }
}
