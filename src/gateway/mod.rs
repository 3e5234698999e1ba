//! Adapters for the external collaborators: the version-control client and
//! the package backend. The orchestrator only talks to them through the
//! [`Vcs`] and [`Backend`] traits, so either side can be swapped out.

mod conan;
#[cfg(test)]
pub(crate) mod fake;
mod git;
mod process;

use std::fmt;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{BackendError, VcsError};
use crate::workspace::WorkspaceDescriptor;

pub use conan::{ConanCli, parse_dependency_urls};
pub use git::GitCli;
pub use process::ProcessRunner;

/// Oldest backend client the orchestrator knows how to drive.
pub const MIN_CLIENT_VERSION: &str = "1.7.0";

/// A fully qualified package reference, `name/version@user/channel`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    pub name: String,
    pub version: String,
    pub user: String,
    pub channel: String,
}

impl Reference {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        user: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            user: user.into(),
            channel: channel.into(),
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        if text.chars().any(char::is_whitespace) {
            return None;
        }

        let (package, scope) = text.split_once('@')?;
        let (name, version) = package.split_once('/')?;
        let (user, channel) = scope.split_once('/')?;

        let parts = [name, version, user, channel];
        if parts.iter().any(|part| part.is_empty() || part.contains(['/', '@'])) {
            return None;
        }

        Some(Self::new(name, version, user, channel))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}/{}",
            self.name, self.version, self.user, self.channel
        )
    }
}

/// One package installed by a root build, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub reference: String,
    pub timestamp: String,
    pub package_ids: Vec<String>,
}

/// The version-control gateway.
pub trait Vcs: Send + Sync {
    fn clone_repository(&self, url: &str, branch: &str, folder: &Utf8Path) -> Result<(), VcsError>;

    /// Brings an existing checkout up to date with `branch`.
    fn update(&self, folder: &Utf8Path, branch: &str) -> Result<(), VcsError>;

    fn current_commit(&self, folder: &Utf8Path) -> Result<String, VcsError>;

    fn is_checkout(&self, folder: &Utf8Path) -> bool;
}

/// The package backend. Every method is one blocking client operation.
pub trait Backend: Send + Sync {
    /// The version string reported by the client.
    fn client_version(&self) -> Result<String, BackendError>;

    /// The version declared by the recipe in a working copy.
    fn recipe_version(&self, folder: &Utf8Path) -> Result<String, BackendError>;

    /// Exports a working copy into the local recipe cache.
    fn export(&self, folder: &Utf8Path, reference: &Reference) -> Result<(), BackendError>;

    /// The version of an exported recipe, read back from the cache.
    fn inspect_version(&self, reference: &Reference) -> Result<String, BackendError>;

    /// Uploads a recipe, or a single binary package of it, to `remote`.
    fn upload(
        &self,
        reference: &str,
        package_id: Option<&str>,
        remote: &str,
    ) -> Result<(), BackendError>;

    /// Builds the root package and everything it requires.
    fn create(
        &self,
        folder: &Utf8Path,
        reference: &Reference,
        build_modes: &[String],
        options: &[String],
    ) -> Result<Vec<InstalledPackage>, BackendError>;

    /// Installs and builds a workspace overlay described by the descriptor
    /// written at `path`.
    fn workspace_build(
        &self,
        descriptor: &WorkspaceDescriptor,
        path: &Utf8Path,
        install_folder: &Utf8Path,
        options: &[String],
    ) -> Result<(), BackendError>;

    /// `(reference, source url)` of every package in the dependency graph
    /// of a published reference.
    fn dependency_urls(&self, reference: &str) -> Result<Vec<(Reference, String)>, BackendError>;
}

/// Parses `x.y.z` out of a version string, ignoring any prefix or suffix.
fn parse_version(text: &str) -> Option<(u64, u64, u64)> {
    let token = text
        .split_whitespace()
        .find(|token| token.starts_with(|c: char| c.is_ascii_digit()))?;

    let mut parts = token
        .split(['.', '-', '+'])
        .map(|part| part.parse::<u64>().ok());

    let major = parts.next()??;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some((major, minor, patch))
}

/// Fails unless the backend client is at least [`MIN_CLIENT_VERSION`].
/// Returns the detected version.
pub fn check_client_version(backend: &dyn Backend) -> Result<String, BackendError> {
    let reported = backend.client_version()?;

    let found =
        parse_version(&reported).ok_or_else(|| BackendError::UnknownVersion(reported.clone()))?;
    let required = parse_version(MIN_CLIENT_VERSION)
        .ok_or_else(|| BackendError::UnknownVersion(MIN_CLIENT_VERSION.to_string()))?;

    let version = format!("{}.{}.{}", found.0, found.1, found.2);
    if found < required {
        return Err(BackendError::Version {
            found: version,
            required: MIN_CLIENT_VERSION.to_string(),
        });
    }

    info!("Using backend client {version}");
    Ok(version)
}
