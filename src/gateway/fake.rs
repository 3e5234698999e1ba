//! In-memory gateways for tests. They record every call and can be told to
//! fail specific operations.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::anyhow;
use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{BackendError, ProcessError, VcsError};
use crate::gateway::{Backend, InstalledPackage, Reference, Vcs};
use crate::workspace::WorkspaceDescriptor;

fn count(calls: &Mutex<Vec<String>>, prefix: &str) -> usize {
    calls
        .lock()
        .unwrap()
        .iter()
        .filter(|call| call.starts_with(prefix))
        .count()
}

/// Working copies are real folders with a `.git` marker; the commit of a
/// checkout is derived from the repository and branch it tracks.
#[derive(Default)]
pub(crate) struct FakeVcs {
    calls: Mutex<Vec<String>>,
    tracking: Mutex<HashMap<Utf8PathBuf, (String, String)>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeVcs {
    pub fn fail_url(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        count(&self.calls, prefix)
    }
}

impl Vcs for FakeVcs {
    fn clone_repository(&self, url: &str, branch: &str, folder: &Utf8Path) -> Result<(), VcsError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("clone {url} {branch}"));

        if self.failing.lock().unwrap().contains(url) {
            return Err(VcsError::Command {
                operation: "clone",
                folder: folder.to_owned(),
                source: ProcessError::Io(std::io::Error::other("repository not found")),
            });
        }

        fs::create_dir_all(folder.join(".git")).unwrap();
        fs::write(folder.join("conanfile.py"), url).unwrap();

        self.tracking
            .lock()
            .unwrap()
            .insert(folder.to_owned(), (url.to_string(), branch.to_string()));
        Ok(())
    }

    fn update(&self, folder: &Utf8Path, branch: &str) -> Result<(), VcsError> {
        self.calls.lock().unwrap().push(format!("update {folder} {branch}"));

        let mut tracking = self.tracking.lock().unwrap();
        let entry = tracking
            .entry(folder.to_owned())
            .or_insert_with(|| (folder.to_string(), branch.to_string()));
        entry.1 = branch.to_string();
        Ok(())
    }

    fn current_commit(&self, folder: &Utf8Path) -> Result<String, VcsError> {
        let tracking = self.tracking.lock().unwrap();
        let (url, branch) = tracking.get(folder).ok_or_else(|| VcsError::Command {
            operation: "rev-parse",
            folder: folder.to_owned(),
            source: ProcessError::Io(std::io::Error::other("not a checkout")),
        })?;

        Ok(format!("{branch}@{url}"))
    }

    fn is_checkout(&self, folder: &Utf8Path) -> bool {
        folder.join(".git").exists()
    }
}

/// A backend whose cache is a list of calls.
pub(crate) struct FakeBackend {
    client_version: String,
    calls: Mutex<Vec<String>>,
    versions: Mutex<HashMap<String, String>>,
    failing: Mutex<HashSet<String>>,
    fail_inspect: AtomicBool,
    installed: Mutex<Option<Vec<InstalledPackage>>>,
    workspace: Mutex<Option<WorkspaceDescriptor>>,
    urls: Mutex<Vec<(Reference, String)>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::with_client_version("Conan version 1.21.0")
    }
}

impl FakeBackend {
    pub fn with_client_version(version: &str) -> Self {
        Self {
            client_version: version.to_string(),
            calls: Mutex::default(),
            versions: Mutex::default(),
            failing: Mutex::default(),
            fail_inspect: AtomicBool::new(false),
            installed: Mutex::default(),
            workspace: Mutex::default(),
            urls: Mutex::default(),
        }
    }

    /// Recipe version of the working copy in a folder named `name`.
    pub fn set_version(&self, name: &str, version: &str) {
        self.versions
            .lock()
            .unwrap()
            .insert(name.to_string(), version.to_string());
    }

    /// Makes every call whose record starts with `call` fail, e.g.
    /// `"upload libfoo/1.0.0@ubitrack/stable:bbb"` or `"create"`.
    pub fn fail(&self, call: &str) {
        self.failing.lock().unwrap().insert(call.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
        self.fail_inspect.store(false, Ordering::SeqCst);
    }

    pub fn fail_inspect(&self) {
        self.fail_inspect.store(true, Ordering::SeqCst);
    }

    pub fn set_installed(&self, installed: Vec<InstalledPackage>) {
        *self.installed.lock().unwrap() = Some(installed);
    }

    pub fn set_urls(&self, urls: Vec<(Reference, String)>) {
        *self.urls.lock().unwrap() = urls;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        count(&self.calls, prefix)
    }

    pub fn last_workspace(&self) -> Option<WorkspaceDescriptor> {
        self.workspace.lock().unwrap().clone()
    }

    fn record(&self, operation: &'static str, call: String) -> Result<(), BackendError> {
        self.calls.lock().unwrap().push(call.clone());

        let failing = self.failing.lock().unwrap();
        if failing.iter().any(|f| call.starts_with(f.as_str())) {
            return Err(BackendError::operation(operation, call, anyhow!("injected failure")));
        }

        Ok(())
    }

    fn version_of(&self, name: &str) -> String {
        self.versions
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_else(|| String::from("1.0.0"))
    }
}

impl Backend for FakeBackend {
    fn client_version(&self) -> Result<String, BackendError> {
        Ok(self.client_version.clone())
    }

    fn recipe_version(&self, folder: &Utf8Path) -> Result<String, BackendError> {
        let name = folder.file_name().unwrap_or_default();
        self.record("inspect", format!("recipe_version {name}"))?;
        Ok(self.version_of(name))
    }

    fn export(&self, _: &Utf8Path, reference: &Reference) -> Result<(), BackendError> {
        self.record("export", format!("export {reference}"))
    }

    fn inspect_version(&self, reference: &Reference) -> Result<String, BackendError> {
        self.record("inspect", format!("inspect {reference}"))?;

        if self.fail_inspect.load(Ordering::SeqCst) {
            return Err(BackendError::operation(
                "inspect",
                reference.to_string(),
                anyhow!("recipe not found in cache"),
            ));
        }

        Ok(self.version_of(&reference.name))
    }

    fn upload(
        &self,
        reference: &str,
        package_id: Option<&str>,
        remote: &str,
    ) -> Result<(), BackendError> {
        let target = match package_id {
            Some(id) => format!("{reference}:{id}"),
            None => reference.to_string(),
        };
        self.record("upload", format!("upload {target} -> {remote}"))
    }

    fn create(
        &self,
        _: &Utf8Path,
        reference: &Reference,
        build_modes: &[String],
        _: &[String],
    ) -> Result<Vec<InstalledPackage>, BackendError> {
        self.record("create", format!("create {reference} {build_modes:?}"))?;

        let installed = self.installed.lock().unwrap().clone();
        Ok(installed.unwrap_or_else(|| {
            vec![InstalledPackage {
                reference: reference.to_string(),
                timestamp: String::from("2024-01-01T00:00:00"),
                package_ids: vec![String::from("root-pid")],
            }]
        }))
    }

    fn workspace_build(
        &self,
        descriptor: &WorkspaceDescriptor,
        _: &Utf8Path,
        _: &Utf8Path,
        _: &[String],
    ) -> Result<(), BackendError> {
        self.record("workspace build", format!("workspace_build {}", descriptor.root))?;
        *self.workspace.lock().unwrap() = Some(descriptor.clone());
        Ok(())
    }

    fn dependency_urls(&self, reference: &str) -> Result<Vec<(Reference, String)>, BackendError> {
        self.record("info", format!("info {reference}"))?;
        Ok(self.urls.lock().unwrap().clone())
    }
}
