//! Node actions of the release graphs. Each one is a plain function over the
//! node context and its typed upstream results.

use std::collections::BTreeMap;
use std::fs;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::TaskContext;
use crate::config::{MetaPackage, WorkspaceConfig};
use crate::error::VcsError;
use crate::gateway::{InstalledPackage, Reference};
use crate::locks::LockTable;
use crate::release::Services;
use crate::workspace::{EditableMapping, WorkspaceBuild, WorkspaceDescriptor, build_overlay};

type Ctx<'a> = TaskContext<'a, Services>;

/// A working copy at a known commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checkout {
    pub name: String,
    pub commit_rev: String,
    pub folder: Utf8PathBuf,
}

/// A recipe exported into the local cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Exported {
    pub reference: Reference,
    pub commit_rev: String,
    pub folder: Utf8PathBuf,
    /// The version could not be read back from the cache and the one
    /// declared by the working copy was used instead.
    pub version_fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UploadStatus {
    Uploaded { remote: String },
    /// Uploads are switched off for this invocation.
    Disabled,
    Failed { remote: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uploaded {
    pub reference: Reference,
    pub commit_rev: String,
    pub status: UploadStatus,
}

impl Uploaded {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, UploadStatus::Failed { .. })
    }
}

/// Everything the root build installed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Release {
    pub reference: Reference,
    pub packages: Vec<InstalledPackage>,
    /// Recipes whose upload failed before the build started.
    pub upload_failures: Vec<String>,
}

/// The aggregate result of deploying a release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Deployment {
    /// `reference:package_id` targets that reached their remote.
    pub uploaded: Vec<String>,
    /// References not declared as dependencies, e.g. the meta package.
    pub skipped: Vec<String>,
    /// Failed recipe and binary uploads, upstream ones included.
    pub failures: Vec<String>,
    pub disabled: bool,
}

impl Deployment {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

fn is_populated(folder: &Utf8Path) -> bool {
    fs::read_dir(folder)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Clones or updates the repository of `name` into `folder`.
pub(crate) fn prepare(
    ctx: &Ctx<'_>,
    name: &str,
    url: &str,
    branch: &str,
    folder: &Utf8Path,
) -> anyhow::Result<Checkout> {
    let services = &ctx.env.data;
    let wipe = ctx.env.settings.wipe;

    services.locks.with(&LockTable::folder_key(folder), || -> anyhow::Result<Checkout> {
        if wipe && folder.exists() {
            info!(package = name, "Removing working copy {folder}");
            fs::remove_dir_all(folder).map_err(|source| VcsError::Wipe {
                path: folder.to_owned(),
                source,
            })?;
        }

        if is_populated(folder) {
            if !services.vcs.is_checkout(folder) {
                return Err(VcsError::AmbiguousFolder(folder.to_owned()).into());
            }

            ctx.status(format!("updating {branch}"));
            info!(package = name, stage = "prepare", "Updating {url} - {branch}");
            services.vcs.update(folder, branch)?;
        } else {
            ctx.status(format!("cloning {branch}"));
            info!(package = name, stage = "prepare", "Cloning {url} - {branch}");
            services.vcs.clone_repository(url, branch, folder)?;
        }

        let commit_rev = services.vcs.current_commit(folder)?;

        Ok(Checkout {
            name: name.to_string(),
            commit_rev,
            folder: folder.to_owned(),
        })
    })
}

/// Exports a working copy under `reference` and reads the version back from
/// the cache.
fn export_as(ctx: &Ctx<'_>, checkout: &Checkout, reference: Reference) -> anyhow::Result<Exported> {
    let services = &ctx.env.data;
    let name = checkout.name.as_str();

    services
        .locks
        .with(&LockTable::export_key(name), || -> anyhow::Result<Exported> {
            ctx.status(format!("exporting {reference}"));
            services
                .backend
                .export(&checkout.folder, &reference)
                .with_context(|| format!("{name}: export failed"))?;

            let (reference, version_fallback) = match services.backend.inspect_version(&reference) {
                Ok(version) if version == reference.version => (reference, false),
                Ok(version) => {
                    warn!(
                        package = name,
                        stage = "export",
                        "Recipe reports version {version}, exported as {}",
                        reference.version
                    );
                    (Reference { version, ..reference }, false)
                }
                Err(e) if ctx.env.settings.strict_versions => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("{name}: couldn't inspect the exported version")));
                }
                Err(e) => {
                    warn!(
                        package = name,
                        stage = "export",
                        "{e}\nFalling back to version {}",
                        reference.version
                    );
                    (reference, true)
                }
            };

            info!(package = name, stage = "export", "Exported {reference}");

            Ok(Exported {
                reference,
                commit_rev: checkout.commit_rev.clone(),
                folder: checkout.folder.clone(),
                version_fallback,
            })
        })
}

/// Exports a dependency with the version its recipe declares.
pub(crate) fn export(
    ctx: &Ctx<'_>,
    checkout: &Checkout,
    user: &str,
    channel: &str,
) -> anyhow::Result<Exported> {
    let version = ctx
        .env
        .data
        .backend
        .recipe_version(&checkout.folder)
        .with_context(|| format!("{}: missing recipe version", checkout.name))?;

    let reference = Reference::new(&checkout.name, version, user, channel);
    export_as(ctx, checkout, reference)
}

/// Exports the meta package under the identity given by the specification.
pub(crate) fn export_meta(
    ctx: &Ctx<'_>,
    checkout: &Checkout,
    meta: &MetaPackage,
) -> anyhow::Result<Exported> {
    let reference = Reference::new(&meta.name, &meta.version, &meta.user, &meta.channel);
    export_as(ctx, checkout, reference)
}

/// Resolves the meta package identity without touching the cache, for
/// workspace builds.
pub(crate) fn resolve_meta(
    ctx: &Ctx<'_>,
    checkout: &Checkout,
    meta: &MetaPackage,
) -> anyhow::Result<Exported> {
    let mut reference = Reference::new(&meta.name, &meta.version, &meta.user, &meta.channel);
    let mut version_fallback = false;

    match ctx.env.data.backend.recipe_version(&checkout.folder) {
        Ok(version) => reference.version = version,
        Err(e) if ctx.env.settings.strict_versions => {
            return Err(anyhow::Error::new(e).context(format!("{}: missing recipe version", meta.name)));
        }
        Err(e) => {
            warn!(package = %meta.name, "{e}\nFalling back to version {}", meta.version);
            version_fallback = true;
        }
    }

    Ok(Exported {
        reference,
        commit_rev: checkout.commit_rev.clone(),
        folder: checkout.folder.clone(),
        version_fallback,
    })
}

/// Uploads an exported recipe. Failures are recorded in the result instead
/// of failing the chain.
pub(crate) fn upload(
    ctx: &Ctx<'_>,
    exported: &Exported,
    remote: &str,
    enabled: bool,
) -> anyhow::Result<Uploaded> {
    let services = &ctx.env.data;
    let reference = &exported.reference;
    let name = reference.name.as_str();

    let status = if !enabled {
        UploadStatus::Disabled
    } else {
        services.locks.with(&LockTable::upload_key(name, remote), || {
            ctx.status(format!("uploading to {remote}"));
            match services.backend.upload(&reference.to_string(), None, remote) {
                Ok(()) => {
                    info!(package = name, stage = "upload", "Uploaded {reference} to {remote}");
                    UploadStatus::Uploaded {
                        remote: remote.to_string(),
                    }
                }
                Err(e) => {
                    warn!(package = name, stage = "upload", "{e}");
                    UploadStatus::Failed {
                        remote: remote.to_string(),
                        message: e.to_string(),
                    }
                }
            }
        })
    };

    Ok(Uploaded {
        reference: reference.clone(),
        commit_rev: exported.commit_rev.clone(),
        status,
    })
}

/// Builds the meta package and everything it requires.
pub(crate) fn build(
    ctx: &Ctx<'_>,
    meta: &Exported,
    uploads: &[&Uploaded],
    build_modes: &[String],
    options: &[String],
) -> anyhow::Result<Release> {
    let upload_failures: Vec<String> = uploads
        .iter()
        .filter(|uploaded| uploaded.is_failed())
        .map(|uploaded| uploaded.reference.to_string())
        .collect();

    if !upload_failures.is_empty() {
        warn!(
            stage = "build",
            "Building with {} recipes that failed to upload",
            upload_failures.len()
        );
    }

    ctx.status(format!("building {}", meta.reference));
    info!(stage = "build", "Building {} ({} forced)", meta.reference, build_modes.len());

    let packages = ctx
        .env
        .data
        .backend
        .create(&meta.folder, &meta.reference, build_modes, options)
        .with_context(|| format!("{}: root build failed", meta.reference))?;

    Ok(Release {
        reference: meta.reference.clone(),
        packages,
        upload_failures,
    })
}

/// Uploads every built binary to the remote of its package. Per-binary
/// failures are collected, never raised.
pub(crate) fn deploy(
    ctx: &Ctx<'_>,
    release: &Release,
    remotes: &BTreeMap<String, String>,
    enabled: bool,
) -> anyhow::Result<Deployment> {
    let mut deployment = Deployment {
        failures: release.upload_failures.clone(),
        disabled: !enabled,
        ..Deployment::default()
    };

    if !enabled {
        info!(stage = "deploy", "Uploads are disabled, not deploying");
        return Ok(deployment);
    }

    let services = &ctx.env.data;

    for package in &release.packages {
        let name = Reference::parse(&package.reference)
            .map(|reference| reference.name)
            .unwrap_or_else(|| package.reference.clone());

        let Some(remote) = remotes.get(&name) else {
            info!(stage = "deploy", "Skip uploading due to missing remote: {}", package.reference);
            deployment.skipped.push(package.reference.clone());
            continue;
        };

        services.locks.with(&LockTable::upload_key(&name, remote), || {
            for package_id in &package.package_ids {
                let target = format!("{}:{package_id}", package.reference);
                ctx.status(format!("uploading {target}"));

                match services
                    .backend
                    .upload(&package.reference, Some(package_id), remote)
                {
                    Ok(()) => deployment.uploaded.push(target),
                    Err(e) => {
                        warn!(package = %name, stage = "deploy", "{e}");
                        deployment.failures.push(target);
                    }
                }
            }
        });
    }

    if deployment.is_complete() {
        info!(stage = "deploy", "Deployed {} packages", deployment.uploaded.len());
    } else {
        warn!(
            stage = "deploy",
            "Deployment incomplete, {} uploads failed",
            deployment.failures.len()
        );
    }

    Ok(deployment)
}

/// An editable dependency as declared by the specification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Editable {
    pub name: String,
    pub user: String,
    pub channel: String,
    pub layout: Option<String>,
}

/// Registers the editable working copies and builds them as one workspace.
pub(crate) fn workspace_build(
    ctx: &Ctx<'_>,
    meta: &Exported,
    checkouts: &[&Checkout],
    editables: &[Editable],
    config: &WorkspaceConfig,
    options: &[String],
) -> anyhow::Result<WorkspaceBuild> {
    let backend = &ctx.env.data.backend;
    let mut mapping = EditableMapping::new();

    for checkout in checkouts {
        let Some(editable) = editables.iter().find(|e| e.name == checkout.name) else {
            continue;
        };

        let version = backend
            .recipe_version(&checkout.folder)
            .with_context(|| format!("{}: missing recipe version", checkout.name))?;

        let reference = Reference::new(&editable.name, version, &editable.user, &editable.channel);
        mapping.insert(reference, checkout.folder.clone(), editable.layout.clone());
    }

    let descriptor = WorkspaceDescriptor::new(&mapping, &meta.reference, &meta.folder, config);
    ctx.status(format!("building workspace {}", descriptor.root));

    build_overlay(
        &**backend,
        &descriptor,
        &ctx.env.settings.build_folder,
        &config.install_folder,
        options,
    )
}
