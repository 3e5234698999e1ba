//! The editable overlay: instead of exporting and uploading, packages flagged
//! editable are served straight from their working copies through a
//! backend workspace.

use std::fs;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Deserialize, Serialize, Serializer};
use tracing::info;

use crate::config::WorkspaceConfig;
use crate::gateway::{Backend, Reference};

/// File name of the descriptor written into the build folder.
pub const DESCRIPTOR_NAME: &str = "workspace.yml";

/// A package served from a local working copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EditableTarget {
    pub reference: Reference,
    pub folder: Utf8PathBuf,
    pub layout: Option<String>,
}

/// Package name to local source folder, in registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EditableMapping {
    targets: Vec<EditableTarget>,
}

impl EditableMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a package. A second registration of the same name replaces
    /// the first.
    pub fn insert(&mut self, reference: Reference, folder: Utf8PathBuf, layout: Option<String>) {
        let target = EditableTarget {
            reference,
            folder,
            layout,
        };

        match self
            .targets
            .iter_mut()
            .find(|t| t.reference.name == target.reference.name)
        {
            Some(existing) => *existing = target,
            None => self.targets.push(target),
        }
    }

    pub fn get(&self, name: &str) -> Option<&EditableTarget> {
        self.targets.iter().find(|t| t.reference.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EditableTarget> {
        self.targets.iter()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EditableEntry {
    pub path: Utf8PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout: Option<String>,
}

/// The backend-readable workspace file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkspaceDescriptor {
    /// `name/version@user/channel` to working copy, in registration order
    /// with the root last.
    pub editables: Vec<(String, EditableEntry)>,
    pub layout: String,
    pub workspace_generator: String,
    pub root: String,
}

impl WorkspaceDescriptor {
    /// Builds the descriptor for `mapping`, adding the meta package as the
    /// root with the overlay layout.
    pub fn new(
        mapping: &EditableMapping,
        meta: &Reference,
        meta_folder: &Utf8Path,
        config: &WorkspaceConfig,
    ) -> Self {
        let root = meta.to_string();

        let mut editables: Vec<(String, EditableEntry)> = mapping
            .iter()
            .filter(|target| target.reference.name != meta.name)
            .map(|target| {
                let entry = EditableEntry {
                    path: target.folder.clone(),
                    layout: target.layout.clone(),
                };
                (target.reference.to_string(), entry)
            })
            .collect();

        editables.push((
            root.clone(),
            EditableEntry {
                path: meta_folder.to_owned(),
                layout: Some(config.layout.clone()),
            },
        ));

        Self {
            editables,
            layout: config.layout.clone(),
            workspace_generator: config.generator.clone(),
            root,
        }
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.editables.iter().any(|(r, _)| r == reference)
    }

    pub fn entry(&self, reference: &str) -> Option<&EditableEntry> {
        self.editables
            .iter()
            .find(|(r, _)| r == reference)
            .map(|(_, entry)| entry)
    }

    /// Editables in the order they are built: dependencies first, the root
    /// last.
    pub fn build_order(&self) -> Vec<(&str, &EditableEntry)> {
        let (root, rest): (Vec<_>, Vec<_>) = self
            .editables
            .iter()
            .map(|(r, entry)| (r.as_str(), entry))
            .partition(|(r, _)| *r == self.root);

        rest.into_iter().chain(root).collect()
    }

    pub fn render(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn write(&self, path: &Utf8Path) -> anyhow::Result<()> {
        let text = self.render().context("couldn't render the workspace descriptor")?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("couldn't create '{dir}'"))?;
        }

        fs::write(path, text).with_context(|| format!("couldn't write '{path}'"))
    }
}

struct Editables<'a>(&'a [(String, EditableEntry)]);

impl Serialize for Editables<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (reference, entry) in self.0 {
            map.serialize_entry(reference, entry)?;
        }
        map.end()
    }
}

impl Serialize for WorkspaceDescriptor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("WorkspaceDescriptor", 4)?;
        s.serialize_field("editables", &Editables(&self.editables))?;
        s.serialize_field("layout", &self.layout)?;
        s.serialize_field("workspace_generator", &self.workspace_generator)?;
        s.serialize_field("root", &self.root)?;
        s.end()
    }
}

/// Result of a workspace build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceBuild {
    pub descriptor: Utf8PathBuf,
    pub install_folder: Utf8PathBuf,
    pub root: String,
    pub editables: Vec<String>,
}

/// Writes the descriptor next to the working copies and hands it to the
/// backend. The install folder is created when missing and reused as is
/// otherwise; its contents are the backend's own incremental state.
pub fn build_overlay(
    backend: &dyn Backend,
    descriptor: &WorkspaceDescriptor,
    build_folder: &Utf8Path,
    install_folder: &Utf8Path,
    options: &[String],
) -> anyhow::Result<WorkspaceBuild> {
    let path = build_folder.join(DESCRIPTOR_NAME);
    descriptor.write(&path)?;

    fs::create_dir_all(install_folder)
        .with_context(|| format!("couldn't create the install folder '{install_folder}'"))?;

    info!(
        root = %descriptor.root,
        "Building workspace with {} editable packages",
        descriptor.editables.len()
    );

    backend
        .workspace_build(descriptor, &path, install_folder, options)
        .context("workspace build failed")?;

    Ok(WorkspaceBuild {
        descriptor: path,
        install_folder: install_folder.to_owned(),
        root: descriptor.root.clone(),
        editables: descriptor.editables.iter().map(|(r, _)| r.clone()).collect(),
    })
}
