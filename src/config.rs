use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Settings;
use crate::error::ConfigError;

/// Packages that never take part in a release, on any platform.
pub const SKIP_PACKAGES: &[&str] = &["cmake_installer"];

/// GPU-only packages, unavailable on macOS.
const SKIP_PACKAGES_MACOS: &[&str] = &["cuda", "cudnn", "nvidia_video_codec_sdk"];

/// File name of the snapshot written into the build folder.
pub const SNAPSHOT_NAME: &str = "build_config.yml";

/// The operating system family the release is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Linux,
    Windows,
    MacOs,
}

impl Platform {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "windows" => Platform::Windows,
            "macos" => Platform::MacOs,
            _ => Platform::Linux,
        }
    }

    /// Whether `name` is removed from the graph unconditionally.
    pub fn is_excluded(self, name: &str) -> bool {
        SKIP_PACKAGES.contains(&name)
            || (self == Platform::MacOs && SKIP_PACKAGES_MACOS.contains(&name))
    }
}

/// Identity and source of the top-level release package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetaPackage {
    pub name: String,
    pub version: String,
    pub user: String,
    pub channel: String,
    pub gitrepo: String,
    pub gitbranch: String,
}

impl MetaPackage {
    /// `name/version@user/channel`
    pub fn reference(&self) -> String {
        format!(
            "{}/{}@{}/{}",
            self.name, self.version, self.user, self.channel
        )
    }
}

fn default_channel() -> String {
    String::from("stable")
}

fn default_true() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// One dependency package, living in its own repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencySpec {
    pub name: String,
    pub gitrepo: String,
    pub gitbranch: String,
    pub conanuser: String,
    #[serde(default = "default_channel")]
    pub conanchannel: String,
    /// Upload destination, the remote named after `conanuser` unless given.
    pub remote: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub skip: bool,
    /// Served from its working copy in workspace mode.
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub editable: bool,
    /// Alternate editable layout file for workspace mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<String>,
}

/// Global switches of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildOptions {
    pub profile: Option<String>,
    pub upload: bool,
    /// Glob over dependency names that are force-rebuilt by the root build.
    pub rebuild_filter: String,
    pub workspace: bool,
    /// Backend options (`pkg:key=value`) for the root build.
    pub backend_options: Vec<String>,
}

/// Where and how the workspace overlay is generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkspaceConfig {
    pub layout: String,
    pub generator: String,
    pub install_folder: Utf8PathBuf,
}

/// The normalized build specification. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub meta: MetaPackage,
    pub dependencies: Vec<DependencySpec>,
    pub options: BuildOptions,
    pub workspace: WorkspaceConfig,
    pub build_folder: Utf8PathBuf,
}

impl BuildSpec {
    pub fn meta_repo_folder(&self) -> Utf8PathBuf {
        self.build_folder.join("meta")
    }

    pub fn package_folder(&self, name: &str) -> Utf8PathBuf {
        self.build_folder.join(name)
    }

    pub fn snapshot_path(&self) -> Utf8PathBuf {
        self.build_folder.join(SNAPSHOT_NAME)
    }

    pub fn dependency(&self, name: &str) -> Option<&DependencySpec> {
        self.dependencies.iter().find(|dep| dep.name == name)
    }

    /// Dependencies that produce nodes: not marked `skip` and not excluded
    /// on `platform`. Declared order is kept.
    pub fn active(&self, platform: Platform) -> Vec<&DependencySpec> {
        self.dependencies
            .iter()
            .filter(|dep| !dep.skip && !platform.is_excluded(&dep.name))
            .collect()
    }

    /// The remote a package is uploaded to. `None` for packages that are
    /// not declared.
    pub fn remote_for(&self, name: &str) -> Option<&str> {
        self.dependency(name).map(|dep| dep.remote.as_str())
    }

    pub fn rebuild_pattern(&self) -> Result<glob::Pattern, ConfigError> {
        compile_filter(&self.options.rebuild_filter)
    }
}

fn compile_filter(pattern: &str) -> Result<glob::Pattern, ConfigError> {
    glob::Pattern::new(pattern).map_err(|source| ConfigError::Filter {
        pattern: pattern.to_string(),
        source,
    })
}

/// The derived document persisted next to the working copies.
///
/// Field order is fixed by the struct, so rendering the same spec always
/// yields the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta_repo_folder: Utf8PathBuf,
    pub dependencies: Vec<DependencySpec>,
    pub name: String,
    pub version: String,
    pub user: String,
    pub channel: String,
}

impl Snapshot {
    pub fn of(spec: &BuildSpec) -> Self {
        Self {
            meta_repo_folder: spec.meta_repo_folder(),
            dependencies: spec.dependencies.clone(),
            name: spec.meta.name.clone(),
            version: spec.meta.version.clone(),
            user: spec.meta.user.clone(),
            channel: spec.meta.channel.clone(),
        }
    }

    pub fn render(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(ConfigError::Serialize)
    }

    pub fn write(&self, path: &Utf8Path) -> Result<(), ConfigError> {
        let text = self.render()?;
        let write = || -> std::io::Result<()> {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(path, text)
        };

        write().map_err(|source| ConfigError::Snapshot {
            path: path.to_owned(),
            source,
        })
    }

    pub fn read(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;

        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }
}

// The document as written by hand. Every field is optional here so a missing
// key can be reported by its full path instead of serde's field name.

#[derive(Debug, Default, Deserialize)]
struct Document {
    meta_package: Option<RawMeta>,
    dependencies: Option<Vec<RawDependency>>,
    profiles: Option<Vec<RawProfile>>,
    config: Option<RawConfig>,
    #[serde(default)]
    options: Vec<String>,
    workspace: Option<RawWorkspace>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMeta {
    name: Option<String>,
    version: Option<String>,
    user: Option<String>,
    channel: Option<String>,
    gitrepo: Option<String>,
    gitbranch: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDependency {
    name: Option<String>,
    gitrepo: Option<String>,
    gitbranch: Option<String>,
    conanuser: Option<String>,
    conanchannel: Option<String>,
    remote: Option<String>,
    #[serde(default)]
    skip: bool,
    editable: Option<bool>,
    layout: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    name: Option<String>,
    filename: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    profile_directory: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWorkspace {
    layout: Option<String>,
    generator: Option<String>,
    install_folder: Option<Utf8PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct ProfileDocument {
    dependencies: Option<Vec<RawDependency>>,
}

fn require(value: Option<String>, path: &str) -> Result<String, ConfigError> {
    value.ok_or_else(|| ConfigError::MissingKey(path.to_string()))
}

impl RawMeta {
    fn normalize(self) -> Result<MetaPackage, ConfigError> {
        Ok(MetaPackage {
            name: require(self.name, "meta_package.name")?,
            version: require(self.version, "meta_package.version")?,
            user: require(self.user, "meta_package.user")?,
            channel: require(self.channel, "meta_package.channel")?,
            gitrepo: require(self.gitrepo, "meta_package.gitrepo")?,
            gitbranch: require(self.gitbranch, "meta_package.gitbranch")?,
        })
    }
}

impl RawDependency {
    fn normalize(self, origin: &str, index: usize) -> Result<DependencySpec, ConfigError> {
        let key = |field: &str| format!("{origin}: dependencies[{index}].{field}");

        let conanuser = require(self.conanuser, &key("conanuser"))?;

        Ok(DependencySpec {
            name: require(self.name, &key("name"))?,
            gitrepo: require(self.gitrepo, &key("gitrepo"))?,
            gitbranch: require(self.gitbranch, &key("gitbranch"))?,
            remote: self.remote.unwrap_or_else(|| conanuser.clone()),
            conanuser,
            conanchannel: self.conanchannel.unwrap_or_else(default_channel),
            skip: self.skip,
            editable: self.editable.unwrap_or(true),
            layout: self.layout,
        })
    }
}

/// Loads and normalizes the build specification of one invocation.
pub struct ConfigLoader<'a> {
    settings: &'a Settings,
}

impl<'a> ConfigLoader<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self { settings }
    }

    /// Reads the specification file, merges profiles and writes the snapshot
    /// into the build folder.
    pub fn load(&self) -> Result<BuildSpec, ConfigError> {
        let path = &self.settings.spec_file;
        info!("Loading configuration from {path}");

        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;

        let spec = self.parse(path, &text)?;
        Snapshot::of(&spec).write(&spec.snapshot_path())?;
        debug!("Wrote snapshot to {}", spec.snapshot_path());

        Ok(spec)
    }

    /// Normalizes a specification document. `path` is used for error
    /// messages and to resolve profile files. Nothing is written.
    pub fn parse(&self, path: &Utf8Path, text: &str) -> Result<BuildSpec, ConfigError> {
        let document: Document = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;

        let meta = document
            .meta_package
            .ok_or_else(|| ConfigError::MissingKey("meta_package".into()))?
            .normalize()?;

        let mut dependencies: Vec<(String, DependencySpec)> = Vec::new();
        let mut push = |origin: &str, raw: Vec<RawDependency>| -> Result<(), ConfigError> {
            for (index, raw) in raw.into_iter().enumerate() {
                let dep = raw.normalize(origin, index)?;

                if let Some((first, _)) = dependencies.iter().find(|(_, d)| d.name == dep.name) {
                    return Err(ConfigError::DuplicatePackage {
                        name: dep.name,
                        first: first.clone(),
                        second: origin.to_string(),
                    });
                }

                dependencies.push((origin.to_string(), dep));
            }
            Ok(())
        };

        if document.dependencies.is_none() && document.profiles.is_none() {
            return Err(ConfigError::MissingKey("dependencies".into()));
        }

        if let Some(raw) = document.dependencies {
            push(path.as_str(), raw)?;
        }

        if let Some(profiles) = document.profiles {
            let base = path.parent().unwrap_or(Utf8Path::new(""));
            let directory = match document.config.and_then(|c| c.profile_directory) {
                Some(dir) => base.join(dir),
                None => base.to_owned(),
            };

            let active = self.settings.profile.as_deref();
            if let Some(active) = active
                && !profiles.iter().any(|p| p.name.as_deref() == Some(active))
            {
                return Err(ConfigError::UnknownProfile(active.to_string()));
            }

            for (index, profile) in profiles.into_iter().enumerate() {
                let name = require(profile.name, &format!("profiles[{index}].name"))?;
                let filename = require(profile.filename, &format!("profiles[{index}].filename"))?;

                if active.is_some_and(|active| active != name) {
                    continue;
                }

                let file = directory.join(&filename);
                debug!(profile = %name, "Merging dependencies from {file}");
                push(file.as_str(), read_profile(&file)?)?;
            }
        }

        compile_filter(&self.settings.rebuild_filter)?;

        let build_folder = self.settings.build_folder.clone();
        let base = path.parent().unwrap_or(Utf8Path::new(""));
        let workspace = document.workspace.unwrap_or_default();
        let workspace = WorkspaceConfig {
            layout: workspace
                .layout
                .unwrap_or_else(|| String::from("layout_workspace")),
            generator: workspace.generator.unwrap_or_else(|| String::from("cmake")),
            install_folder: match workspace.install_folder {
                Some(folder) => base.join(folder),
                None => build_folder.join("workspace_install"),
            },
        };

        Ok(BuildSpec {
            meta,
            dependencies: dependencies.into_iter().map(|(_, dep)| dep).collect(),
            options: BuildOptions {
                profile: self.settings.profile.clone(),
                upload: self.settings.upload,
                rebuild_filter: self.settings.rebuild_filter.clone(),
                workspace: self.settings.workspace,
                backend_options: document.options,
            },
            workspace,
            build_folder,
        })
    }
}

fn read_profile(path: &Utf8Path) -> Result<Vec<RawDependency>, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;

    let document: ProfileDocument =
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;

    document.dependencies.ok_or_else(|| ConfigError::WrongShape {
        key: format!("{path}: dependencies"),
        expected: "a list of dependencies",
    })
}
