use std::fs;
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{BackendError, ProcessError};
use crate::gateway::{Backend, InstalledPackage, ProcessRunner, Reference};
use crate::workspace::WorkspaceDescriptor;

pub const CONAN_EXEC: &str = "conan";

/// The package backend driven through the conan 1.x command line client.
#[derive(Debug, Clone)]
pub struct ConanCli {
    runner: ProcessRunner,
    program: String,
}

impl ConanCli {
    pub fn new(timeout: Duration) -> Self {
        Self {
            runner: ProcessRunner::new(timeout),
            program: CONAN_EXEC.to_string(),
        }
    }

    /// Uses another client executable, e.g. a wrapper script.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn conan(
        &self,
        operation: &'static str,
        target: impl Into<String>,
        args: &[&str],
    ) -> Result<String, BackendError> {
        self.runner
            .run(&self.program, args, None)
            .map_err(|e: ProcessError| BackendError::operation(operation, target, e))
    }
}

// Shape of the report written by `conan create --json`.

#[derive(Debug, Deserialize)]
struct CreateReport {
    #[serde(default)]
    installed: Vec<Installed>,
}

#[derive(Debug, Deserialize)]
struct Installed {
    recipe: RecipeInfo,
    #[serde(default)]
    packages: Vec<PackageInfo>,
}

#[derive(Debug, Deserialize)]
struct RecipeInfo {
    id: String,
    #[serde(default)]
    time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PackageInfo {
    id: String,
}

fn parse_create_report(text: &str) -> anyhow::Result<Vec<InstalledPackage>> {
    let report: CreateReport = serde_json::from_str(text).context("malformed create report")?;

    Ok(report
        .installed
        .into_iter()
        .map(|installed| InstalledPackage {
            reference: installed.recipe.id,
            timestamp: installed.recipe.time.unwrap_or_default(),
            package_ids: installed.packages.into_iter().map(|p| p.id).collect(),
        })
        .collect())
}

/// Parses the `conan info <ref> -n url` listing into `(reference, url)`
/// pairs. Override notices and version banners are ignored.
pub fn parse_dependency_urls(text: &str) -> Vec<(Reference, String)> {
    let mut pairs = Vec::new();
    let mut reference = None;

    for line in text.lines().map(str::trim) {
        if line.contains("overriden") || line.contains("overridden") || line.contains("Version") {
            continue;
        }

        if let Some(parsed) = Reference::parse(line) {
            reference = Some(parsed);
            continue;
        }

        if let Some(url) = line.strip_prefix("URL:")
            && let Some(reference) = reference.take()
        {
            pairs.push((reference, url.trim().to_string()));
        }
    }

    pairs
}

fn json_report_path(folder: &Utf8Path) -> Utf8PathBuf {
    let name = folder.file_name().unwrap_or("package");
    folder.with_file_name(format!("{name}.create.json"))
}

impl Backend for ConanCli {
    fn client_version(&self) -> Result<String, BackendError> {
        self.conan("version check", CONAN_EXEC, &["--version"])
            .map(|out| out.trim().to_string())
    }

    fn recipe_version(&self, folder: &Utf8Path) -> Result<String, BackendError> {
        let version = self
            .conan("inspect", folder.as_str(), &["inspect", folder.as_str(), "--raw", "version"])?
            .trim()
            .to_string();

        if version.is_empty() || version == "None" {
            return Err(BackendError::MissingVersion(folder.to_string()));
        }

        Ok(version)
    }

    fn export(&self, folder: &Utf8Path, reference: &Reference) -> Result<(), BackendError> {
        let reference = reference.to_string();
        let out = self.conan("export", &reference, &["export", folder.as_str(), reference.as_str()])?;
        debug!(reference = %reference, "{}", out.trim());
        Ok(())
    }

    fn inspect_version(&self, reference: &Reference) -> Result<String, BackendError> {
        let target = reference.to_string();
        let version = self
            .conan("inspect", &target, &["inspect", target.as_str(), "--raw", "version"])?
            .trim()
            .to_string();

        if version.is_empty() || version == "None" {
            return Err(BackendError::MissingVersion(target));
        }

        Ok(version)
    }

    fn upload(
        &self,
        reference: &str,
        package_id: Option<&str>,
        remote: &str,
    ) -> Result<(), BackendError> {
        let mut args = vec!["upload", reference, "-r", remote, "--force", "--confirm"];
        if let Some(package_id) = package_id {
            args.extend(["-p", package_id]);
        }

        let target = match package_id {
            Some(id) => format!("{reference}:{id}"),
            None => reference.to_string(),
        };

        self.conan("upload", target, &args)?;
        Ok(())
    }

    fn create(
        &self,
        folder: &Utf8Path,
        reference: &Reference,
        build_modes: &[String],
        options: &[String],
    ) -> Result<Vec<InstalledPackage>, BackendError> {
        let target = reference.to_string();
        let report = json_report_path(folder);

        let builds: Vec<String> = build_modes.iter().map(|m| format!("--build={m}")).collect();
        let mut args = vec!["create", folder.as_str(), target.as_str(), "--json", report.as_str()];
        args.extend(builds.iter().map(String::as_str));
        for option in options {
            args.extend(["-o", option.as_str()]);
        }

        self.conan("create", &target, &args)?;

        let text = fs::read_to_string(&report)
            .map_err(|e| BackendError::operation("create", &target, e))?;
        parse_create_report(&text).map_err(|e| BackendError::operation("create", &target, e))
    }

    fn workspace_build(
        &self,
        descriptor: &WorkspaceDescriptor,
        path: &Utf8Path,
        install_folder: &Utf8Path,
        options: &[String],
    ) -> Result<(), BackendError> {
        let mut args = vec![
            "workspace",
            "install",
            path.as_str(),
            "--install-folder",
            install_folder.as_str(),
            "--build=missing",
        ];
        for option in options {
            args.extend(["-o", option.as_str()]);
        }
        self.conan("workspace install", path.as_str(), &args)?;

        // Each editable is built from its own working copy against the shared
        // install folder, dependencies first and the root last.
        for (reference, editable) in descriptor.build_order() {
            info!(reference = %reference, "Building editable package");
            let build_folder = editable.path.join("build");
            self.conan(
                "build",
                reference,
                &[
                    "build",
                    editable.path.as_str(),
                    "--source-folder",
                    editable.path.as_str(),
                    "--build-folder",
                    build_folder.as_str(),
                    "--install-folder",
                    install_folder.as_str(),
                ],
            )?;
        }

        Ok(())
    }

    fn dependency_urls(&self, reference: &str) -> Result<Vec<(Reference, String)>, BackendError> {
        let out = self.conan("info", reference, &["info", reference, "-n", "url"])?;
        Ok(parse_dependency_urls(&out))
    }
}
