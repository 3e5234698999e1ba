//! Release graphs.
//!
//! A release runs in two phases. The first graph only knows the meta
//! repository: it clones or updates it and exports the meta package. The
//! second graph is generated from the loaded specification once the first
//! one completed, with one prepare, export and upload chain per dependency
//! followed by the root build and the deployment. In workspace mode the
//! chains stop after prepare and a single workspace build replaces the
//! terminal nodes.

mod actions;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use camino::Utf8Path;
use tracing::{debug, info, warn};

use crate::config::{BuildSpec, ConfigLoader, Platform, Snapshot};
use crate::core::Hash32;
use crate::error::{BackendError, KasaneError};
use crate::executor::{CancelToken, IncrementalExecutor, RunReport};
use crate::gateway::{Backend, Reference, Vcs, check_client_version};
use crate::locks::LockTable;
use crate::utils::as_overhead;
use crate::workspace::WorkspaceBuild;
use crate::{Blueprint, Environment, Handle, Settings, TaskContext, TaskGraph};

pub use actions::{Checkout, Deployment, Exported, Release, UploadStatus, Uploaded};

use actions::Editable;

/// Shared services available to every release node.
pub struct Services {
    pub vcs: Arc<dyn Vcs>,
    pub backend: Arc<dyn Backend>,
    pub locks: LockTable,
    pub platform: Platform,
}

impl Services {
    pub fn new(vcs: Arc<dyn Vcs>, backend: Arc<dyn Backend>) -> Self {
        Self {
            vcs,
            backend,
            locks: LockTable::new(),
            platform: Platform::current(),
        }
    }

    /// Builds for another platform family than the host's.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }
}

/// The first phase: the meta repository alone.
pub struct MetaPlan {
    pub graph: TaskGraph<Services>,
    pub checkout: Handle<Checkout>,
    pub meta: Handle<Exported>,
}

/// Generates the first phase. In workspace mode the meta package is only
/// resolved, since it is served from its working copy.
pub fn plan_meta(spec: &BuildSpec) -> Result<MetaPlan, KasaneError> {
    let mut blueprint = Blueprint::<Services>::new();
    let folder = spec.meta_repo_folder();

    let checkout = {
        let (meta, target) = (spec.meta.clone(), folder.clone());
        blueprint
            .task("prepare-meta")
            .params(&(&spec.meta.gitrepo, &spec.meta.gitbranch, &folder))
            .always()
            .run(move |ctx| {
                actions::prepare(ctx, &meta.name, &meta.gitrepo, &meta.gitbranch, &target)
            })
    };

    let meta = spec.meta.clone();
    let exported = if spec.options.workspace {
        blueprint
            .task("resolve-meta")
            .params(&spec.meta)
            .depends_on(checkout)
            .run(move |ctx: &TaskContext<'_, Services>, checkout: &Checkout| {
                actions::resolve_meta(ctx, checkout, &meta)
            })
    } else {
        blueprint
            .task("export-meta")
            .params(&spec.meta)
            .depends_on(checkout)
            .run(move |ctx: &TaskContext<'_, Services>, checkout: &Checkout| {
                actions::export_meta(ctx, checkout, &meta)
            })
    };

    Ok(MetaPlan {
        graph: blueprint.finish()?,
        checkout,
        meta: exported,
    })
}

/// The nodes generated for one dependency.
pub struct Chain {
    pub name: String,
    pub prepare: Handle<Checkout>,
    /// `None` in workspace mode.
    pub export: Option<Handle<Exported>>,
    pub upload: Option<Handle<Uploaded>>,
}

pub enum Terminal {
    Release {
        build: Handle<Release>,
        deploy: Handle<Deployment>,
    },
    Workspace {
        build: Handle<WorkspaceBuild>,
    },
}

/// The second phase.
pub struct PackagePlan {
    pub graph: TaskGraph<Services>,
    pub chains: Vec<Chain>,
    pub terminal: Terminal,
}

/// Generates the second phase from the loaded specification and the meta
/// package the first phase exported. Excluded and skipped dependencies
/// produce no nodes at all.
pub fn plan_packages(
    spec: &BuildSpec,
    meta: &Exported,
    platform: Platform,
) -> Result<PackagePlan, KasaneError> {
    let mut blueprint = Blueprint::<Services>::new();
    let active = spec.active(platform);
    let workspace = spec.options.workspace;
    let enabled = spec.options.upload;

    let mut chains = Vec::with_capacity(active.len());
    for dep in &active {
        let prepare = {
            let folder = spec.package_folder(&dep.name);
            let (name, url, branch) = (dep.name.clone(), dep.gitrepo.clone(), dep.gitbranch.clone());
            blueprint
                .task(format!("prepare({})", dep.name))
                .params(&(&dep.gitrepo, &dep.gitbranch, &spec.build_folder))
                .always()
                .run(move |ctx| actions::prepare(ctx, &name, &url, &branch, &folder))
        };

        if workspace {
            chains.push(Chain {
                name: dep.name.clone(),
                prepare,
                export: None,
                upload: None,
            });
            continue;
        }

        let export = {
            let (user, channel) = (dep.conanuser.clone(), dep.conanchannel.clone());
            blueprint
                .task(format!("export({})", dep.name))
                .params(&(&dep.conanuser, &dep.conanchannel))
                .depends_on(prepare)
                .run(move |ctx: &TaskContext<'_, Services>, checkout: &Checkout| {
                    actions::export(ctx, checkout, &user, &channel)
                })
        };

        let upload = {
            let remote = dep.remote.clone();
            blueprint
                .task(format!("upload({})", dep.name))
                .params(&(&dep.remote, enabled))
                .depends_on(export)
                .run_retrying(
                    move |ctx: &TaskContext<'_, Services>, exported: &Exported| {
                        actions::upload(ctx, exported, &remote, enabled)
                    },
                    Uploaded::is_failed,
                )
        };

        chains.push(Chain {
            name: dep.name.clone(),
            prepare,
            export: Some(export),
            upload: Some(upload),
        });
    }

    let terminal = if workspace {
        let editables: Vec<Editable> = active
            .iter()
            .filter(|dep| dep.editable)
            .map(|dep| Editable {
                name: dep.name.clone(),
                user: dep.conanuser.clone(),
                channel: dep.conanchannel.clone(),
                layout: dep.layout.clone(),
            })
            .collect();

        let checkouts: Vec<Handle<Checkout>> = chains.iter().map(|chain| chain.prepare).collect();
        let params = Hash32::of(&(meta, &editables, &spec.workspace, &spec.options.backend_options));
        let meta = meta.clone();
        let config = spec.workspace.clone();
        let options = spec.options.backend_options.clone();

        let build = blueprint
            .task("workspace-build")
            .params(&params)
            .always()
            .depends_on(checkouts)
            .run(
                move |ctx: &TaskContext<'_, Services>, checkouts: Vec<&Checkout>| {
                    actions::workspace_build(ctx, &meta, &checkouts, &editables, &config, &options)
                },
            );

        Terminal::Workspace { build }
    } else {
        let pattern = spec.rebuild_pattern()?;
        let build_modes: Vec<String> = active
            .iter()
            .filter(|dep| pattern.matches(&dep.name))
            .map(|dep| dep.name.clone())
            .collect();

        let uploads: Vec<Handle<Uploaded>> = chains.iter().filter_map(|chain| chain.upload).collect();
        let params = Hash32::of(&(meta, &build_modes, &spec.options.backend_options));
        let meta = meta.clone();
        let options = spec.options.backend_options.clone();

        let build = blueprint
            .task("build")
            .params(&params)
            .critical()
            .depends_on(uploads)
            .run(
                move |ctx: &TaskContext<'_, Services>, uploads: Vec<&Uploaded>| {
                    actions::build(ctx, &meta, &uploads, &build_modes, &options)
                },
            );

        let remotes: BTreeMap<String, String> = spec
            .dependencies
            .iter()
            .filter_map(|dep| Some((dep.name.clone(), spec.remote_for(&dep.name)?.to_string())))
            .collect();

        let params = Hash32::of(&(&remotes, enabled));
        let deploy = blueprint
            .task("deploy")
            .params(&params)
            .depends_on(build)
            .run_retrying(
                move |ctx: &TaskContext<'_, Services>, release: &Release| {
                    actions::deploy(ctx, release, &remotes, enabled)
                },
                |deployment: &Deployment| !deployment.is_complete(),
            );

        Terminal::Release { build, deploy }
    };

    Ok(PackagePlan {
        graph: blueprint.finish()?,
        chains,
        terminal,
    })
}

/// Compares the snapshot written by the loader with the specification it was
/// derived from. The specification always wins.
fn check_snapshot(spec: &BuildSpec) {
    let path = spec.snapshot_path();

    match Snapshot::read(&path) {
        Ok(snapshot) if snapshot == Snapshot::of(spec) => debug!("Snapshot {path} is current"),
        Ok(_) => warn!("Snapshot {path} disagrees with the specification, using the specification"),
        Err(e) => warn!("{e}"),
    }
}

/// Everything a completed invocation produced.
pub struct ReleaseRun {
    pub spec: BuildSpec,
    pub meta: Exported,
    /// Report of the meta repository phase.
    pub meta_report: RunReport,
    /// Report of the package phase.
    pub report: RunReport,
    /// Mermaid rendering of the package phase.
    pub diagram: String,
    pub deployment: Option<Deployment>,
    pub workspace: Option<WorkspaceBuild>,
}

impl ReleaseRun {
    /// Every node completed and every upload reached its remote.
    pub fn is_success(&self) -> bool {
        self.meta_report.is_success()
            && self.report.is_success()
            && self.deployment.as_ref().is_none_or(Deployment::is_complete)
    }
}

/// Turns the failure that stopped a phase into the error of the run.
fn into_fatal(mut report: RunReport, fallback: &str) -> KasaneError {
    let node = report.fatal.take();
    let position = node
        .as_ref()
        .and_then(|node| report.failures.iter().position(|(key, _)| key == node))
        .or(if report.failures.is_empty() { None } else { Some(0) });

    match position {
        Some(position) => {
            let (node, source) = report.failures.swap_remove(position);
            KasaneError::Fatal { node, source }
        }
        None => KasaneError::Fatal {
            node: fallback.to_string(),
            source: anyhow!("the run was cancelled"),
        },
    }
}

/// Drives both phases of a release with one journal.
pub struct Orchestrator {
    env: Environment<Services>,
    executor: IncrementalExecutor,
}

impl Orchestrator {
    pub fn new(settings: Settings, services: Services) -> Self {
        let executor = IncrementalExecutor::open(settings.journal_path()).with_workers(settings.workers);

        Self {
            env: Environment::new(settings, services),
            executor,
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.executor.cancel_token()
    }

    pub fn settings(&self) -> &Settings {
        &self.env.settings
    }

    /// Checks the backend client, loads the specification and runs both
    /// phases. Configuration and client errors are raised before any node
    /// runs; a failed root build is raised as [`KasaneError::Fatal`]. Other
    /// node failures are reported in the returned [`ReleaseRun`].
    pub fn run(&mut self) -> Result<ReleaseRun, KasaneError> {
        let s = Instant::now();

        check_client_version(&*self.env.data.backend)?;
        let spec = ConfigLoader::new(&self.env.settings).load()?;

        let plan = plan_meta(&spec)?;
        let run = self.executor.run(&plan.graph, &self.env)?;
        let meta = run.get(&plan.meta).cloned();
        let meta_report = run.report;

        let Some(meta) = meta else {
            return Err(into_fatal(meta_report, "export-meta"));
        };

        info!(reference = %meta.reference, "Meta package ready");
        check_snapshot(&spec);

        let plan = plan_packages(&spec, &meta, self.env.data.platform)?;
        info!("Generated {} nodes for {} packages", plan.graph.len(), plan.chains.len());

        let run = self.executor.run(&plan.graph, &self.env)?;
        let (deployment, workspace) = match plan.terminal {
            Terminal::Release { deploy, .. } => (run.get(&deploy).cloned(), None),
            Terminal::Workspace { build } => (None, run.get(&build).cloned()),
        };

        let report = run.report;
        if report.fatal.is_some() {
            return Err(into_fatal(report, "build"));
        }

        let diagram = report.render_mermaid(&plan.graph);
        info!("Release of {} finished {}", meta.reference, as_overhead(s));

        Ok(ReleaseRun {
            spec,
            meta,
            meta_report,
            report,
            diagram,
            deployment,
            workspace,
        })
    }

    /// Discovers the dependencies of `reference` published by one of
    /// `users`, clones each into the build folder and exports it into the
    /// local cache. Node failures are reported in the returned [`FetchRun`].
    pub fn fetch(
        &mut self,
        reference: &str,
        users: &[String],
        branch: &str,
    ) -> Result<FetchRun, KasaneError> {
        let s = Instant::now();

        check_client_version(&*self.env.data.backend)?;
        let found = discover(&*self.env.data.backend, reference, users)?;

        let plan = plan_fetch(&found, &self.env.settings.build_folder, branch)?;
        info!("Fetching {} packages of {reference}", plan.exports.len());

        let run = self.executor.run(&plan.graph, &self.env)?;
        let exported = plan
            .exports
            .iter()
            .filter_map(|export| run.get(export).cloned())
            .collect();

        info!("Fetch of {reference} finished {}", as_overhead(s));

        Ok(FetchRun {
            found,
            exported,
            report: run.report,
        })
    }
}

/// The dependencies of a published package whose user is one of `users`,
/// with the repository each one is built from.
pub fn discover(
    backend: &dyn Backend,
    reference: &str,
    users: &[String],
) -> Result<Vec<(Reference, String)>, BackendError> {
    let found = backend.dependency_urls(reference)?;

    Ok(found
        .into_iter()
        .filter(|(reference, _)| users.is_empty() || users.contains(&reference.user))
        .collect())
}

/// Working copies of discovered packages, each exported under the user and
/// channel it was published with.
pub struct FetchPlan {
    pub graph: TaskGraph<Services>,
    pub exports: Vec<Handle<Exported>>,
}

/// Generates one prepare and export pair per discovered package, cloning
/// `branch` into `build_folder/<name>`. A name listed twice is fetched once.
pub fn plan_fetch(
    found: &[(Reference, String)],
    build_folder: &Utf8Path,
    branch: &str,
) -> Result<FetchPlan, KasaneError> {
    let mut blueprint = Blueprint::<Services>::new();
    let mut exports = Vec::with_capacity(found.len());
    let mut seen = BTreeSet::new();

    for (reference, url) in found {
        if !seen.insert(reference.name.as_str()) {
            debug!(package = %reference.name, "Already fetched, ignoring {reference}");
            continue;
        }

        let prepare = {
            let folder = build_folder.join(&reference.name);
            let (name, url, branch) = (reference.name.clone(), url.clone(), branch.to_string());
            blueprint
                .task(format!("prepare({})", reference.name))
                .params(&(&url, &branch, build_folder))
                .always()
                .run(move |ctx| actions::prepare(ctx, &name, &url, &branch, &folder))
        };

        let export = {
            let (user, channel) = (reference.user.clone(), reference.channel.clone());
            blueprint
                .task(format!("export({})", reference.name))
                .params(&(&reference.user, &reference.channel))
                .depends_on(prepare)
                .run(move |ctx: &TaskContext<'_, Services>, checkout: &Checkout| {
                    actions::export(ctx, checkout, &user, &channel)
                })
        };

        exports.push(export);
    }

    Ok(FetchPlan {
        graph: blueprint.finish()?,
        exports,
    })
}

/// Everything a fetch produced.
pub struct FetchRun {
    /// The discovered packages, after the user filter.
    pub found: Vec<(Reference, String)>,
    pub exported: Vec<Exported>,
    pub report: RunReport,
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino::{Utf8Path, Utf8PathBuf};

    use super::*;
    use crate::error::{ConfigError, VcsError};
    use crate::executor::{Journal, NodeStatus};
    use crate::gateway::InstalledPackage;
    use crate::gateway::fake::{FakeBackend, FakeVcs};

    const META: &str = r#"
meta_package:
  name: ubitrack
  version: 1.3.0
  user: ubitrack
  channel: stable
  gitrepo: https://example.org/ubitrack.git
  gitbranch: master
"#;

    fn dependency(name: &str, branch: &str, extra: &str) -> String {
        format!(
            "  - name: {name}\n    gitrepo: https://example.org/{name}.git\n    gitbranch: {branch}\n    conanuser: ubitrack\n{extra}"
        )
    }

    fn spec(dependencies: &[String]) -> String {
        format!("{META}dependencies:\n{}", dependencies.concat())
    }

    fn two_packages(bar_branch: &str) -> String {
        spec(&[
            dependency("libfoo", "master", "    remote: ubitrack\n"),
            dependency("libbar", bar_branch, "    remote: ubitrack\n"),
            dependency("cmake_installer", "master", ""),
        ])
    }

    struct Harness {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
        vcs: Arc<FakeVcs>,
        backend: Arc<FakeBackend>,
    }

    impl Harness {
        fn new(text: &str) -> Self {
            Self::with_backend(text, FakeBackend::default())
        }

        fn with_backend(text: &str, backend: FakeBackend) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

            backend.set_version("ubitrack", "1.3.0");
            backend.set_version("meta", "1.3.0");

            let harness = Self {
                _dir: dir,
                root,
                vcs: Arc::new(FakeVcs::default()),
                backend: Arc::new(backend),
            };
            harness.write_spec(text);
            harness
        }

        fn write_spec(&self, text: &str) {
            fs::write(self.root.join("spec.yml"), text).unwrap();
        }

        fn settings(&self) -> Settings {
            let mut settings = Settings::new(self.root.join("spec.yml"), self.root.join("build"));
            settings.upload = true;
            settings.workers = 2;
            settings
        }

        fn run_with(&self, settings: Settings) -> Result<ReleaseRun, KasaneError> {
            let services = Services::new(self.vcs.clone(), self.backend.clone())
                .with_platform(Platform::Linux);
            Orchestrator::new(settings, services).run()
        }

        fn run(&self) -> ReleaseRun {
            self.run_with(self.settings()).unwrap()
        }

        fn journal(&self) -> Journal {
            Journal::load(&self.settings().journal_path())
        }
    }

    fn load(text: &str, settings: &Settings) -> BuildSpec {
        ConfigLoader::new(settings)
            .parse(Utf8Path::new("spec.yml"), text)
            .unwrap()
    }

    fn meta() -> Exported {
        Exported {
            reference: Reference::new("ubitrack", "1.3.0", "ubitrack", "stable"),
            commit_rev: String::from("abc123"),
            folder: Utf8PathBuf::from("build/meta"),
            version_fallback: false,
        }
    }

    fn sorted(mut keys: Vec<&str>) -> Vec<&str> {
        keys.sort_unstable();
        keys
    }

    fn installed() -> Vec<InstalledPackage> {
        vec![
            InstalledPackage {
                reference: String::from("libfoo/1.0.0@ubitrack/stable"),
                timestamp: String::from("2024-03-01T10:00:00"),
                package_ids: vec![String::from("aaa"), String::from("bbb")],
            },
            InstalledPackage {
                reference: String::from("ubitrack/1.3.0@ubitrack/stable"),
                timestamp: String::from("2024-03-01T10:05:00"),
                package_ids: vec![String::from("root")],
            },
        ]
    }

    #[test]
    fn test_meta_phase_has_two_nodes() {
        let settings = Settings::new("spec.yml", "build");
        let plan = plan_meta(&load(&two_packages("master"), &settings)).unwrap();
        assert_eq!(plan.graph.keys().collect::<Vec<_>>(), vec!["prepare-meta", "export-meta"]);

        let mut settings = settings;
        settings.workspace = true;
        let plan = plan_meta(&load(&two_packages("master"), &settings)).unwrap();
        assert_eq!(plan.graph.keys().collect::<Vec<_>>(), vec!["prepare-meta", "resolve-meta"]);
    }

    #[test]
    fn test_release_plan_has_three_nodes_per_package() {
        let text = spec(&[
            dependency("libfoo", "master", ""),
            dependency("libbar", "master", ""),
            dependency("libbaz", "master", ""),
            dependency("libqux", "master", "    skip: true\n"),
        ]);
        let spec = load(&text, &Settings::new("spec.yml", "build"));

        let plan = plan_packages(&spec, &meta(), Platform::Linux).unwrap();
        assert_eq!(plan.chains.len(), 3);
        assert_eq!(plan.graph.len(), 3 * 3 + 2);
        assert!(!plan.graph.contains("prepare(libqux)"));
        assert_eq!(plan.graph.upstream("deploy"), vec!["build"]);
        assert_eq!(plan.graph.upstream("upload(libbar)"), vec!["export(libbar)"]);
        assert_eq!(plan.graph.upstream("export(libbar)"), vec!["prepare(libbar)"]);
    }

    #[test]
    fn test_excluded_package_has_no_chain() {
        let text = spec(&[
            dependency("libfoo", "master", ""),
            dependency("cmake_installer", "master", ""),
        ]);
        let spec = load(&text, &Settings::new("spec.yml", "build"));

        let plan = plan_packages(&spec, &meta(), Platform::Linux).unwrap();
        assert!(plan.graph.keys().all(|key| !key.contains("cmake_installer")));
        assert_eq!(plan.graph.upstream("build"), vec!["upload(libfoo)"]);
        assert_eq!(plan.graph.len(), 5);
    }

    #[test]
    fn test_gpu_packages_are_excluded_on_macos() {
        let text = spec(&[
            dependency("libfoo", "master", ""),
            dependency("cuda", "master", ""),
        ]);
        let spec = load(&text, &Settings::new("spec.yml", "build"));

        let mac = plan_packages(&spec, &meta(), Platform::MacOs).unwrap();
        assert!(!mac.graph.contains("prepare(cuda)"));

        let linux = plan_packages(&spec, &meta(), Platform::Linux).unwrap();
        assert!(linux.graph.contains("prepare(cuda)"));
    }

    #[test]
    fn test_workspace_plan_has_one_node_per_package() {
        let mut settings = Settings::new("spec.yml", "build");
        settings.workspace = true;
        let spec = load(&two_packages("master"), &settings);

        let plan = plan_packages(&spec, &meta(), Platform::Linux).unwrap();
        assert_eq!(plan.graph.len(), 2 + 1);
        assert!(plan.chains.iter().all(|chain| chain.export.is_none()));
        assert_eq!(
            plan.graph.upstream("workspace-build"),
            vec!["prepare(libfoo)", "prepare(libbar)"]
        );
        assert!(!plan.graph.contains("build"));
    }

    #[test]
    fn test_rebuild_filter_limits_build_modes() {
        let harness = Harness::new(&two_packages("master"));
        let mut settings = harness.settings();
        settings.rebuild_filter = String::from("libf*");

        harness.run_with(settings).unwrap();
        assert_eq!(harness.backend.count("create ubitrack/1.3.0@ubitrack/stable [\"libfoo\"]"), 1);
    }

    #[test]
    fn test_full_release() {
        let harness = Harness::new(&two_packages("master"));
        harness.backend.set_installed(installed());

        let run = harness.run();

        assert!(run.is_success());
        assert_eq!(run.meta.reference.to_string(), "ubitrack/1.3.0@ubitrack/stable");
        assert_eq!(harness.backend.count("export"), 3);
        assert_eq!(harness.backend.count("upload libfoo/1.0.0@ubitrack/stable -> "), 1);
        assert_eq!(harness.backend.count("create"), 1);

        let deployment = run.deployment.unwrap();
        assert_eq!(
            deployment.uploaded,
            vec![
                "libfoo/1.0.0@ubitrack/stable:aaa",
                "libfoo/1.0.0@ubitrack/stable:bbb"
            ]
        );
        assert_eq!(deployment.skipped, vec!["ubitrack/1.3.0@ubitrack/stable"]);
        assert!(run.diagram.starts_with("graph LR"));
        assert!(harness.root.join("build").join(crate::config::SNAPSHOT_NAME).exists());
    }

    #[test]
    fn test_second_run_is_a_full_skip() {
        let harness = Harness::new(&two_packages("master"));
        harness.backend.set_installed(installed());

        let first = harness.run();
        let calls = harness.backend.calls();
        let records = harness.journal();

        let second = harness.run();
        assert_eq!(harness.backend.calls(), calls);
        assert_eq!(harness.vcs.count("clone"), 3);
        assert_eq!(harness.vcs.count("update"), 3);

        assert_eq!(second.meta_report.skipped(), vec!["export-meta"]);
        assert_eq!(
            sorted(second.report.executed()),
            vec!["prepare(libbar)", "prepare(libfoo)"]
        );
        assert_eq!(second.report.skipped().len(), 6);

        let journal = harness.journal();
        assert_eq!(journal.len(), records.len());
        for node in first.meta_report.nodes.iter().chain(&first.report.nodes) {
            assert_eq!(journal.get(&node.key), records.get(&node.key), "{}", node.key);
            assert_eq!(
                second.report.fingerprint(&node.key).or(second.meta_report.fingerprint(&node.key)),
                node.fingerprint
            );
        }
    }

    #[test]
    fn test_branch_change_invalidates_one_chain() {
        let harness = Harness::new(&two_packages("master"));
        let first = harness.run();

        harness.write_spec(&two_packages("develop"));
        let second = harness.run();

        assert_eq!(
            sorted(second.report.executed()),
            vec![
                "build",
                "deploy",
                "export(libbar)",
                "prepare(libbar)",
                "prepare(libfoo)",
                "upload(libbar)"
            ]
        );
        assert_eq!(sorted(second.report.skipped()), vec!["export(libfoo)", "upload(libfoo)"]);

        for key in ["prepare(libfoo)", "export(libfoo)", "upload(libfoo)"] {
            assert_eq!(first.report.fingerprint(key), second.report.fingerprint(key));
        }
        assert_ne!(first.report.fingerprint("build"), second.report.fingerprint("build"));
        assert_eq!(harness.backend.count("create"), 2);
        assert!(harness.vcs.calls().iter().any(|call| call.ends_with("libbar develop")));
    }

    #[test]
    fn test_partial_deploy_is_not_complete() {
        let harness = Harness::new(&two_packages("master"));
        harness.backend.set_installed(installed());
        harness.backend.fail("upload libfoo/1.0.0@ubitrack/stable:bbb");

        let run = harness.run();
        let deployment = run.deployment.clone().unwrap();

        assert_eq!(deployment.uploaded, vec!["libfoo/1.0.0@ubitrack/stable:aaa"]);
        assert_eq!(deployment.failures, vec!["libfoo/1.0.0@ubitrack/stable:bbb"]);
        assert!(!deployment.is_complete());
        assert!(!run.is_success());
        assert_eq!(run.report.status("deploy"), Some(&NodeStatus::Executed));

        harness.backend.clear_failures();
        let retry = harness.run();
        assert_eq!(retry.report.status("build"), Some(&NodeStatus::Skipped));
        assert_eq!(retry.report.status("deploy"), Some(&NodeStatus::Executed));
        assert!(retry.deployment.unwrap().is_complete());
    }

    #[test]
    fn test_failed_recipe_upload_reaches_deploy() {
        let harness = Harness::new(&two_packages("master"));
        harness.backend.fail("upload libbar/1.0.0@ubitrack/stable -> ");

        let run = harness.run();

        assert_eq!(run.report.status("upload(libbar)"), Some(&NodeStatus::Executed));
        assert_eq!(run.report.status("build"), Some(&NodeStatus::Executed));
        let deployment = run.deployment.unwrap();
        assert_eq!(deployment.failures, vec!["libbar/1.0.0@ubitrack/stable"]);

        harness.backend.clear_failures();
        let retry = harness.run();
        assert_eq!(retry.report.status("upload(libbar)"), Some(&NodeStatus::Executed));
        assert_eq!(retry.report.status("upload(libfoo)"), Some(&NodeStatus::Skipped));
        assert!(retry.is_success());
    }

    #[test]
    fn test_failed_chain_does_not_stop_siblings() {
        let harness = Harness::new(&two_packages("master"));
        harness.vcs.fail_url("https://example.org/libbar.git");

        let run = harness.run();

        assert_eq!(run.report.failed(), vec!["prepare(libbar)"]);
        assert_eq!(
            run.report.status("export(libbar)"),
            Some(&NodeStatus::Blocked("prepare(libbar)".into()))
        );
        assert_eq!(run.report.status("upload(libfoo)"), Some(&NodeStatus::Executed));
        assert!(matches!(run.report.status("build"), Some(NodeStatus::Blocked(_))));
        assert_eq!(harness.backend.count("upload libfoo"), 1);
        assert_eq!(harness.backend.count("create"), 0);
        assert!(run.deployment.is_none());
    }

    #[test]
    fn test_failed_build_is_fatal() {
        let harness = Harness::new(&two_packages("master"));
        harness.backend.fail("create");

        match harness.run_with(harness.settings()) {
            Err(KasaneError::Fatal { node, source }) => {
                assert_eq!(node, "build");
                assert!(format!("{source:#}").contains("root build failed"));
            }
            other => panic!("expected a fatal error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_foreign_folder_is_ambiguous() {
        let harness = Harness::new(&two_packages("master"));
        let folder = harness.root.join("build").join("libfoo");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("notes.txt"), "not a checkout").unwrap();

        let run = harness.run();
        let (_, error) = run
            .report
            .failures
            .iter()
            .find(|(key, _)| key == "prepare(libfoo)")
            .unwrap();
        assert!(matches!(
            error.downcast_ref::<VcsError>(),
            Some(VcsError::AmbiguousFolder(_))
        ));

        let mut settings = harness.settings();
        settings.wipe = true;
        let run = harness.run_with(settings).unwrap();
        assert!(run.report.is_success());
        assert!(!folder.join("notes.txt").exists());
    }

    #[test]
    fn test_workspace_release() {
        let text = spec(&[
            dependency("libfoo", "master", ""),
            dependency("libbar", "master", "    editable: false\n"),
        ]);
        let harness = Harness::new(&text);
        let mut settings = harness.settings();
        settings.workspace = true;

        let run = harness.run_with(settings).unwrap();

        assert_eq!(harness.backend.count("export"), 0);
        assert_eq!(harness.backend.count("upload"), 0);
        assert_eq!(run.report.nodes.len(), 3);

        let descriptor = harness.backend.last_workspace().unwrap();
        assert!(descriptor.contains("libfoo/1.0.0@ubitrack/stable"));
        assert!(descriptor.editables.iter().all(|(r, _)| !r.starts_with("libbar/")));
        assert_eq!(descriptor.root, "ubitrack/1.3.0@ubitrack/stable");
        let root = descriptor.entry(&descriptor.root).unwrap();
        assert_eq!(root.layout.as_deref(), Some("layout_workspace"));

        let build = run.workspace.unwrap();
        assert!(build.descriptor.exists());
        assert_eq!(build.root, descriptor.root);
    }

    #[test]
    fn test_inspect_fallback_is_a_warning_unless_strict() {
        let harness = Harness::new(&two_packages("master"));
        harness.backend.fail_inspect();

        let run = harness.run();
        assert!(run.meta.version_fallback);
        assert_eq!(run.meta.reference.version, "1.3.0");

        let harness = Harness::new(&two_packages("master"));
        harness.backend.fail_inspect();
        let mut settings = harness.settings();
        settings.strict_versions = true;

        match harness.run_with(settings) {
            Err(KasaneError::Fatal { node, .. }) => assert_eq!(node, "export-meta"),
            other => panic!("expected a fatal error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_old_client_aborts_before_any_node() {
        let harness = Harness::with_backend(
            &two_packages("master"),
            FakeBackend::with_client_version("Conan version 1.6.0"),
        );

        assert!(matches!(
            harness.run_with(harness.settings()),
            Err(KasaneError::Backend(BackendError::Version { .. }))
        ));
        assert!(harness.vcs.calls().is_empty());
    }

    #[test]
    fn test_config_error_aborts_before_any_node() {
        let harness = Harness::new("meta_package:\n  version: 1.3.0\ndependencies: []\n");

        assert!(matches!(
            harness.run_with(harness.settings()),
            Err(KasaneError::Config(ConfigError::MissingKey(key))) if key == "meta_package.name"
        ));
        assert!(harness.vcs.calls().is_empty());
        assert!(harness.backend.calls().is_empty());
    }

    #[test]
    fn test_discover_filters_users() {
        let backend = FakeBackend::default();
        backend.set_urls(vec![
            (
                Reference::new("ubitrack", "1.3.0", "ubitrack", "stable"),
                String::from("https://example.org/ubitrack.git"),
            ),
            (
                Reference::new("zlib", "1.2.11", "conan", "stable"),
                String::from("https://example.org/zlib.git"),
            ),
        ]);

        let found = discover(&backend, "ubitrack/1.3.0@ubitrack/stable", &["ubitrack".into()]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0.name, "ubitrack");

        let all = discover(&backend, "ubitrack/1.3.0@ubitrack/stable", &[]).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_upload_defaults_to_conan_user_remote() {
        let harness = Harness::new(&spec(&[dependency("libfoo", "master", "")]));
        harness.backend.set_installed(installed());

        let run = harness.run();

        assert!(run.is_success());
        assert_eq!(harness.backend.count("upload libfoo/1.0.0@ubitrack/stable -> ubitrack"), 1);
        assert_eq!(
            run.deployment.unwrap().uploaded,
            vec![
                "libfoo/1.0.0@ubitrack/stable:aaa",
                "libfoo/1.0.0@ubitrack/stable:bbb"
            ]
        );
        assert_eq!(harness.backend.count("upload libfoo/1.0.0@ubitrack/stable:aaa -> ubitrack"), 1);
    }

    #[test]
    fn test_profile_packages_respect_exclusions() {
        let harness = Harness::new("");
        fs::create_dir_all(harness.root.join("profiles")).unwrap();
        fs::write(
            harness.root.join("profiles/core.yml"),
            format!(
                "dependencies:\n{}{}{}",
                dependency("libcore", "master", ""),
                dependency("cmake_installer", "master", ""),
                dependency("libmath", "master", ""),
            ),
        )
        .unwrap();

        let text = format!(
            "{META}config:\n  profile_directory: profiles\nprofiles:\n  - name: core\n    filename: core.yml\n"
        );
        let settings = harness.settings();
        let spec = ConfigLoader::new(&settings)
            .parse(&harness.root.join("spec.yml"), &text)
            .unwrap();

        let plan = plan_packages(&spec, &meta(), Platform::Linux).unwrap();

        assert!(plan.graph.keys().all(|key| !key.contains("cmake_installer")));
        assert_eq!(
            sorted(plan.graph.upstream("build")),
            vec!["upload(libcore)", "upload(libmath)"]
        );
    }

    fn published() -> Vec<(Reference, String)> {
        vec![
            (
                Reference::new("libfoo", "1.0.0", "ubitrack", "stable"),
                String::from("https://example.org/libfoo.git"),
            ),
            (
                Reference::new("cmake_helpers", "0.3.0", "camposs", "testing"),
                String::from("https://example.org/cmake_helpers.git"),
            ),
            (
                Reference::new("zlib", "1.2.11", "conan", "stable"),
                String::from("https://example.org/zlib.git"),
            ),
        ]
    }

    #[test]
    fn test_fetch_plan_pairs_prepare_and_export() {
        let mut found = published();
        found.push((
            Reference::new("libfoo", "1.1.0", "ubitrack", "stable"),
            String::from("https://example.org/libfoo.git"),
        ));

        let plan = plan_fetch(&found, Utf8Path::new("build"), "master").unwrap();

        assert_eq!(plan.exports.len(), 3);
        assert_eq!(plan.graph.len(), 6);
        assert_eq!(plan.graph.upstream("export(zlib)"), vec!["prepare(zlib)"]);
    }

    #[test]
    fn test_fetch_exports_allowed_packages() {
        let harness = Harness::new("");
        harness.backend.set_urls(published());
        harness.backend.set_version("cmake_helpers", "0.3.0");

        let fetch = |harness: &Harness| {
            let services = Services::new(harness.vcs.clone(), harness.backend.clone());
            Orchestrator::new(harness.settings(), services)
                .fetch(
                    "ubitrack/1.3.0@ubitrack/stable",
                    &["ubitrack".into(), "camposs".into()],
                    "master",
                )
                .unwrap()
        };

        let run = fetch(&harness);

        assert!(run.report.is_success());
        assert_eq!(run.found.len(), 2);
        let clones = harness.vcs.calls();
        assert!(clones.contains(&String::from("clone https://example.org/libfoo.git master")));
        assert!(clones.contains(&String::from("clone https://example.org/cmake_helpers.git master")));
        assert_eq!(harness.vcs.count("clone"), 2);
        assert_eq!(harness.vcs.count("clone https://example.org/zlib.git"), 0);
        assert!(harness.root.join("build/libfoo/.git").exists());

        assert_eq!(harness.backend.count("export libfoo/1.0.0@ubitrack/stable"), 1);
        assert_eq!(harness.backend.count("export cmake_helpers/0.3.0@camposs/testing"), 1);
        assert_eq!(harness.backend.count("export zlib"), 0);
        assert_eq!(run.exported.len(), 2);

        let again = fetch(&harness);
        assert_eq!(
            sorted(again.report.skipped()),
            vec!["export(cmake_helpers)", "export(libfoo)"]
        );
        assert_eq!(harness.backend.count("export"), 2);
    }
}
