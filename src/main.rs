use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use console::style;
use kasane::gateway::{ConanCli, GitCli};
use kasane::{Mode, Orchestrator, Services, Settings};

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log every node, including skipped ones.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Deadline in seconds for every single git or conan call.
    #[arg(long, global = true, default_value_t = 3600)]
    timeout: u64,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Export, upload, build and deploy every dependency of a meta package.
    Build(BuildArgs),
    /// List the dependencies of a published package and their repositories.
    Discover(DiscoverArgs),
}

#[derive(clap::Args, Debug, Clone)]
struct DiscoverArgs {
    /// Reference of the package, e.g. `ubitrack/1.3.0@ubitrack/stable`.
    reference: String,

    /// Only list packages published by these users.
    #[arg(short, long)]
    user: Vec<String>,

    /// Clone every listed package and export it into the local cache.
    #[arg(long)]
    fetch: bool,

    /// Branch cloned by `--fetch`.
    #[arg(long, default_value = "master")]
    branch: String,

    /// Where `--fetch` keeps working copies and its journal.
    #[arg(short, long, default_value = "build")]
    build_folder: Utf8PathBuf,
}

#[derive(clap::Args, Debug, Clone)]
struct BuildArgs {
    /// The YAML build specification.
    #[arg(short, long, default_value = "release.yml")]
    spec: Utf8PathBuf,

    /// Where working copies, the snapshot and the journal are kept.
    #[arg(short, long, default_value = "build")]
    build_folder: Utf8PathBuf,

    /// Upload exported recipes and deploy built packages.
    #[arg(short, long)]
    upload: bool,

    /// Dependency profile to merge.
    #[arg(short, long)]
    profile: Option<String>,

    /// Serve editable packages from their working copies.
    #[arg(short, long)]
    workspace: bool,

    /// Only force-rebuild dependencies matching this glob.
    #[arg(short, long, default_value = "*")]
    filter: String,

    /// Delete working copies before cloning them again.
    #[arg(long)]
    wipe: bool,

    /// Number of nodes running at the same time.
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Fail instead of falling back when an exported version can't be read.
    #[arg(long)]
    strict_versions: bool,
}

impl BuildArgs {
    fn into_settings(self, timeout: Duration) -> Settings {
        let mut settings = Settings::new(self.spec, self.build_folder);
        settings.upload = self.upload;
        settings.profile = self.profile;
        settings.workspace = self.workspace;
        settings.rebuild_filter = self.filter;
        settings.wipe = self.wipe;
        settings.timeout = timeout;
        settings.strict_versions = self.strict_versions;
        if let Some(jobs) = self.jobs {
            settings.workers = jobs.max(1);
        }
        settings
    }
}

fn build(args: BuildArgs, timeout: Duration) -> anyhow::Result<ExitCode> {
    let settings = args.into_settings(timeout);

    let mode = match settings.mode() {
        Mode::Release => "release",
        Mode::Workspace => "workspace",
    };
    eprintln!(
        "Building {} in {} mode.",
        style(&settings.spec_file).red(),
        style(mode).blue()
    );

    let services = Services::new(
        Arc::new(GitCli::new(timeout)),
        Arc::new(ConanCli::new(timeout)),
    );

    let mut orchestrator = Orchestrator::new(settings, services);
    let run = orchestrator.run()?;

    eprintln!("Meta: {}", run.meta_report.summary());
    eprintln!("Packages: {}", run.report.summary());

    if let Some(deployment) = &run.deployment {
        for failure in &deployment.failures {
            eprintln!("{} {failure}", style("upload failed:").yellow());
        }
    }

    for (node, error) in &run.report.failures {
        eprintln!("{} {node}: {error:#}", style("failed:").red());
    }

    if run.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn discover(args: DiscoverArgs, timeout: Duration) -> anyhow::Result<ExitCode> {
    if !args.fetch {
        let backend = ConanCli::new(timeout);
        for (reference, url) in kasane::discover(&backend, &args.reference, &args.user)? {
            println!("{reference}\t{url}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    eprintln!(
        "Fetching dependencies of {} into {}.",
        style(&args.reference).red(),
        style(&args.build_folder).blue()
    );

    let mut settings = Settings::new("", args.build_folder);
    settings.timeout = timeout;

    let services = Services::new(
        Arc::new(GitCli::new(timeout)),
        Arc::new(ConanCli::new(timeout)),
    );

    let mut orchestrator = Orchestrator::new(settings, services);
    let run = orchestrator.fetch(&args.reference, &args.user, &args.branch)?;

    for exported in &run.exported {
        println!("{}\t{}", exported.reference, exported.folder);
    }

    eprintln!("Fetch: {}", run.report.summary());
    for (node, error) in &run.report.failures {
        eprintln!("{} {node}: {error:#}", style("failed:").red());
    }

    if run.report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    kasane::init_logging(args.verbose)?;

    let timeout = Duration::from_secs(args.timeout);

    match args.command {
        Command::Build(build_args) => build(build_args, timeout),
        Command::Discover(discover_args) => discover(discover_args, timeout),
    }
}
