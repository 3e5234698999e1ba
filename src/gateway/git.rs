use std::time::Duration;

use camino::Utf8Path;

use crate::error::{ProcessError, VcsError};
use crate::gateway::{ProcessRunner, Vcs};

pub const GIT_EXEC: &str = "git";

/// The version-control gateway backed by the `git` command line client.
#[derive(Debug, Clone)]
pub struct GitCli {
    runner: ProcessRunner,
}

impl GitCli {
    pub fn new(timeout: Duration) -> Self {
        Self {
            runner: ProcessRunner::new(timeout),
        }
    }

    /// Runs a git command with the given arguments and returns the trimmed
    /// output.
    fn git(
        &self,
        operation: &'static str,
        folder: &Utf8Path,
        args: &[&str],
    ) -> Result<String, VcsError> {
        self.runner
            .run(GIT_EXEC, args, None)
            .map(|out| out.trim().to_string())
            .map_err(|source: ProcessError| VcsError::Command {
                operation,
                folder: folder.to_owned(),
                source,
            })
    }
}

impl Vcs for GitCli {
    fn clone_repository(&self, url: &str, branch: &str, folder: &Utf8Path) -> Result<(), VcsError> {
        self.git(
            "clone",
            folder,
            &["clone", "--branch", branch, url, folder.as_str()],
        )?;
        Ok(())
    }

    fn update(&self, folder: &Utf8Path, branch: &str) -> Result<(), VcsError> {
        let dir = folder.as_str();
        self.git("fetch", folder, &["-C", dir, "fetch", "origin", branch])?;
        self.git("checkout", folder, &["-C", dir, "checkout", branch])?;
        self.git("pull", folder, &["-C", dir, "merge", "--ff-only", "FETCH_HEAD"])?;
        Ok(())
    }

    fn current_commit(&self, folder: &Utf8Path) -> Result<String, VcsError> {
        self.git("rev-parse", folder, &["-C", folder.as_str(), "rev-parse", "HEAD"])
    }

    fn is_checkout(&self, folder: &Utf8Path) -> bool {
        folder.join(".git").exists()
    }
}
