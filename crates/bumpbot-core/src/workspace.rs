use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;

use crate::config::{Config, ProjectConfig};
use crate::error::{Error, Result};
use crate::run::{CommandOutput, Run};

/// Git operations against one project's repository: a shared bare mirror
/// under the cache directory plus a per-run working checkout inside the
/// run sandbox.
///
/// The mirror is never checked out into directly; all mutation happens in
/// the per-run checkout cloned from it. The mirror mutex is shared across
/// runs and held for the duration of any fetch/clone touching the mirror.
pub struct RepoWorkspace {
    run: Arc<Run>,
    project: ProjectConfig,
    config: Arc<Config>,
    mirror_lock: Arc<tokio::sync::Mutex<()>>,
}

impl RepoWorkspace {
    pub fn new(
        run: Arc<Run>,
        project: ProjectConfig,
        config: Arc<Config>,
        mirror_lock: Arc<tokio::sync::Mutex<()>>,
    ) -> Self {
        Self {
            run,
            project,
            config,
            mirror_lock,
        }
    }

    pub fn run(&self) -> &Arc<Run> {
        &self.run
    }

    pub fn repo_name(&self) -> String {
        repo_name_from_url(&self.project.repo_url)
    }

    pub fn mirror_directory(&self) -> PathBuf {
        PathBuf::from(&self.config.cache_dir).join(format!("{}.git", self.repo_name()))
    }

    pub fn checkout_directory(&self) -> PathBuf {
        self.run.sandbox_path.join(self.repo_name())
    }

    /// Mirror fetch plus a fresh checkout for this run.
    pub async fn synchronize(&self) -> Result<()> {
        self.refresh_mirror().await?;
        self.clone_checkout().await
    }

    /// Create or update the shared mirror. Only one fetch/clone may touch
    /// it at a time.
    async fn refresh_mirror(&self) -> Result<()> {
        let _guard = self.mirror_lock.lock().await;
        let mirror = self.mirror_directory();
        if !mirror.is_dir() {
            tokio::fs::create_dir_all(&self.config.cache_dir).await?;
            let mirror_str = mirror.to_string_lossy().into_owned();
            self.run
                .run_command(
                    PathBuf::from(&self.config.cache_dir).as_path(),
                    &["git", "clone", "--mirror", &self.project.repo_url, &mirror_str],
                )
                .await?;
        }
        self.run
            .run_command(&mirror, &["git", "remote", "update"])
            .await?;
        Ok(())
    }

    /// Clone the mirror into a fresh per-run checkout and point origin
    /// back at the real remote, so pushes go upstream while the clone
    /// itself stayed local and fast.
    async fn clone_checkout(&self) -> Result<()> {
        let checkout = self.checkout_directory();
        let _ = tokio::fs::remove_dir_all(&checkout).await;
        let mirror = self.mirror_directory().to_string_lossy().into_owned();
        let checkout_str = checkout.to_string_lossy().into_owned();
        self.run
            .run_command(
                &self.run.sandbox_path,
                &["git", "clone", &mirror, &checkout_str],
            )
            .await?;
        self.git(&["remote", "set-url", "origin", &self.project.repo_url])
            .await?;
        Ok(())
    }

    pub async fn update_dependencies(&self) -> Result<()> {
        let Some(command) = &self.project.dependency_update_command else {
            return Err(Error::Config(format!(
                "cannot update dependencies for '{}': no dependency_update_command configured",
                self.project.repo_url
            )));
        };
        self.run.run_shell(&self.checkout_directory(), command).await?;
        Ok(())
    }

    pub async fn bump_version(&self) -> Result<()> {
        let Some(command) = &self.project.version_bump_command else {
            return Ok(());
        };
        self.run.run_shell(&self.checkout_directory(), command).await?;
        Ok(())
    }

    pub async fn read_version(&self) -> Result<String> {
        let Some(command) = &self.project.version_show_command else {
            return Err(Error::Config(format!(
                "cannot read the version for '{}': no version_show_command configured",
                self.project.repo_url
            )));
        };
        let out = self.run.run_shell(&self.checkout_directory(), command).await?;
        Ok(out.stdout.trim().to_string())
    }

    /// Commit everything, create the annotated version tag, and push
    /// master with tags. If the push fails, the local tag created in this
    /// attempt is deleted before the error propagates, so a failed publish
    /// never leaves a tag that would collide with a later successful bump.
    pub async fn tag_and_commit(&self) -> Result<String> {
        let version = self.read_version().await?;
        let tag = format!("v{version}");

        self.ensure_git_config_set().await?;
        self.git(&["add", "-A"]).await?;
        let message = format!(
            "Bump version of {} to {version} by {}.",
            self.repo_name(),
            self.config.git_committer_name
        );
        self.git(&["commit", "-m", &message]).await?;
        let tag_message = format!("Version tag for {version}.");
        self.git(&["tag", "-a", &tag, "-m", &tag_message]).await?;

        match self.git(&["push", "origin", "master", "--tags"]).await {
            Ok(_) => Ok(tag),
            Err(e) => {
                if let Err(cleanup) = self.git(&["tag", "-d", &tag]).await {
                    self.run
                        .output
                        .warn(&format!("failed to clean up local tag {tag}: {cleanup}"));
                }
                Err(e)
            }
        }
    }

    /// Rewrite the automation branch with the current working tree.
    /// Idempotent under an identical diff: the branch ends up with
    /// equivalent content no matter how many times this runs.
    pub async fn force_commit_to_branch(&self, branch_name: &str) -> Result<()> {
        self.ensure_git_config_set().await?;
        self.git(&["checkout", "-B", branch_name]).await?;
        self.git(&["add", "-A"]).await?;
        let message = format!("Automatic dependency update by {}", self.config.git_committer_name);
        self.git(&["commit", "-m", &message]).await?;
        self.git(&["push", "origin", branch_name, "--force"]).await?;
        Ok(())
    }

    /// Any tracked modifications relative to `compared_to_ref`?
    pub async fn has_modified_files(&self, compared_to_ref: &str) -> Result<bool> {
        let out = self.git(&["diff", compared_to_ref]).await?;
        Ok(!out.stdout.trim().is_empty())
    }

    pub async fn branch_exists(&self, git_ref: &str) -> Result<bool> {
        match self.git(&["rev-parse", "--verify", git_ref]).await {
            Ok(_) => Ok(true),
            Err(Error::Command { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete a branch upstream. `Ok(false)` only when the branch did not
    /// exist; auth or network failures propagate.
    pub async fn delete_remote_branch(&self, branch_name: &str) -> Result<bool> {
        match self.git(&["push", "origin", "--delete", branch_name]).await {
            Ok(_) => Ok(true),
            Err(Error::Command { ref stderr, .. })
                if stderr.contains("remote ref does not exist") =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub fn has_file(&self, path_from_repo_root: &str) -> bool {
        self.checkout_directory().join(path_from_repo_root).exists()
    }

    /// Seconds since the last commit on `git_ref`.
    pub async fn time_since_last_commit_on(&self, git_ref: &str) -> Result<i64> {
        let out = self.git(&["show", "-s", "--format=%ct", git_ref]).await?;
        let commit_time: i64 = out.stdout.trim().parse().map_err(|_| {
            Error::Config(format!(
                "unparseable commit timestamp for {git_ref}: {:?}",
                out.stdout
            ))
        })?;
        Ok(Utc::now().timestamp() - commit_time)
    }

    /// SHA of master in this checkout (i.e. upstream master as of the last
    /// mirror refresh).
    pub async fn current_sha(&self) -> Result<String> {
        let out = self.git(&["rev-parse", "origin/master"]).await?;
        Ok(out.stdout.trim().to_string())
    }

    /// Make sure committer identity is configured in the checkout.
    /// Checked before set so repeated calls don't churn git config.
    pub async fn ensure_git_config_set(&self) -> Result<()> {
        let out = self.git(&["config", "--local", "--list"]).await?;
        if !out.stdout.contains(&self.config.git_committer_email) {
            self.git(&["config", "user.email", &self.config.git_committer_email])
                .await?;
            self.git(&["config", "user.name", &self.config.git_committer_name])
                .await?;
        }
        Ok(())
    }

    pub async fn git(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push("git");
        argv.extend_from_slice(args);
        self.run.run_command(&self.checkout_directory(), &argv).await
    }
}

/// Repository basename, handling both URL shapes:
///   https://github.com/chef/chef-dk.git
///   git@github.com:chef-cookbooks/languages.git
/// and bare local paths like /tmp/fixtures/origin.git.
pub fn repo_name_from_url(url: &str) -> String {
    let base = url.rsplit(['/', ':']).next().unwrap_or(url);
    base.strip_suffix(".git").unwrap_or(base).to_string()
}
