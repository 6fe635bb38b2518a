use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{info, warn};

use crate::ci::CiApi;
use crate::config::{Config, ProjectConfig};
use crate::conflict::BuildConflictDetector;
use crate::error::{Error, Result};
use crate::run::{Handler, HandlerContext, Run};
use crate::webhook::{merged_sha, PullRequestEvent};
use crate::workspace::{repo_name_from_url, RepoWorkspace};

/// Well-known, disposable branch automated dependency updates are staged
/// on. Force-pushed; its history is rewritten on every submission.
pub const DEPENDENCY_BRANCH_NAME: &str = "auto_dependency_bump_test";

/// Opt-out marker checked in at a project's repo root.
pub const DEPENDENCY_UPDATES_DISABLED_FILE: &str = ".dependency_updates_disabled";

const FAILURE_NOTIFICATION_RATE_LIMIT_FILE: &str = "failure_notification_rate_limit";

/// Runs one dependency update attempt against a synchronized checkout:
/// update, diff, quiet-period check, publish. Skips are `(false, reason)`,
/// never errors.
pub struct DependencyUpdateBuilder<'a> {
    repo: &'a RepoWorkspace,
    dependency_branch: &'a str,
    /// Seconds to wait before re-submitting a build that is unchanged from
    /// the last one we submitted. A failed build may have failed for
    /// reasons unrelated to the change (network, upstream outage), so we
    /// do retry, but rate-limited so unchanged content cannot spam the
    /// build system.
    quiet_period_s: i64,
}

impl<'a> DependencyUpdateBuilder<'a> {
    pub fn new(repo: &'a RepoWorkspace, dependency_branch: &'a str, quiet_period_s: i64) -> Self {
        Self {
            repo,
            dependency_branch,
            quiet_period_s,
        }
    }

    /// The automation branch as seen from the last mirror refresh.
    fn remote_branch_ref(&self) -> String {
        format!("origin/{}", self.dependency_branch)
    }

    pub async fn run(&self) -> Result<(bool, String)> {
        let out = &self.repo.run().output;

        self.repo.synchronize().await?;

        if self.repo.has_file(DEPENDENCY_UPDATES_DISABLED_FILE) {
            let message = "dependency updates disabled, skipping".to_string();
            out.info(&message);
            return Ok((false, message));
        }

        self.repo.update_dependencies().await?;

        if !self.repo.has_modified_files("HEAD").await? {
            let message = "dependencies on master are up to date".to_string();
            out.info(&message);
            return Ok((false, message));
        }

        if !self.should_submit_changes_for_build().await? {
            let message = "dependency changes failed a previous build. \
                 waiting for the quiet period to expire before building again"
                .to_string();
            out.info(&message);
            return Ok((false, message));
        }

        self.repo
            .force_commit_to_branch(self.dependency_branch)
            .await?;

        Ok((
            true,
            format!("dependency updates pushed to {}", self.dependency_branch),
        ))
    }

    /// False iff the automation branch exists upstream, its content is
    /// identical to the new diff, and its last commit is newer than the
    /// quiet period. Every other combination proceeds.
    pub async fn should_submit_changes_for_build(&self) -> Result<bool> {
        let branch_ref = self.remote_branch_ref();
        if !self.repo.branch_exists(&branch_ref).await? {
            return Ok(true);
        }
        if self.repo.has_modified_files(&branch_ref).await? {
            // New content supersedes whatever is on the branch.
            return Ok(true);
        }
        if self.repo.time_since_last_commit_on(&branch_ref).await? > self.quiet_period_s {
            // One retry attempt once the quiet period has elapsed.
            return Ok(true);
        }
        Ok(false)
    }
}

/// Top-level orchestrator: owns the shared run context, the CI client,
/// the project map, and the cross-run locks. One instance per process,
/// injected into the webhook server and the polling loop.
pub struct Bot {
    ctx: Arc<HandlerContext>,
    pub projects: HashMap<String, ProjectConfig>,
    pub ci: Arc<dyn CiApi>,
    /// Only one fetch/clone may touch a mirror at a time.
    mirror_lock: Arc<tokio::sync::Mutex<()>>,
    /// Per-project serialization of the check-then-publish step, so two
    /// concurrent update commands for one project cannot race to push.
    publish_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Bot {
    pub fn new(
        ctx: Arc<HandlerContext>,
        projects: HashMap<String, ProjectConfig>,
        ci: Arc<dyn CiApi>,
    ) -> Self {
        Self {
            ctx,
            projects,
            ci,
            mirror_lock: Arc::new(tokio::sync::Mutex::new(())),
            publish_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<HandlerContext> {
        &self.ctx
    }

    fn config(&self) -> &Config {
        &self.ctx.config
    }

    fn inform_channel(&self, project: &ProjectConfig) -> String {
        project
            .inform_channel
            .clone()
            .unwrap_or_else(|| self.config().default_inform_channel.clone())
    }

    fn workspace(&self, run: Arc<Run>, project: ProjectConfig) -> RepoWorkspace {
        RepoWorkspace::new(
            run,
            project,
            Arc::clone(&self.ctx.config),
            Arc::clone(&self.mirror_lock),
        )
    }

    fn publish_lock(&self, project_name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .publish_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(project_name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn valid_project_names(&self) -> String {
        let mut names: Vec<&str> = self.projects.keys().map(String::as_str).collect();
        names.sort_unstable();
        names.join(", ")
    }

    /// Find the project watching a repository by its basename (webhooks
    /// only carry the repo name, not the URL).
    pub fn project_for_repository(&self, repository: &str) -> Option<(String, ProjectConfig)> {
        self.projects
            .iter()
            .find(|(_, p)| repo_name_from_url(&p.repo_url) == repository)
            .map(|(name, p)| (name.clone(), p.clone()))
    }

    // ── Dependency updates ────────────────────────────────────────────────

    /// Full "update, diff, rate-limit, push, trigger" sequence for one
    /// project. Returns whether a build was triggered plus a reason.
    /// Failures are reported by the handler and, channel-side, rate
    /// limited by the failure marker.
    pub async fn update_dependencies(&self, project_name: &str) -> (bool, String) {
        let Some(project) = self.projects.get(project_name).cloned() else {
            return (
                false,
                format!(
                    "Invalid project `{project_name}`. Valid projects: {}.",
                    self.valid_project_names()
                ),
            );
        };

        // Scheduled and chat-triggered updates report failures through the
        // rate-limited channel notification below, so the handler itself
        // logs only.
        let handler = Handler::new(
            Arc::clone(&self.ctx),
            format!("bump-deps {project_name}"),
            None,
        );
        let title = format!("dependency update for {project_name}");
        let outcome = handler
            .run(&title, |run| {
                let project = project.clone();
                async move {
                    self.update_dependencies_run(run, project_name, project)
                        .await
                }
            })
            .await;

        match outcome {
            Ok(result) => result,
            Err(e) => {
                self.maybe_notify_about_error(project_name, &project, &e)
                    .await;
                (false, e.to_string())
            }
        }
    }

    async fn update_dependencies_run(
        &self,
        run: Arc<Run>,
        project_name: &str,
        project: ProjectConfig,
    ) -> Result<(bool, String)> {
        let ad_hoc_job = format!("{}-trigger-ad_hoc", project.pipeline);

        let detector = BuildConflictDetector::new(
            Arc::clone(&self.ci),
            project.pipeline.clone(),
            ad_hoc_job.clone(),
            DEPENDENCY_BRANCH_NAME,
        );
        if detector.conflicting_build_running().await? {
            let message = "Conflicting build in progress, skipping dependency update".to_string();
            run.output.info(&message);
            return Ok((false, message));
        }

        let repo = self.workspace(Arc::clone(&run), project.clone());

        // Held across the quiet-period check and the force-push so two
        // concurrent updates for one project cannot interleave them.
        let publish_lock = self.publish_lock(project_name);
        let _publish = publish_lock.lock().await;

        let builder =
            DependencyUpdateBuilder::new(&repo, DEPENDENCY_BRANCH_NAME, self.config().quiet_period_s);
        let (updated, reason) = builder.run().await?;
        if !updated {
            return Ok((false, reason));
        }

        self.trigger_build(&run, &ad_hoc_job, DEPENDENCY_BRANCH_NAME)
            .await?;
        run.output
            .inform(&format!(
                "Started dependency update build for project {project_name}."
            ))
            .await;
        Ok((true, "build started".to_string()))
    }

    /// Forget previously-submitted dependency builds: delete the upstream
    /// automation branch so the quiet period no longer applies.
    pub async fn forget_builds(&self, project_name: &str) -> (bool, String) {
        let Some(project) = self.projects.get(project_name).cloned() else {
            return (
                false,
                format!(
                    "Invalid project `{project_name}`. Valid projects: {}.",
                    self.valid_project_names()
                ),
            );
        };

        let handler = Handler::new(
            Arc::clone(&self.ctx),
            format!("forget-bump-deps-builds {project_name}"),
            Some(self.inform_channel(&project)),
        );
        let outcome = handler
            .run(
                &format!("forget bump-deps builds for {project_name}"),
                |run| {
                    let project = project.clone();
                    async move {
                        let repo = self.workspace(Arc::clone(&run), project);
                        repo.synchronize().await?;
                        let deleted = repo.delete_remote_branch(DEPENDENCY_BRANCH_NAME).await?;
                        let message = if deleted {
                            format!("Deleted branch {DEPENDENCY_BRANCH_NAME} of {project_name}.")
                        } else {
                            format!(
                                "No branch {DEPENDENCY_BRANCH_NAME} to delete for {project_name}."
                            )
                        };
                        run.output.inform(&message).await;
                        Ok((deleted, message))
                    }
                },
            )
            .await;
        outcome.unwrap_or_else(|e| (false, e.to_string()))
    }

    // ── Version bumps ─────────────────────────────────────────────────────

    /// Manual "bump" variant: bump the version, tag, push, trigger a
    /// release build for the new tag.
    pub async fn bump_version_and_trigger(&self, project_name: &str) -> Result<String> {
        let Some(project) = self.projects.get(project_name).cloned() else {
            return Err(Error::Config(format!(
                "Invalid project `{project_name}`. Valid projects: {}.",
                self.valid_project_names()
            )));
        };

        let handler = Handler::new(
            Arc::clone(&self.ctx),
            format!("bump {project_name}"),
            Some(self.inform_channel(&project)),
        );
        handler
            .run(&format!("version bump for {project_name}"), |run| {
                let project = project.clone();
                async move {
                    let repo = self.workspace(Arc::clone(&run), project.clone());
                    repo.synchronize().await?;
                    self.bump_and_release(&run, project_name, &project, &repo)
                        .await
                }
            })
            .await
    }

    async fn bump_and_release(
        &self,
        run: &Arc<Run>,
        project_name: &str,
        project: &ProjectConfig,
        repo: &RepoWorkspace,
    ) -> Result<String> {
        repo.bump_version().await?;
        let tag = repo.tag_and_commit().await?;
        self.trigger_build(run, &format!("{}-trigger-release", project.pipeline), &tag)
            .await?;
        run.output
            .inform(&format!(
                "Bumped version of {project_name} to {tag} and kicked off a release build."
            ))
            .await;
        Ok(tag)
    }

    // ── Webhook ───────────────────────────────────────────────────────────

    /// A merged pull request bumps the project version and triggers a
    /// release, but only if the merge SHA still matches upstream master,
    /// so we never build a state a second merge already superseded.
    pub async fn handle_pull_request_event(&self, event: PullRequestEvent) -> Result<()> {
        let Some((project_name, project)) =
            self.project_for_repository(&event.repository.name)
        else {
            info!(
                "Repository '{}' is not monitored, ignoring webhook",
                event.repository.name
            );
            return Ok(());
        };

        let Some(sha) = merged_sha(&event) else {
            info!(
                "Ignoring '{}' event for '{}': not a completed merge",
                event.action, event.repository.name
            );
            return Ok(());
        };
        let sha = sha.to_string();

        let handler = Handler::new(
            Arc::clone(&self.ctx),
            format!("pull-request {project_name}"),
            Some(self.inform_channel(&project)),
        );
        let title = match &event.pull_request.html_url {
            Some(url) => format!("merged pull request {url}"),
            None => format!("merged pull request for {project_name}"),
        };
        handler
            .run(&title, |run| {
                let project = project.clone();
                let project_name = project_name.clone();
                async move {
                    let repo = self.workspace(Arc::clone(&run), project.clone());
                    repo.synchronize().await?;
                    let head = repo.current_sha().await?;
                    if head != sha {
                        run.output.warn(&format!(
                            "Merge commit {sha} does not match current master {head}; \
                             a newer merge landed first. Skipping version bump."
                        ));
                        return Ok(());
                    }
                    self.bump_and_release(&run, &project_name, &project, &repo)
                        .await?;
                    Ok(())
                }
            })
            .await
    }

    // ── CI trigger & failure notifications ────────────────────────────────

    pub async fn trigger_build(&self, run: &Run, job: &str, git_ref: &str) -> Result<()> {
        run.output
            .debug(&format!("Kicking off a build for {job} at ref {git_ref}."));

        if !self.config().trigger_real_builds {
            run.output
                .warn("Would have triggered a build, but trigger_real_builds is false.");
            return Ok(());
        }

        self.ci
            .post_json(
                &format!("/job/{job}/buildWithParameters"),
                &[
                    ("GIT_REF", git_ref),
                    ("EXPIRE_CACHE", "false"),
                    ("INITIATED_BY", &self.config().initiated_by),
                ],
            )
            .await?;
        Ok(())
    }

    fn rate_limit_marker(&self) -> PathBuf {
        PathBuf::from(&self.config().cache_dir).join(FAILURE_NOTIFICATION_RATE_LIMIT_FILE)
    }

    /// Channel notification for pipeline failures, rate-limited by the
    /// marker file's mtime. Last-writer-wins is fine here: a lost update
    /// merely delays one notification.
    async fn maybe_notify_about_error(
        &self,
        project_name: &str,
        project: &ProjectConfig,
        error: &Error,
    ) {
        let marker = self.rate_limit_marker();
        if let Ok(modified) = std::fs::metadata(&marker).and_then(|m| m.modified()) {
            let elapsed = SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default()
                .as_secs() as i64;
            if elapsed < self.config().failure_quiet_s {
                info!(
                    "Last error {elapsed}s ago, quiet period is {}s, suppressing notification.",
                    self.config().failure_quiet_s
                );
                return;
            }
        }

        if let Some(parent) = marker.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&marker, b"") {
            warn!("failed to refresh failure-notification marker: {e}");
        }

        let message = format!(
            "Attempted dependency update for {project_name} failed.\nError was:\n```\n{error}\n```"
        );
        let channel = self.inform_channel(project);
        if let Err(e) = self.ctx.notifier.send(&channel, &message).await {
            warn!("failed to notify {channel} about dependency update failure: {e}");
        }
    }
}
