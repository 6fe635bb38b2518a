use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::notify::Notifier;
use crate::output::{how_long_ago, RunOutput};
use crate::registry::{RunRegistry, RunSnapshot};
use crate::store::RunStore;

/// Hard ceiling on subprocess execution.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(3600);

/// Shared dependencies every handler needs to supervise a run.
pub struct HandlerContext {
    pub config: Arc<Config>,
    pub store: Arc<RunStore>,
    pub registry: Arc<RunRegistry>,
    pub notifier: Arc<dyn Notifier>,
}

/// One logical unit-of-work owner (a chat command, a webhook, a timer
/// tick). At most one run may be active per handler instance; a second
/// concurrent `run` fails loudly with [`Error::Reentrant`].
pub struct Handler {
    ctx: Arc<HandlerContext>,
    name: String,
    /// Channel errors and progress notifications go to; None = log only.
    target: Option<String>,
    active: AtomicBool,
}

/// One supervised execution: identity, sandbox, durable log, progress
/// notification. Created by [`Handler::run`] and handed to the work
/// closure; mutated only by the owning run.
pub struct Run {
    pub id: u64,
    pub title: String,
    pub start_time: DateTime<Utc>,
    /// Exclusively owned working directory; removed on success, kept on
    /// failure for postmortems.
    pub sandbox_path: PathBuf,
    pub output: Arc<RunOutput>,
    notifier: Arc<dyn Notifier>,
    target: Option<String>,
    finished: AtomicBool,
    /// Ephemeral progress-message id. The mutex serializes the create /
    /// update / delete transitions between the timer task and run
    /// termination.
    notification: tokio::sync::Mutex<Option<String>>,
}

impl Handler {
    pub fn new(ctx: Arc<HandlerContext>, name: impl Into<String>, target: Option<String>) -> Self {
        Self {
            ctx,
            name: name.into(),
            target,
            active: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &Arc<HandlerContext> {
        &self.ctx
    }

    /// Supervise one unit of work: assign an id, allocate a sandbox,
    /// register the run, stream its log, keep the user informed while it
    /// is slow, and do terminal bookkeeping on every exit path.
    ///
    /// A failure from `work` is reported once (log + notifier) and comes
    /// back as [`Error::AlreadyReported`]; an `AlreadyReported` failure is
    /// logged but not re-reported.
    pub async fn run<T, F, Fut>(&self, title: &str, work: F) -> Result<T>
    where
        F: FnOnce(Arc<Run>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.active.swap(true, Ordering::AcqRel) {
            return Err(Error::Reentrant(self.name.clone()));
        }
        let result = self.run_supervised(title, work).await;
        self.active.store(false, Ordering::Release);
        result
    }

    async fn run_supervised<T, F, Fut>(&self, title: &str, work: F) -> Result<T>
    where
        F: FnOnce(Arc<Run>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ctx = &self.ctx;
        if let Err(e) = ctx.store.purge_expired() {
            warn!("failed to purge expired runs: {e}");
        }

        let id = ctx.store.next_run_id()?;
        let start_time = Utc::now();

        let sandbox_path = Path::new(&ctx.config.sandbox_dir).join(id.to_string());
        let _ = tokio::fs::remove_dir_all(&sandbox_path).await;
        tokio::fs::create_dir_all(&sandbox_path).await?;

        let output = Arc::new(RunOutput::new(
            id,
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.notifier),
            self.target.clone(),
        ));
        let run = Arc::new(Run {
            id,
            title: title.to_string(),
            start_time,
            sandbox_path,
            output,
            notifier: Arc::clone(&ctx.notifier),
            target: self.target.clone(),
            finished: AtomicBool::new(false),
            notification: tokio::sync::Mutex::new(None),
        });

        ctx.registry.insert(RunSnapshot {
            id,
            title: title.to_string(),
            start_time,
        });
        if let Err(e) = ctx.store.record_start(id, title, start_time) {
            warn!("[{id}] failed to write ledger start record: {e}");
        }

        run.output.debug("Starting");
        let progress = tokio::spawn(progress_task(
            Arc::clone(&run),
            ctx.config.progress_delay_ms,
            ctx.config.progress_refresh_ms,
        ));

        let result = match work(Arc::clone(&run)).await {
            Ok(value) => Ok(value),
            Err(Error::AlreadyReported(msg)) => {
                run.output.error(&format!(
                    "Aborting \"{title}\" due to previously raised error"
                ));
                Err(Error::AlreadyReported(msg))
            }
            Err(e) => {
                let msg = format!("Unhandled error while working on \"{title}\":\n{e}");
                run.output.inform_error(&msg).await;
                Err(Error::AlreadyReported(e.to_string()))
            }
        };

        run.finish(result.is_err(), ctx).await;
        progress.abort();
        result
    }
}

impl Run {
    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Terminal bookkeeping. Best-effort throughout: a failing step is
    /// logged and the remaining steps still run.
    async fn finish(&self, failed: bool, ctx: &HandlerContext) {
        self.finished.store(true, Ordering::Release);

        {
            let mut notification = self.notification.lock().await;
            if let (Some(id), Some(target)) = (notification.take(), self.target.as_deref()) {
                if let Err(e) = self.notifier.delete_ephemeral(target, &id).await {
                    warn!("[{}] failed to delete progress notification: {e}", self.id);
                }
            }
        }

        ctx.registry.remove(self.id);

        if let Err(e) = ctx.store.record_end(self.id, Utc::now(), failed) {
            warn!("[{}] failed to write ledger end record: {e}", self.id);
        }

        if failed {
            self.output.debug(&format!(
                "Keeping sandbox {} for inspection",
                self.sandbox_path.display()
            ));
        } else if let Err(e) = tokio::fs::remove_dir_all(&self.sandbox_path).await {
            warn!("[{}] failed to remove sandbox: {e}", self.id);
        }
    }

    fn progress_text(&self) -> String {
        let elapsed = (Utc::now() - self.start_time).num_seconds();
        let mut text = format!(
            "Still working on \"{}\" (started {})\n",
            self.title,
            how_long_ago(elapsed)
        );
        let tail = self.output.tail();
        if !tail.is_empty() {
            text.push_str("```\n");
            for line in tail {
                text.push_str(&line);
            }
            text.push_str("```");
        }
        text
    }

    /// Run a subprocess in `cwd`. Output is drained concurrently with the
    /// child so a full pipe cannot wedge it; execution is bounded by
    /// [`COMMAND_TIMEOUT`]. Non-zero exit yields [`Error::Command`] with
    /// the captured output.
    pub async fn run_command(&self, cwd: &Path, argv: &[&str]) -> Result<CommandOutput> {
        self.output
            .debug(&format!("Running `{}` in {}", argv.join(" "), cwd.display()));
        run_command(cwd, argv).await
    }

    /// Run a configured shell command string (update/bump commands are
    /// arbitrary shell pipelines).
    pub async fn run_shell(&self, cwd: &Path, command: &str) -> Result<CommandOutput> {
        self.output
            .debug(&format!("Running `{command}` in {}", cwd.display()));
        run_command(cwd, &["sh", "-c", command]).await
    }
}

/// Captured output of a completed subprocess.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

pub async fn run_command(cwd: &Path, argv: &[&str]) -> Result<CommandOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::Config("empty command".to_string()))?;
    let command_line = argv.join(" ");

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(COMMAND_TIMEOUT, cmd.output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(Error::Command {
                command: command_line,
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("timed out after {}s", COMMAND_TIMEOUT.as_secs()),
            })
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        return Err(Error::Command {
            command: command_line,
            exit_code: output.status.code().unwrap_or(-1),
            stdout,
            stderr,
        });
    }
    Ok(CommandOutput { stdout, stderr })
}

/// Background progress reporter for one run. Posts an ephemeral "still in
/// progress" message once the delay elapses, refreshes it while the run is
/// active, and bails out the moment the run finishes. Termination deletes
/// the message under the same mutex, so the timer firing just after the
/// run ends is a safe no-op.
async fn progress_task(run: Arc<Run>, delay_ms: u64, refresh_ms: u64) {
    let Some(target) = run.target.clone() else {
        return;
    };
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    loop {
        if run.finished() {
            return;
        }
        let text = run.progress_text();
        {
            let mut notification = run.notification.lock().await;
            if run.finished() {
                return;
            }
            match notification.as_deref() {
                Some(id) => {
                    if let Err(e) = run.notifier.update_ephemeral(&target, id, &text).await {
                        warn!("[{}] failed to update progress notification: {e}", run.id);
                    }
                }
                None => match run.notifier.post_ephemeral(&target, &text).await {
                    Ok(id) => *notification = Some(id),
                    Err(e) => {
                        warn!("[{}] failed to post progress notification: {e}", run.id);
                    }
                },
            }
        }
        tokio::time::sleep(Duration::from_millis(refresh_ms.max(100))).await;
    }
}
