#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use bumpbot_core::ci::CiApi;
use bumpbot_core::config::{Config, ProjectConfig};
use bumpbot_core::error::Result;
use bumpbot_core::notify::Notifier;
use bumpbot_core::pipeline::Bot;
use bumpbot_core::registry::RunRegistry;
use bumpbot_core::run::HandlerContext;
use bumpbot_core::store::RunStore;

// ── git fixtures ──────────────────────────────────────────────────────────

pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run git");
    assert!(
        out.status.success(),
        "git {args:?} in {} failed: {}",
        dir.display(),
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// git against a bare repository.
pub fn bare_git(git_dir: &Path, args: &[&str]) -> String {
    let mut argv = vec!["--git-dir", git_dir.to_str().expect("utf8 path")];
    argv.extend_from_slice(args);
    let out = Command::new("git").args(&argv).output().expect("run git");
    assert!(
        out.status.success(),
        "git {args:?} against {} failed: {}",
        git_dir.display(),
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

pub fn bare_branch_exists(git_dir: &Path, branch: &str) -> bool {
    Command::new("git")
        .args(["--git-dir", git_dir.to_str().expect("utf8 path")])
        .args(["rev-parse", "--verify", &format!("refs/heads/{branch}")])
        .output()
        .expect("run git")
        .status
        .success()
}

/// Bare upstream repo seeded with deps.txt and VERSION on master.
pub fn init_origin(root: &Path) -> PathBuf {
    let origin = root.join("origin.git");
    git(
        root,
        &[
            "-c",
            "init.defaultBranch=master",
            "init",
            "--bare",
            "origin.git",
        ],
    );

    let seed = root.join("seed");
    std::fs::create_dir_all(&seed).expect("create seed dir");
    git(&seed, &["-c", "init.defaultBranch=master", "init"]);
    git(&seed, &["config", "user.email", "fixtures@test"]);
    git(&seed, &["config", "user.name", "Fixtures"]);
    std::fs::write(seed.join("deps.txt"), "X\n").expect("write deps.txt");
    std::fs::write(seed.join("VERSION"), "1.0.0\n").expect("write VERSION");
    git(&seed, &["add", "-A"]);
    git(&seed, &["commit", "-m", "initial"]);
    git(
        &seed,
        &["remote", "add", "origin", origin.to_str().expect("utf8 path")],
    );
    git(&seed, &["push", "origin", "master"]);
    origin
}

/// Commit an extra file straight to the upstream via the seed clone.
pub fn push_upstream_commit(root: &Path, file: &str, contents: &str) {
    let seed = root.join("seed");
    std::fs::write(seed.join(file), contents).expect("write file");
    git(&seed, &["add", "-A"]);
    git(&seed, &["commit", "-m", "upstream change"]);
    git(&seed, &["push", "origin", "master"]);
}

/// Push `branch` upstream with a commit dated `epoch_s`, as if automation
/// had published it back then.
pub fn push_backdated_branch(root: &Path, branch: &str, file: &str, contents: &str, epoch_s: i64) {
    let seed = root.join("seed");
    git(&seed, &["checkout", "-B", branch]);
    std::fs::write(seed.join(file), contents).expect("write file");
    git(&seed, &["add", "-A"]);
    let date = format!("{epoch_s} +0000");
    let out = Command::new("git")
        .args(["commit", "--allow-empty", "-m", "automated dependency update"])
        .env("GIT_AUTHOR_DATE", &date)
        .env("GIT_COMMITTER_DATE", &date)
        .current_dir(&seed)
        .output()
        .expect("run git commit");
    assert!(
        out.status.success(),
        "backdated commit failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    git(&seed, &["push", "--force", "origin", branch]);
    git(&seed, &["checkout", "master"]);
}

// ── fakes ─────────────────────────────────────────────────────────────────

/// CI fake: canned GET responses (any unstubbed job listing is empty) and
/// a record of every POST.
#[derive(Default)]
pub struct FakeCi {
    responses: Mutex<HashMap<String, Value>>,
    posts: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl FakeCi {
    pub fn stub(&self, path: &str, value: Value) {
        self.responses
            .lock()
            .expect("lock")
            .insert(path.to_string(), value);
    }

    pub fn posts(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.posts.lock().expect("lock").clone()
    }
}

#[async_trait]
impl CiApi for FakeCi {
    async fn get_json(&self, path: &str) -> Result<Value> {
        Ok(self
            .responses
            .lock()
            .expect("lock")
            .get(path)
            .cloned()
            .unwrap_or_else(|| json!({ "builds": [] })))
    }

    async fn post_json(&self, path: &str, params: &[(&str, &str)]) -> Result<Value> {
        self.posts.lock().expect("lock").push((
            path.to_string(),
            params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ));
        Ok(Value::Null)
    }
}

/// Notifier fake recording every call.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sends: Mutex<Vec<(String, String)>>,
    pub ephemeral_posts: Mutex<Vec<String>>,
    pub ephemeral_deletes: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, target: &str, text: &str) -> Result<()> {
        self.sends
            .lock()
            .expect("lock")
            .push((target.to_string(), text.to_string()));
        Ok(())
    }

    async fn post_ephemeral(&self, _target: &str, text: &str) -> Result<String> {
        let mut posts = self.ephemeral_posts.lock().expect("lock");
        posts.push(text.to_string());
        Ok(posts.len().to_string())
    }

    async fn update_ephemeral(&self, _target: &str, _id: &str, text: &str) -> Result<()> {
        self.ephemeral_posts.lock().expect("lock").push(text.to_string());
        Ok(())
    }

    async fn delete_ephemeral(&self, _target: &str, id: &str) -> Result<()> {
        self.ephemeral_deletes
            .lock()
            .expect("lock")
            .push(id.to_string());
        Ok(())
    }
}

// ── harness ───────────────────────────────────────────────────────────────

pub fn test_config(root: &Path) -> Config {
    Config {
        ci_endpoint: "http://ci.test/".to_string(),
        ci_username: "bot".to_string(),
        ci_api_token: "token".to_string(),
        trigger_real_builds: true,
        initiated_by: "BumpBot".to_string(),
        cache_dir: root.join("cache").to_string_lossy().into_owned(),
        sandbox_dir: root.join("sandbox").to_string_lossy().into_owned(),
        store_path: root.join("bumpbot.db").to_string_lossy().into_owned(),
        projects_file: root.join("projects.json").to_string_lossy().into_owned(),
        polling_interval_s: 0,
        quiet_period_s: 24 * 60 * 60,
        failure_quiet_s: 60 * 60,
        progress_delay_ms: 10,
        progress_refresh_ms: 50,
        default_inform_channel: "eng-services".to_string(),
        git_committer_name: "BumpBot".to_string(),
        git_committer_email: "bumpbot@test".to_string(),
        web_bind: "127.0.0.1".to_string(),
        web_port: 0,
    }
}

pub fn project(origin: &Path, dependency_update_command: Option<&str>) -> ProjectConfig {
    ProjectConfig {
        pipeline: "testproj".to_string(),
        repo_url: origin.to_string_lossy().into_owned(),
        version_bump_command: Some("printf '1.0.1\\n' > VERSION".to_string()),
        version_show_command: Some("cat VERSION".to_string()),
        dependency_update_command: dependency_update_command.map(str::to_string),
        inform_channel: None,
    }
}

pub struct Fixture {
    pub root: TempDir,
    pub origin: PathBuf,
    pub bot: Bot,
    pub ci: Arc<FakeCi>,
    pub notifier: Arc<RecordingNotifier>,
    pub ctx: Arc<HandlerContext>,
}

impl Fixture {
    /// Upstream repo plus a fully wired bot watching it as "testproj".
    pub fn new(dependency_update_command: Option<&str>) -> Self {
        let root = TempDir::new().expect("tempdir");
        let origin = init_origin(root.path());
        let proj = project(&origin, dependency_update_command);
        let mut projects = HashMap::new();
        projects.insert("testproj".to_string(), proj);
        Self::with_projects(root, origin, projects)
    }

    pub fn with_projects(
        root: TempDir,
        origin: PathBuf,
        projects: HashMap<String, ProjectConfig>,
    ) -> Self {
        let config = Arc::new(test_config(root.path()));
        std::fs::create_dir_all(&config.cache_dir).expect("create cache dir");
        std::fs::create_dir_all(&config.sandbox_dir).expect("create sandbox dir");

        let store = Arc::new(RunStore::open(&config.store_path).expect("open store"));
        let notifier = Arc::new(RecordingNotifier::default());
        let ctx = Arc::new(HandlerContext {
            config,
            store,
            registry: Arc::new(RunRegistry::default()),
            notifier: Arc::clone(&notifier) as Arc<dyn Notifier>,
        });
        let ci = Arc::new(FakeCi::default());
        let bot = Bot::new(
            Arc::clone(&ctx),
            projects,
            Arc::clone(&ci) as Arc<dyn CiApi>,
        );
        Self {
            root,
            origin,
            bot,
            ci,
            notifier,
            ctx,
        }
    }

    pub fn master_sha(&self) -> String {
        bare_git(&self.origin, &["rev-parse", "refs/heads/master"])
    }
}
