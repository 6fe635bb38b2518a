use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Full application configuration.
/// Loaded from the environment with `.env` fallback; the per-project map
/// lives in a separate JSON file (see [`Config::load_projects`]).
#[derive(Debug, Clone)]
pub struct Config {
    // CI server
    pub ci_endpoint: String,
    pub ci_username: String,
    pub ci_api_token: String,
    /// When false, log what would have been triggered instead of POSTing
    /// to the CI server.
    pub trigger_real_builds: bool,
    /// Value reported in the INITIATED_BY build parameter.
    pub initiated_by: String,

    // Paths
    /// Long-lived state: git mirrors, rate-limit marker.
    pub cache_dir: String,
    /// Per-run sandboxes live in `<sandbox_dir>/<run id>`.
    pub sandbox_dir: String,
    /// sqlite run ledger + logs.
    pub store_path: String,
    /// JSON map of project name to project settings.
    pub projects_file: String,

    // Scheduling
    /// Seconds between scheduled dependency-update sweeps. 0 disables polling.
    pub polling_interval_s: u64,
    /// Seconds before an unchanged, previously-failed update is resubmitted.
    pub quiet_period_s: i64,
    /// Minimum seconds between failure notifications to the inform channel.
    pub failure_quiet_s: i64,

    // Progress notifications
    /// Delay before the first "still in progress" notification.
    pub progress_delay_ms: u64,
    /// Refresh interval for the progress notification while a run is active.
    pub progress_refresh_ms: u64,

    // Chat
    pub default_inform_channel: String,

    // Git attribution
    pub git_committer_name: String,
    pub git_committer_email: String,

    // Web
    pub web_bind: String,
    pub web_port: u16,
}

/// One automated project: where its repo lives, which CI pipeline builds
/// it, and the commands the bot runs inside a checkout.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    /// Base pipeline name on the CI server; job names like
    /// `<pipeline>-build` and `<pipeline>-trigger-release` derive from it.
    pub pipeline: String,
    pub repo_url: String,
    #[serde(default)]
    pub version_bump_command: Option<String>,
    #[serde(default)]
    pub version_show_command: Option<String>,
    #[serde(default)]
    pub dependency_update_command: Option<String>,
    #[serde(default)]
    pub inform_channel: Option<String>,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_i64(key: &str, dotenv: &HashMap<String, String>, default: i64) -> i64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let dotenv = parse_dotenv();
        Self {
            ci_endpoint: get_str("CI_ENDPOINT", &dotenv, "http://localhost:8080/"),
            ci_username: get_str("CI_USERNAME", &dotenv, ""),
            ci_api_token: get_str("CI_API_TOKEN", &dotenv, ""),
            trigger_real_builds: get_bool("TRIGGER_REAL_BUILDS", &dotenv, false),
            initiated_by: get_str("INITIATED_BY", &dotenv, "bumpbot"),
            cache_dir: get_str("CACHE_DIR", &dotenv, "./cache"),
            sandbox_dir: get_str("SANDBOX_DIR", &dotenv, "./cache/sandbox"),
            store_path: get_str("STORE_PATH", &dotenv, "./cache/bumpbot.db"),
            projects_file: get_str("PROJECTS_FILE", &dotenv, "./projects.json"),
            polling_interval_s: get_u64("POLLING_INTERVAL_S", &dotenv, 0),
            quiet_period_s: get_i64("QUIET_PERIOD_S", &dotenv, 24 * 60 * 60),
            failure_quiet_s: get_i64("FAILURE_QUIET_S", &dotenv, 60 * 60),
            progress_delay_ms: get_u64("PROGRESS_DELAY_MS", &dotenv, 3000),
            progress_refresh_ms: get_u64("PROGRESS_REFRESH_MS", &dotenv, 5000),
            default_inform_channel: get_str(
                "DEFAULT_INFORM_CHANNEL",
                &dotenv,
                "eng-services-support",
            ),
            git_committer_name: get_str("GIT_COMMITTER_NAME", &dotenv, "Bumpbot"),
            git_committer_email: get_str("GIT_COMMITTER_EMAIL", &dotenv, "bumpbot@example.com"),
            web_bind: get_str("WEB_BIND", &dotenv, "0.0.0.0"),
            web_port: get_u64("WEB_PORT", &dotenv, 8125) as u16,
        }
    }

    /// Load the per-project map from `projects_file`.
    pub fn load_projects(&self) -> Result<HashMap<String, ProjectConfig>> {
        let contents = std::fs::read_to_string(&self.projects_file).map_err(|e| {
            Error::Config(format!(
                "cannot read projects file {}: {e}",
                self.projects_file
            ))
        })?;
        Ok(serde_json::from_str(&contents)?)
    }
}
