use std::sync::Arc;

use serde_json::Value;

use crate::ci::CiApi;
use crate::error::Result;

/// Stage suffixes of a logical pipeline, in order, after the trigger job.
pub const PIPELINE_JOBS: [&str; 3] = ["build", "test", "release"];

/// Decides whether triggering a build for a git ref would race a build
/// already in flight anywhere in the pipeline. Automation must never queue
/// two builds for the same ref back to back.
///
/// Query failures propagate: detection fails closed ("cannot determine,
/// do not proceed"), never silently assumes no conflict.
pub struct BuildConflictDetector {
    ci: Arc<dyn CiApi>,
    pipeline: String,
    trigger: String,
    target_git_ref: String,
}

impl BuildConflictDetector {
    pub fn new(
        ci: Arc<dyn CiApi>,
        pipeline: impl Into<String>,
        trigger: impl Into<String>,
        target_git_ref: impl Into<String>,
    ) -> Self {
        Self {
            ci,
            pipeline: pipeline.into(),
            trigger: trigger.into(),
            target_git_ref: target_git_ref.into(),
        }
    }

    /// Ordered stage jobs: the trigger job, then `<pipeline>-<stage>` for
    /// each pipeline stage.
    pub fn stage_jobs(&self) -> Vec<String> {
        let mut jobs = vec![self.trigger.clone()];
        jobs.extend(PIPELINE_JOBS.iter().map(|j| format!("{}-{j}", self.pipeline)));
        jobs
    }

    pub async fn conflicting_build_running(&self) -> Result<bool> {
        Ok(!self.conflicting_builds_in_progress().await?.is_empty())
    }

    async fn conflicting_builds_in_progress(&self) -> Result<Vec<(String, i64)>> {
        let mut conflicts = Vec::new();
        for job in self.stage_jobs() {
            for number in self.builds_in_progress_for_job(&job).await? {
                if self.conflicting_build(&job, number).await? {
                    conflicts.push((job.clone(), number));
                }
            }
        }
        Ok(conflicts)
    }

    /// Builds whose `result` is still unset are in progress. (Comparing
    /// build numbers against lastCompletedBuild is unreliable once builds
    /// complete out of order.)
    async fn builds_in_progress_for_job(&self, job: &str) -> Result<Vec<i64>> {
        let data = self
            .ci
            .get_json(&format!("/job/{job}/api/json?tree=name,builds[number,result]"))
            .await?;
        let builds = data["builds"].as_array().cloned().unwrap_or_default();
        Ok(builds
            .iter()
            .filter(|b| b.get("result").map_or(true, Value::is_null))
            .filter_map(|b| b["number"].as_i64())
            .collect())
    }

    /// Does this build's GIT_REF parameter match the target ref?
    async fn conflicting_build(&self, job: &str, build_number: i64) -> Result<bool> {
        let data = self
            .ci
            .get_json(&format!("/job/{job}/{build_number}/api/json"))
            .await?;
        let git_ref = data["actions"]
            .as_array()
            .and_then(|actions| actions.iter().find(|a| a.get("parameters").is_some()))
            .and_then(|a| a["parameters"].as_array())
            .and_then(|params| params.iter().find(|p| p["name"] == "GIT_REF"))
            .and_then(|p| p["value"].as_str());
        Ok(git_ref == Some(self.target_git_ref.as_str()))
    }
}
