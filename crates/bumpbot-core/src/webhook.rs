use serde::Deserialize;

/// The slice of GitHub's `pull_request` event payload the bot acts on.
/// Unknown fields are ignored so payload growth upstream never breaks
/// deserialization.
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub repository: Repository,
    pub pull_request: PullRequest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    #[serde(default)]
    pub merged: bool,
    pub merge_commit_sha: Option<String>,
    pub html_url: Option<String>,
}

/// The merge commit SHA, but only for an event describing a pull request
/// that was actually merged. Closed-without-merge and every other action
/// yield `None`.
pub fn merged_sha(event: &PullRequestEvent) -> Option<&str> {
    if event.action != "closed" || !event.pull_request.merged {
        return None;
    }
    event.pull_request.merge_commit_sha.as_deref()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(action: &str, merged: bool, sha: Option<&str>) -> PullRequestEvent {
        PullRequestEvent {
            action: action.to_string(),
            repository: Repository {
                name: "widget-api".to_string(),
            },
            pull_request: PullRequest {
                merged,
                merge_commit_sha: sha.map(str::to_string),
                html_url: Some("https://github.com/chef/widget-api/pull/1".to_string()),
            },
        }
    }

    #[test]
    fn merged_close_yields_sha() {
        let e = event("closed", true, Some("abc123"));
        assert_eq!(merged_sha(&e), Some("abc123"));
    }

    #[test]
    fn close_without_merge_is_ignored() {
        assert_eq!(merged_sha(&event("closed", false, Some("abc123"))), None);
    }

    #[test]
    fn other_actions_are_ignored() {
        for action in ["opened", "synchronize", "labeled", "reopened"] {
            assert_eq!(merged_sha(&event(action, true, Some("abc123"))), None);
        }
    }

    #[test]
    fn merged_close_without_sha_is_ignored() {
        assert_eq!(merged_sha(&event("closed", true, None)), None);
    }

    #[test]
    fn payload_parses_with_extra_fields() {
        let raw = r#"{
            "action": "closed",
            "number": 42,
            "repository": { "name": "widget-api", "full_name": "chef/widget-api" },
            "pull_request": {
                "merged": true,
                "merge_commit_sha": "deadbeef",
                "html_url": "https://github.com/chef/widget-api/pull/42",
                "state": "closed"
            }
        }"#;
        let e: PullRequestEvent = serde_json::from_str(raw).expect("payload parses");
        assert_eq!(merged_sha(&e), Some("deadbeef"));
        assert_eq!(e.repository.name, "widget-api");
    }
}
