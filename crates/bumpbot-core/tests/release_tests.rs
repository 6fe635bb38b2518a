mod common;

use std::sync::Arc;

use bumpbot_core::error::Error;
use bumpbot_core::run::Handler;
use bumpbot_core::webhook::{PullRequest, PullRequestEvent, Repository};
use bumpbot_core::workspace::RepoWorkspace;
use common::{bare_git, Fixture};

fn merged_event(sha: &str) -> PullRequestEvent {
    PullRequestEvent {
        action: "closed".to_string(),
        repository: Repository {
            name: "origin".to_string(),
        },
        pull_request: PullRequest {
            merged: true,
            merge_commit_sha: Some(sha.to_string()),
            html_url: Some("https://github.com/chef/origin/pull/7".to_string()),
        },
    }
}

#[tokio::test]
async fn manual_bump_tags_master_and_triggers_release() {
    let fx = Fixture::new(None);

    let tag = fx
        .bot
        .bump_version_and_trigger("testproj")
        .await
        .expect("bump");
    assert_eq!(tag, "v1.0.1");

    assert_eq!(bare_git(&fx.origin, &["tag", "-l", "v1.0.1"]), "v1.0.1");
    assert_eq!(
        bare_git(&fx.origin, &["show", "refs/heads/master:VERSION"]),
        "1.0.1"
    );
    assert_eq!(
        bare_git(&fx.origin, &["log", "-1", "--format=%s", "refs/heads/master"]),
        "Bump version of origin to 1.0.1 by BumpBot."
    );

    let posts = fx.ci.posts();
    assert_eq!(posts.len(), 1);
    let (path, params) = &posts[0];
    assert_eq!(path, "/job/testproj-trigger-release/buildWithParameters");
    assert!(params.contains(&("GIT_REF".into(), "v1.0.1".into())));
}

#[tokio::test]
async fn merged_pull_request_bumps_and_releases() {
    let fx = Fixture::new(None);
    let sha = fx.master_sha();

    fx.bot
        .handle_pull_request_event(merged_event(&sha))
        .await
        .expect("webhook");

    assert_eq!(bare_git(&fx.origin, &["tag", "-l", "v1.0.1"]), "v1.0.1");
    assert_eq!(fx.ci.posts().len(), 1);
}

#[tokio::test]
async fn stale_merge_sha_skips_the_bump() {
    let fx = Fixture::new(None);
    let stale = "f".repeat(40);

    fx.bot
        .handle_pull_request_event(merged_event(&stale))
        .await
        .expect("webhook");

    // A newer merge superseded this event; nothing is tagged or built.
    assert_eq!(bare_git(&fx.origin, &["tag", "-l", "v1.0.1"]), "");
    assert!(fx.ci.posts().is_empty());
}

#[tokio::test]
async fn close_without_merge_starts_no_run() {
    let fx = Fixture::new(None);
    let mut event = merged_event(&fx.master_sha());
    event.pull_request.merged = false;

    fx.bot.handle_pull_request_event(event).await.expect("webhook");

    assert!(fx.ctx.store.list_runs().expect("list").is_empty());
    assert!(fx.ci.posts().is_empty());
}

#[tokio::test]
async fn unwatched_repository_is_ignored() {
    let fx = Fixture::new(None);
    let mut event = merged_event(&fx.master_sha());
    event.repository.name = "some-other-repo".to_string();

    fx.bot.handle_pull_request_event(event).await.expect("webhook");

    assert!(fx.ctx.store.list_runs().expect("list").is_empty());
}

#[tokio::test]
async fn failed_push_cleans_up_the_local_tag() {
    let fx = Fixture::new(None);
    let project = common::project(&fx.origin, None);
    let config = Arc::clone(&fx.ctx.config);
    let handler = Handler::new(Arc::clone(&fx.ctx), "tag cleanup", None);

    handler
        .run("tag cleanup", |run| async move {
            let repo = RepoWorkspace::new(
                Arc::clone(&run),
                project,
                config,
                Arc::new(tokio::sync::Mutex::new(())),
            );
            repo.synchronize().await?;
            repo.bump_version().await?;
            // Point pushes somewhere that cannot exist.
            repo.git(&["remote", "set-url", "origin", "/nonexistent/missing.git"])
                .await?;

            let err = repo.tag_and_commit().await.expect_err("push must fail");
            assert!(matches!(err, Error::Command { .. }));

            let tags = repo.git(&["tag", "-l", "v1.0.1"]).await?;
            assert!(tags.stdout.trim().is_empty(), "local tag cleaned up");
            Ok(())
        })
        .await
        .expect("run");
}
