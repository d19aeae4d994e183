//! Collection orchestrator: `Init -> ListingProjects ->
//! (ListingRepos -> CollectingRepo*)* -> Finalizing -> Done`, with
//! `SkipRepo` on a non-fatal per-repository error. Repository collection is
//! fanned out across a bounded worker pool; within one repository,
//! collection stays sequential.

use crate::adapters::{CommitBundle, ProjectRef, SourceAdapter};
use crate::config::{BranchSelector, Settings};
use crate::error::SinkError;
use crate::models::*;
use crate::run_recorder::RunRecorder;
use crate::sink::BatchedSink;
use crate::watermark::WatermarkStore;
use log::{error, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

pub struct Orchestrator {
    settings: Settings,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub stats: RunStats,
}

/// `"all"` walks every branch, `"default"` walks only the one the adapter
/// marked `is_default`.
pub fn select_branches(selector: BranchSelector, branches: &[Branch]) -> Vec<Branch> {
    match selector {
        BranchSelector::All => branches.to_vec(),
        BranchSelector::DefaultOnly => branches.iter().filter(|b| b.is_default).cloned().collect(),
    }
}

/// A commit reachable from more than one branch is emitted exactly once,
/// attributed to whichever branch produced it first. `seen` accumulates
/// across the whole repository, so callers MUST walk branches in a fixed
/// order and feed each branch's bundles through in turn.
pub fn dedupe_commit_bundles(seen: &mut HashSet<String>, bundles: Vec<CommitBundle>) -> Vec<CommitBundle> {
    bundles.into_iter().filter(|b| seen.insert(b.commit.commit_hash.clone())).collect()
}

/// Only a project-listing failure, a sink failure, or cancellation fails the
/// whole run; repository-level failures are isolated and only increment
/// `errors`.
pub fn determine_run_status(sink_failed: bool, cancelled: bool) -> RunStatus {
    if sink_failed || cancelled {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    }
}

impl Orchestrator {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub async fn run(
        &self,
        adapter: Arc<dyn SourceAdapter>,
        watermarks: Arc<WatermarkStore>,
        sink: Arc<Mutex<BatchedSink>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunOutcome> {
        let mut recorder = RunRecorder::start(&self.settings.data_source, self.settings.settings_json());
        info!("run {}: starting collection against {}", recorder.run_id(), self.settings.upstream_url);
        {
            let mut guard = sink.lock().await;
            recorder.write_initial(&mut guard).await?;
            guard.flush("collection_runs").await?;
        }

        let projects = match adapter.list_projects(&cancel).await {
            Ok(p) => p,
            Err(e) => {
                error!("run {}: fatal error listing projects: {}", recorder.run_id(), e);
                let mut guard = sink.lock().await;
                recorder.finalize(&mut guard, RunStatus::Failed).await?;
                guard.flush_all().await?;
                return Ok(RunOutcome { run_id: recorder.run_id().to_string(), status: RunStatus::Failed, stats: recorder.stats().clone() });
            }
        };

        let stats = Arc::new(Mutex::new(RunStats::default()));
        let sink_failed = Arc::new(AtomicBool::new(false));
        let semaphore = Arc::new(Semaphore::new(self.settings.max_workers.max(1)));
        let mut handles = Vec::new();

        'projects: for project in projects {
            if cancel.is_cancelled() {
                info!("run {}: cancellation observed, not listing repositories for project {}", recorder.run_id(), project.project_key);
                break;
            }
            let repos = match adapter.list_repositories(&project, &cancel).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("run {}: failed to list repositories for project {}: {}", recorder.run_id(), project.project_key, e);
                    stats.lock().await.errors += 1;
                    continue;
                }
            };

            for repo in repos {
                if cancel.is_cancelled() {
                    break 'projects;
                }
                if !self.settings.wants_repo(&project.project_key, &repo.repo_slug) {
                    continue;
                }
                let permit = Arc::clone(&semaphore);
                let adapter = Arc::clone(&adapter);
                let watermarks = Arc::clone(&watermarks);
                let sink = Arc::clone(&sink);
                let stats = Arc::clone(&stats);
                let settings = self.settings.clone();
                let project = project.clone();
                let run_id = recorder.run_id().to_string();
                let cancel = cancel.clone();

                handles.push(tokio::spawn(async move {
                    let _permit = permit.acquire_owned().await.expect("semaphore is never closed during a run");
                    collect_repository(&run_id, &settings, adapter, watermarks, sink, stats, project, repo, cancel).await
                }));
            }
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(sink_err)) => {
                    error!("run {}: sink error collecting a repository, failing the run: {}", recorder.run_id(), sink_err);
                    sink_failed.store(true, Ordering::SeqCst);
                }
                Err(join_err) => {
                    error!("run {}: repository collection task panicked: {}", recorder.run_id(), join_err);
                    sink_failed.store(true, Ordering::SeqCst);
                }
            }
        }

        *recorder.stats_mut() = stats.lock().await.clone();
        let status = determine_run_status(sink_failed.load(Ordering::SeqCst), cancel.is_cancelled());
        if cancel.is_cancelled() {
            info!("run {}: cancellation signal received, finalizing as failed", recorder.run_id());
        }

        let mut guard = sink.lock().await;
        recorder.finalize(&mut guard, status).await?;
        guard.flush_all().await?;

        info!("run {}: finished with status={} stats={:?}", recorder.run_id(), status, recorder.stats());
        Ok(RunOutcome { run_id: recorder.run_id().to_string(), status, stats: recorder.stats().clone() })
    }
}

/// Collects one repository end to end. Upstream failures at this level are
/// isolated: logged, counted into `stats.errors`, and the function returns
/// `Ok(())` so the orchestrator moves on to the next repository. Only a `SinkError` propagates, since that is fatal to the
/// whole run.
#[allow(clippy::too_many_arguments)]
async fn collect_repository(
    run_id: &str,
    settings: &Settings,
    adapter: Arc<dyn SourceAdapter>,
    watermarks: Arc<WatermarkStore>,
    sink: Arc<Mutex<BatchedSink>>,
    stats: Arc<Mutex<RunStats>>,
    project: ProjectRef,
    repo: Repository,
    cancel: CancellationToken,
) -> Result<(), SinkError> {
    let watermark = if settings.force_refetch {
        Default::default()
    } else {
        watermarks
            .read(&project.project_key, &repo.repo_slug, &settings.data_source)
            .await
            .unwrap_or_default()
    };

    {
        let mut guard = sink.lock().await;
        guard.add_repository(repo.clone()).await?;
    }

    let branches = match adapter.list_branches(&project, &repo, &cancel).await {
        Ok(b) => b,
        Err(e) => {
            warn!("run {}: {}/{}: failed to list branches: {}", run_id, project.project_key, repo.repo_slug, e);
            stats.lock().await.errors += 1;
            return Ok(());
        }
    };

    {
        let mut guard = sink.lock().await;
        for b in &branches {
            guard.add_branch(b.clone()).await?;
        }
    }

    let selected_branches = select_branches(settings.branches, &branches);
    let mut seen_commits: HashSet<String> = HashSet::new();
    let mut repo_commits = 0u64;
    let mut repo_prs = 0u64;
    let mut repo_api_calls = 1u64; // list_branches

    if settings.collect_commits {
        for branch in &selected_branches {
            if cancel.is_cancelled() {
                break;
            }
            let mut collected: Vec<CommitBundle> = Vec::new();
            let result = adapter
                .stream_commits(&project, &repo, &branch.branch_name, watermark.max_commit_date, &mut |bundle| {
                    collected.push(bundle);
                }, &cancel)
                .await;

            let commit_stats = match result {
                Ok(s) => s,
                Err(e) => {
                    warn!(
                        "run {}: {}/{}: branch {}: failed collecting commits: {}",
                        run_id, project.project_key, repo.repo_slug, branch.branch_name, e
                    );
                    stats.lock().await.errors += 1;
                    continue;
                }
            };
            repo_api_calls += commit_stats.pages_fetched as u64;

            let fresh = dedupe_commit_bundles(&mut seen_commits, collected);
            let mut guard = sink.lock().await;
            for bundle in fresh {
                guard.add_commit(bundle.commit).await?;
                for f in bundle.files {
                    guard.add_commit_file(f).await?;
                }
                for t in bundle.tickets {
                    guard.add_ticket(t).await?;
                }
                repo_commits += 1;
            }
        }
    }

    if settings.collect_prs && !cancel.is_cancelled() {
        let mut collected = Vec::new();
        let result = adapter
            .stream_pull_requests(&project, &repo, watermark.max_pr_updated, &mut |bundle| {
                collected.push(bundle);
            }, &cancel)
            .await;

        match result {
            Ok(pr_stats) => {
                repo_api_calls += pr_stats.pages_fetched as u64;
                let mut guard = sink.lock().await;
                for bundle in collected {
                    guard.add_pull_request(bundle.pull_request).await?;
                    if settings.collect_reviews {
                        for r in bundle.reviewers {
                            guard.add_reviewer(r).await?;
                        }
                    }
                    if settings.collect_comments {
                        for c in bundle.comments {
                            guard.add_pr_comment(c).await?;
                        }
                    }
                    for l in bundle.commit_links {
                        guard.add_pr_commit_link(l).await?;
                    }
                    for t in bundle.tickets {
                        guard.add_ticket(t).await?;
                    }
                    repo_prs += 1;
                }
            }
            Err(e) => {
                warn!("run {}: {}/{}: failed collecting pull requests: {}", run_id, project.project_key, repo.repo_slug, e);
                stats.lock().await.errors += 1;
            }
        }
    }

    let mut s = stats.lock().await;
    s.repos_processed += 1;
    s.commits_collected += repo_commits;
    s.prs_collected += repo_prs;
    s.api_calls += repo_api_calls;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::stamp_version;
    use chrono::Utc;

    fn branch(name: &str, is_default: bool) -> Branch {
        Branch {
            project_key: "TEST".to_string(),
            repo_slug: "test-core".to_string(),
            branch_name: name.to_string(),
            data_source: "insight_bitbucket_server".to_string(),
            is_default,
            last_commit_hash: "deadbeef".to_string(),
            last_commit_date: None,
            last_checked_at: Utc::now(),
            version: stamp_version(),
        }
    }

    fn commit_bundle(hash: &str, branch: &str) -> CommitBundle {
        CommitBundle {
            commit: Commit {
                project_key: "TEST".to_string(),
                repo_slug: "test-core".to_string(),
                commit_hash: hash.to_string(),
                data_source: "insight_bitbucket_server".to_string(),
                branch: branch.to_string(),
                author_name: "a".to_string(),
                author_email: "a@x.com".to_string(),
                committer_name: "a".to_string(),
                committer_email: "a@x.com".to_string(),
                message: "msg".to_string(),
                date: Utc::now(),
                parents: "[]".to_string(),
                files_changed: 0,
                lines_added: 0,
                lines_removed: 0,
                is_merge_commit: false,
                language_breakdown: None,
                version: stamp_version(),
            },
            files: Vec::new(),
            tickets: Vec::new(),
        }
    }

    #[test]
    fn select_branches_all_returns_every_branch() {
        let branches = vec![branch("main", true), branch("develop", false)];
        let selected = select_branches(BranchSelector::All, &branches);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn select_branches_default_only_filters_to_is_default() {
        let branches = vec![branch("main", true), branch("develop", false)];
        let selected = select_branches(BranchSelector::DefaultOnly, &branches);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].branch_name, "main");
    }

    /// A commit on two branches is emitted once, attributed to whichever
    /// branch was walked first.
    #[test]
    fn dedupe_commit_bundles_keeps_first_branchs_copy() {
        let mut seen = HashSet::new();
        let from_main = dedupe_commit_bundles(&mut seen, vec![commit_bundle("c1", "main")]);
        assert_eq!(from_main.len(), 1);
        assert_eq!(from_main[0].commit.branch, "main");

        let from_develop = dedupe_commit_bundles(&mut seen, vec![commit_bundle("c1", "develop")]);
        assert!(from_develop.is_empty());
    }

    #[test]
    fn dedupe_commit_bundles_passes_through_distinct_hashes() {
        let mut seen = HashSet::new();
        let first = dedupe_commit_bundles(&mut seen, vec![commit_bundle("c1", "main")]);
        let second = dedupe_commit_bundles(&mut seen, vec![commit_bundle("c2", "main")]);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn determine_run_status_fails_on_sink_failure_or_cancellation() {
        assert_eq!(determine_run_status(false, false), RunStatus::Completed);
        assert_eq!(determine_run_status(true, false), RunStatus::Failed);
        assert_eq!(determine_run_status(false, true), RunStatus::Failed);
        assert_eq!(determine_run_status(true, true), RunStatus::Failed);
    }
}
