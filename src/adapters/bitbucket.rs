//! Bitbucket Server REST v1.0 adapter. Offset/limit
//! pagination throughout; no bulk path exists for this upstream (no
//! GraphQL), so `capabilities().supports_bulk` is always false.

use super::{AdapterCapabilities, CommitBundle, CommitStreamStats, HttpTransport, PrBundle, PrStreamStats, ProjectRef, SourceAdapter};
use crate::error::AdapterError;
use crate::jira::JiraExtractor;
use crate::models::*;
use crate::paginator::{drive_offset_pagination, should_stop, OffsetPage, OFFSET_PAGE_SIZE};
use crate::rate_limiter::{RateLimiter, ResponseSignal};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct BitbucketAdapter {
    base_url: String,
    data_source: String,
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
    jira: JiraExtractor,
}

impl BitbucketAdapter {
    pub fn new(base_url: String, data_source: String, transport: Arc<dyn HttpTransport>, limiter: Arc<RateLimiter>) -> Self {
        Self { base_url: base_url.trim_end_matches('/').to_string(), data_source, transport, limiter, jira: JiraExtractor::new() }
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, AdapterError> {
        let url = format!("{}{}", self.base_url, path);
        let transport = Arc::clone(&self.transport);
        let url_for_call = url.clone();
        let query_owned: Vec<(String, String)> = query.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        let signal = self
            .limiter
            .call(|| {
                let transport = Arc::clone(&transport);
                let url = url_for_call.clone();
                let query_owned = query_owned.clone();
                async move {
                    let query_refs: Vec<(&str, String)> = query_owned.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
                    let resp = transport
                        .get(&url, &query_refs)
                        .await
                        .map_err(|e| AdapterError::Transient(e.to_string()))?;
                    Ok(ResponseSignal {
                        status: resp.status,
                        remaining: resp.rate_limit_remaining,
                        reset_unix: resp.rate_limit_reset,
                        graphql_rate_limited: false,
                        graphql_error_message: None,
                        body: resp.body,
                    })
                }
            })
            .await?;
        Ok(signal.body)
    }

    fn to_offset_page(body: &Value) -> OffsetPage {
        OffsetPage {
            values: body.get("values").and_then(|v| v.as_array()).cloned().unwrap_or_default(),
            is_last_page: body.get("isLastPage").and_then(|v| v.as_bool()).unwrap_or(true),
            next_page_start: body.get("nextPageStart").and_then(|v| v.as_u64()),
        }
    }

    fn epoch_ms_to_datetime(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
    }

    fn map_repository(&self, project_key: &str, raw: &Value) -> Repository {
        let now = Utc::now();
        Repository {
            project_key: project_key.to_string(),
            repo_slug: raw.get("slug").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            data_source: self.data_source.clone(),
            name: raw.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            uuid: raw.get("id").map(|v| v.to_string()),
            is_private: !raw.get("public").and_then(|v| v.as_bool()).unwrap_or(false),
            size: None,
            language: None,
            has_issues: None,
            has_wiki: None,
            // Bitbucket Server's repo payload has no fork-policy field.
            fork_policy: None,
            is_empty: false,
            last_commit_date: None,
            first_seen: now,
            last_updated: now,
            version: stamp_version(),
        }
    }

    fn map_branch(&self, project_key: &str, repo_slug: &str, raw: &Value, default_id: Option<&str>) -> Branch {
        let id = raw.get("id").and_then(|v| v.as_str()).unwrap_or("");
        let display_id = raw.get("displayId").and_then(|v| v.as_str()).unwrap_or(id);
        Branch {
            project_key: project_key.to_string(),
            repo_slug: repo_slug.to_string(),
            branch_name: display_id.to_string(),
            data_source: self.data_source.clone(),
            is_default: default_id.map(|d| d == id).unwrap_or(false),
            last_commit_hash: raw.get("latestCommit").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            last_commit_date: None,
            last_checked_at: Utc::now(),
            version: stamp_version(),
        }
    }

    fn map_commit(&self, project_key: &str, repo_slug: &str, branch: &str, raw: &Value) -> (Commit, Vec<String>) {
        let hash = raw.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let parents: Vec<Value> = raw
            .get("parents")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let parent_ids: Vec<String> = parents
            .iter()
            .filter_map(|p| p.get("id").and_then(|v| v.as_str()).map(|s| s.to_string()))
            .collect();
        let parents_json = serde_json::to_string(&parent_ids).unwrap_or_else(|_| "[]".to_string());
        let author = raw.get("author");
        let committer = raw.get("committer").or(author);
        let date_ms = raw.get("authorTimestamp").and_then(|v| v.as_i64()).unwrap_or(0);
        let message = raw.get("message").and_then(|v| v.as_str()).unwrap_or("").to_string();

        let commit = Commit {
            project_key: project_key.to_string(),
            repo_slug: repo_slug.to_string(),
            commit_hash: hash,
            data_source: self.data_source.clone(),
            branch: branch.to_string(),
            author_name: author.and_then(|a| a.get("name")).and_then(|v| v.as_str()).unwrap_or("").to_string(),
            author_email: author.and_then(|a| a.get("emailAddress")).and_then(|v| v.as_str()).unwrap_or("").to_string(),
            committer_name: committer.and_then(|a| a.get("name")).and_then(|v| v.as_str()).unwrap_or("").to_string(),
            committer_email: committer.and_then(|a| a.get("emailAddress")).and_then(|v| v.as_str()).unwrap_or("").to_string(),
            message: message.clone(),
            date: Self::epoch_ms_to_datetime(date_ms),
            parents: parents_json,
            files_changed: 0,
            lines_added: 0,
            lines_removed: 0,
            is_merge_commit: parent_ids.len() > 1,
            language_breakdown: None,
            version: stamp_version(),
        };
        (commit, vec![message])
    }

    async fn fetch_commit_diff_files(&self, project_key: &str, repo_slug: &str, commit_hash: &str) -> Result<Vec<CommitFile>, AdapterError> {
        let path = format!("/projects/{}/repos/{}/commits/{}/diff", project_key, repo_slug, commit_hash);
        let body = self.get(&path, &[]).await?;
        let diffs = body.get("diffs").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let mut files = Vec::new();
        for d in diffs {
            let file_path = d
                .get("destination")
                .and_then(|v| v.get("toString"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let extension = file_path.rsplit('.').next().unwrap_or("").to_string();
            let mut added = 0i64;
            let mut removed = 0i64;
            if let Some(hunks) = d.get("hunks").and_then(|v| v.as_array()) {
                for hunk in hunks {
                    if let Some(segments) = hunk.get("segments").and_then(|v| v.as_array()) {
                        for seg in segments {
                            let seg_type = seg.get("type").and_then(|v| v.as_str()).unwrap_or("");
                            let lines = seg.get("lines").and_then(|v| v.as_array()).map(|a| a.len() as i64).unwrap_or(0);
                            match seg_type {
                                "ADDED" => added += lines,
                                "REMOVED" => removed += lines,
                                _ => {}
                            }
                        }
                    }
                }
            }
            let diff_hash = {
                let mut hasher = Sha256::new();
                hasher.update(d.to_string().as_bytes());
                hex::encode(hasher.finalize())
            };
            files.push(CommitFile {
                project_key: project_key.to_string(),
                repo_slug: repo_slug.to_string(),
                commit_hash: commit_hash.to_string(),
                file_path,
                data_source: self.data_source.clone(),
                diff_hash,
                extension,
                lines_added: added,
                lines_removed: removed,
                is_third_party: None,
                scancode_license: None,
                version: stamp_version(),
            });
        }
        Ok(files)
    }

    fn map_pr_state(raw: &str) -> PrState {
        match raw {
            "MERGED" => PrState::Merged,
            "DECLINED" => PrState::Declined,
            _ => PrState::Open,
        }
    }
}

#[async_trait]
impl SourceAdapter for BitbucketAdapter {
    fn data_source(&self) -> &str {
        &self.data_source
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities { supports_bulk: false }
    }

    async fn list_projects(&self, cancel: &CancellationToken) -> Result<Vec<ProjectRef>, AdapterError> {
        let mut out = Vec::new();
        drive_offset_pagination(
            OFFSET_PAGE_SIZE,
            |start, limit| async move {
                let body = self
                    .get("/projects", &[("start", start.to_string()), ("limit", limit.to_string())])
                    .await
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?;
                Ok(Self::to_offset_page(&body))
            },
            |_v| false,
            |v| {
                out.push(ProjectRef {
                    project_key: v.get("key").and_then(|k| k.as_str()).unwrap_or("").to_string(),
                    name: v.get("name").and_then(|k| k.as_str()).unwrap_or("").to_string(),
                });
            },
            cancel,
        )
        .await
        .map_err(|e| AdapterError::Permanent(e.to_string()))?;
        Ok(out)
    }

    async fn list_repositories(&self, project: &ProjectRef, cancel: &CancellationToken) -> Result<Vec<Repository>, AdapterError> {
        let mut out = Vec::new();
        let path = format!("/projects/{}/repos", project.project_key);
        drive_offset_pagination(
            OFFSET_PAGE_SIZE,
            |start, limit| async move {
                let body = self
                    .get(&path, &[("start", start.to_string()), ("limit", limit.to_string())])
                    .await
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?;
                Ok(Self::to_offset_page(&body))
            },
            |_v| false,
            |v| out.push(self.map_repository(&project.project_key, &v)),
            cancel,
        )
        .await
        .map_err(|e| AdapterError::Permanent(e.to_string()))?;
        Ok(out)
    }

    async fn list_branches(&self, project: &ProjectRef, repo: &Repository, cancel: &CancellationToken) -> Result<Vec<Branch>, AdapterError> {
        let default_path = format!("/projects/{}/repos/{}/branches/default", project.project_key, repo.repo_slug);
        let default_body = self.get(&default_path, &[]).await.ok();
        let default_id = default_body.as_ref().and_then(|b| b.get("id")).and_then(|v| v.as_str()).map(|s| s.to_string());

        let mut out = Vec::new();
        let path = format!("/projects/{}/repos/{}/branches", project.project_key, repo.repo_slug);
        drive_offset_pagination(
            OFFSET_PAGE_SIZE,
            |start, limit| async move {
                let body = self
                    .get(&path, &[("start", start.to_string()), ("limit", limit.to_string())])
                    .await
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?;
                Ok(Self::to_offset_page(&body))
            },
            |_v| false,
            |v| out.push(self.map_branch(&project.project_key, &repo.repo_slug, &v, default_id.as_deref())),
            cancel,
        )
        .await
        .map_err(|e| AdapterError::Permanent(e.to_string()))?;
        Ok(out)
    }

    async fn stream_commits(
        &self,
        project: &ProjectRef,
        repo: &Repository,
        branch: &str,
        since: Option<DateTime<Utc>>,
        on_commit: &mut dyn FnMut(CommitBundle),
        cancel: &CancellationToken,
    ) -> Result<CommitStreamStats, AdapterError> {
        let path = format!("/projects/{}/repos/{}/commits", project.project_key, repo.repo_slug);
        let mut emitted = 0u64;
        let since_ms = since.map(|d| d.timestamp_millis());
        let mut pending: Vec<CommitBundle> = Vec::new();

        let outcome = drive_offset_pagination(
            OFFSET_PAGE_SIZE,
            |start, limit| async move {
                let body = self
                    .get(
                        &path,
                        &[("start", start.to_string()), ("limit", limit.to_string()), ("until", branch.to_string())],
                    )
                    .await
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?;
                Ok(Self::to_offset_page(&body))
            },
            |v| {
                let ts = v.get("authorTimestamp").and_then(|x| x.as_i64()).unwrap_or(0);
                should_stop(&ts, &since_ms)
            },
            |v| {
                let (commit, texts) = self.map_commit(&project.project_key, &repo.repo_slug, branch, &v);
                let refs: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();
                let tickets = self
                    .jira
                    .extract(&refs)
                    .into_iter()
                    .map(|tid| Ticket::for_commit(&project.project_key, &repo.repo_slug, &self.data_source, &tid, &commit.commit_hash))
                    .collect();
                pending.push(CommitBundle { commit, files: Vec::new(), tickets });
            },
            cancel,
        )
        .await
        .map_err(|e| AdapterError::Permanent(e.to_string()))?;

        // Bitbucket Server never returns file stats with the commit list; a
        // required extra call per commit is the only way to get them.
        for mut bundle in pending {
            if cancel.is_cancelled() {
                break;
            }
            let files = self
                .fetch_commit_diff_files(&project.project_key, &repo.repo_slug, &bundle.commit.commit_hash)
                .await?;
            bundle.commit.files_changed = files.len() as i64;
            bundle.commit.lines_added = files.iter().map(|f| f.lines_added).sum();
            bundle.commit.lines_removed = files.iter().map(|f| f.lines_removed).sum();
            bundle.files = files;
            emitted += 1;
            on_commit(bundle);
        }

        Ok(CommitStreamStats {
            pages_fetched: outcome.pages,
            commits_emitted: emitted,
            stopped_early: outcome.stopped_early,
            cancelled: outcome.cancelled,
        })
    }

    async fn stream_pull_requests(
        &self,
        project: &ProjectRef,
        repo: &Repository,
        since: Option<DateTime<Utc>>,
        on_pr: &mut dyn FnMut(PrBundle),
        cancel: &CancellationToken,
    ) -> Result<PrStreamStats, AdapterError> {
        let path = format!("/projects/{}/repos/{}/pull-requests", project.project_key, repo.repo_slug);
        let since_ms = since.map(|d| d.timestamp_millis());
        let mut emitted = 0u64;

        let outcome = drive_offset_pagination(
            OFFSET_PAGE_SIZE,
            |start, limit| async move {
                let body = self
                    .get(
                        &path,
                        &[
                            ("start", start.to_string()),
                            ("limit", limit.to_string()),
                            ("state", "ALL".to_string()),
                            ("order", "NEWEST".to_string()),
                        ],
                    )
                    .await
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?;
                Ok(Self::to_offset_page(&body))
            },
            |v| {
                let updated = v.get("updatedDate").and_then(|x| x.as_i64()).unwrap_or(0);
                should_stop(&updated, &since_ms)
            },
            |v| {
                let pr_id = v.get("id").and_then(|x| x.as_i64()).unwrap_or(0);
                let title = v.get("title").and_then(|x| x.as_str()).unwrap_or("").to_string();
                let description = v.get("description").and_then(|x| x.as_str()).unwrap_or("").to_string();
                let state_raw = v.get("state").and_then(|x| x.as_str()).unwrap_or("OPEN");
                let created_on = Self::epoch_ms_to_datetime(v.get("createdDate").and_then(|x| x.as_i64()).unwrap_or(0));
                let updated_on = Self::epoch_ms_to_datetime(v.get("updatedDate").and_then(|x| x.as_i64()).unwrap_or(0));
                let closed_on = v.get("closedDate").and_then(|x| x.as_i64()).map(Self::epoch_ms_to_datetime);
                let author = v
                    .get("author")
                    .and_then(|a| a.get("user"))
                    .and_then(|u| u.get("name"))
                    .and_then(|n| n.as_str())
                    .unwrap_or("")
                    .to_string();
                let source_branch = v.get("fromRef").and_then(|r| r.get("displayId")).and_then(|d| d.as_str()).unwrap_or("").to_string();
                let destination_branch = v.get("toRef").and_then(|r| r.get("displayId")).and_then(|d| d.as_str()).unwrap_or("").to_string();

                let duration_seconds = PullRequest::duration_seconds(created_on, closed_on);
                let pull_request = PullRequest {
                    project_key: project.project_key.clone(),
                    repo_slug: repo.repo_slug.clone(),
                    pr_id,
                    data_source: self.data_source.clone(),
                    pr_number: pr_id,
                    title: title.clone(),
                    description: description.clone(),
                    state: Self::map_pr_state(state_raw),
                    author,
                    created_on,
                    updated_on,
                    closed_on,
                    merge_commit_hash: v.get("properties").and_then(|p| p.get("mergeCommit")).and_then(|m| m.get("id")).and_then(|i| i.as_str()).map(|s| s.to_string()),
                    source_branch,
                    destination_branch,
                    commit_count: 0,
                    comment_count: 0,
                    task_count: 0,
                    files_changed: 0,
                    lines_added: 0,
                    lines_removed: 0,
                    duration_seconds,
                    version: stamp_version(),
                };

                let reviewers: Vec<Reviewer> = v
                    .get("reviewers")
                    .and_then(|r| r.as_array())
                    .cloned()
                    .unwrap_or_default()
                    .iter()
                    .map(|r| {
                        let user = r.get("user");
                        let status = r.get("status").and_then(|s| s.as_str()).unwrap_or("").to_string();
                        Reviewer {
                            project_key: project.project_key.clone(),
                            repo_slug: repo.repo_slug.clone(),
                            pr_id,
                            reviewer_uuid: user.and_then(|u| u.get("name")).and_then(|n| n.as_str()).unwrap_or("").to_string(),
                            data_source: self.data_source.clone(),
                            name: user.and_then(|u| u.get("displayName")).and_then(|n| n.as_str()).unwrap_or("").to_string(),
                            email: user.and_then(|u| u.get("emailAddress")).and_then(|n| n.as_str()).map(|s| s.to_string()),
                            approved: Reviewer::derive_approved(&status),
                            status,
                            role: "REVIEWER".to_string(),
                            reviewed_at: None,
                            version: stamp_version(),
                        }
                    })
                    .collect();

                let jira_properties: Vec<&str> = v
                    .get("properties")
                    .and_then(|p| p.get("jira-key"))
                    .and_then(|k| k.as_array())
                    .map(|arr| arr.iter().filter_map(|x| x.as_str()).collect())
                    .unwrap_or_default();
                let texts = [title.as_str(), description.as_str()];
                let tickets = self
                    .jira
                    .extract_with_properties(&texts, &jira_properties)
                    .into_iter()
                    .map(|tid| Ticket::for_pr(&project.project_key, &repo.repo_slug, &self.data_source, &tid, pr_id))
                    .collect();

                emitted += 1;
                on_pr(PrBundle { pull_request, reviewers, comments: Vec::new(), commit_links: Vec::new(), tickets });
            },
            cancel,
        )
        .await
        .map_err(|e| AdapterError::Permanent(e.to_string()))?;

        Ok(PrStreamStats {
            pages_fetched: outcome.pages,
            prs_emitted: emitted,
            stopped_early: outcome.stopped_early,
            cancelled: outcome.cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::{ok_response, FakeTransport};
    use serde_json::json;

    fn adapter(responses: Vec<crate::adapters::HttpResponse>) -> BitbucketAdapter {
        BitbucketAdapter::new(
            "https://bitbucket.example.com/rest/api/1.0".to_string(),
            "insight_bitbucket_server".to_string(),
            Arc::new(FakeTransport::new(responses)),
            Arc::new(RateLimiter::new(3)),
        )
    }

    #[test]
    fn to_offset_page_reads_pagination_fields() {
        let body = json!({ "values": [{"a": 1}, {"a": 2}], "isLastPage": false, "nextPageStart": 2 });
        let page = BitbucketAdapter::to_offset_page(&body);
        assert_eq!(page.values.len(), 2);
        assert!(!page.is_last_page);
        assert_eq!(page.next_page_start, Some(2));
    }

    #[test]
    fn to_offset_page_defaults_to_last_page_when_field_missing() {
        let page = BitbucketAdapter::to_offset_page(&json!({ "values": [] }));
        assert!(page.is_last_page);
        assert_eq!(page.next_page_start, None);
    }

    #[test]
    fn map_pr_state_covers_all_three_states() {
        assert_eq!(BitbucketAdapter::map_pr_state("MERGED"), PrState::Merged);
        assert_eq!(BitbucketAdapter::map_pr_state("DECLINED"), PrState::Declined);
        assert_eq!(BitbucketAdapter::map_pr_state("OPEN"), PrState::Open);
    }

    #[tokio::test]
    async fn list_projects_maps_key_and_name() {
        let a = adapter(vec![ok_response(json!({
            "values": [{"key": "PLTFRM", "name": "Platform"}],
            "isLastPage": true,
        }))]);
        let projects = a.list_projects(&CancellationToken::new()).await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].project_key, "PLTFRM");
        assert_eq!(projects[0].name, "Platform");
    }

    #[tokio::test]
    async fn map_commit_extracts_parents_and_jira_ticket_from_message() {
        let a = adapter(vec![]);
        let raw = json!({
            "id": "abc123",
            "message": "PLTFRM-84867 fix: thing",
            "authorTimestamp": 1_700_000_000_000i64,
            "author": {"name": "alice", "emailAddress": "alice@example.com"},
            "parents": [{"id": "parent1"}],
        });
        let (commit, texts) = a.map_commit("PLTFRM", "repo", "main", &raw);
        assert_eq!(commit.commit_hash, "abc123");
        assert_eq!(commit.author_name, "alice");
        assert!(!commit.is_merge_commit);
        assert!(commit.parents.contains("parent1"));
        let refs: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();
        assert_eq!(a.jira.extract(&refs), vec!["PLTFRM-84867"]);
    }

    #[tokio::test]
    async fn stream_commits_stops_at_watermark() {
        let a = adapter(vec![
            ok_response(json!({
                "values": [
                    {"id": "new", "authorTimestamp": 2_000_000_000_000i64, "message": "new commit"},
                    {"id": "old", "authorTimestamp": 1_000_000_000_000i64, "message": "old commit"},
                ],
                "isLastPage": true,
            })),
            ok_response(json!({ "diffs": [] })),
        ]);
        let project = ProjectRef { project_key: "PLTFRM".to_string(), name: "Platform".to_string() };
        let repo = a.map_repository("PLTFRM", &json!({"slug": "svc", "name": "svc"}));
        let since = DateTime::from_timestamp_millis(1_500_000_000_000).unwrap();
        let mut seen = Vec::new();
        let stats = a
            .stream_commits(
                &project,
                &repo,
                "main",
                Some(since),
                &mut |b| seen.push(b.commit.commit_hash),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(seen, vec!["new".to_string()]);
        assert_eq!(stats.commits_emitted, 1);
        assert!(stats.stopped_early);
        assert!(!stats.cancelled);
    }

    #[tokio::test]
    async fn stream_commits_does_not_report_stopped_early_when_watermark_never_triggers() {
        let a = adapter(vec![
            ok_response(json!({
                "values": [
                    {"id": "new", "authorTimestamp": 2_000_000_000_000i64, "message": "new commit"},
                ],
                "isLastPage": true,
            })),
            ok_response(json!({ "diffs": [] })),
        ]);
        let project = ProjectRef { project_key: "PLTFRM".to_string(), name: "Platform".to_string() };
        let repo = a.map_repository("PLTFRM", &json!({"slug": "svc", "name": "svc"}));
        let since = DateTime::from_timestamp_millis(1_000_000_000_000).unwrap();
        let mut seen = Vec::new();
        let stats = a
            .stream_commits(
                &project,
                &repo,
                "main",
                Some(since),
                &mut |b| seen.push(b.commit.commit_hash),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(seen, vec!["new".to_string()]);
        assert!(!stats.stopped_early, "pagination exhausted naturally, the watermark was never crossed");
        assert!(!stats.cancelled);
    }
}
