//! GitHub REST v3 + GraphQL v4 adapter. A single org is
//! the only "project" GitHub exposes to this model. Bulk (GraphQL, nested
//! reviews/comments/commits in one round trip) is preferred whenever a token
//! is configured and `use_graphql` is set; otherwise every adapter method
//! falls back to a REST list call plus per-item detail calls. The switch is
//! internal to this module — `SourceAdapter` callers never see which path ran.

use super::{
    AdapterCapabilities, CommitBundle, CommitStreamStats, HttpTransport, PrBundle, PrCommitLink, PrComment,
    PrStreamStats, ProjectRef, SourceAdapter,
};
use crate::error::AdapterError;
use crate::jira::JiraExtractor;
use crate::models::*;
use crate::paginator::{drive_cursor_pagination, drive_offset_pagination, should_stop, CursorPage, OffsetPage, COMMIT_CURSOR_PAGE_SIZE, OFFSET_PAGE_SIZE, PR_CURSOR_PAGE_SIZE_MAX};
use crate::rate_limiter::{RateLimiter, ResponseSignal};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct GithubAdapter {
    rest_base: String,
    graphql_url: String,
    org: String,
    data_source: String,
    use_graphql: bool,
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
    jira: JiraExtractor,
}

impl GithubAdapter {
    pub fn new(
        rest_base: String,
        org: String,
        data_source: String,
        use_graphql: bool,
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let rest_base = rest_base.trim_end_matches('/').to_string();
        let graphql_url = format!("{}/graphql", rest_base.trim_end_matches("/v3"));
        Self { rest_base, graphql_url, org, data_source, use_graphql, transport, limiter, jira: JiraExtractor::new() }
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, AdapterError> {
        let url = format!("{}{}", self.rest_base, path);
        let transport = Arc::clone(&self.transport);
        let query_owned: Vec<(String, String)> = query.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        let signal = self
            .limiter
            .call(|| {
                let transport = Arc::clone(&transport);
                let url = url.clone();
                let query_owned = query_owned.clone();
                async move {
                    let query_refs: Vec<(&str, String)> = query_owned.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
                    let resp = transport.get(&url, &query_refs).await.map_err(|e| AdapterError::Transient(e.to_string()))?;
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

    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, AdapterError> {
        let url = self.graphql_url.clone();
        let transport = Arc::clone(&self.transport);
        let payload = json!({ "query": query, "variables": variables });
        let signal = self
            .limiter
            .call(|| {
                let transport = Arc::clone(&transport);
                let url = url.clone();
                let payload = payload.clone();
                async move {
                    let resp = transport.post_json(&url, payload).await.map_err(|e| AdapterError::Transient(e.to_string()))?;
                    Ok(ResponseSignal {
                        status: resp.status,
                        remaining: resp.rate_limit_remaining,
                        reset_unix: resp.rate_limit_reset,
                        graphql_rate_limited: resp.is_rate_limited_graphql(),
                        graphql_error_message: resp
                            .graphql_errors
                            .as_ref()
                            .filter(|e| !e.is_empty() && !resp.is_rate_limited_graphql())
                            .map(|e| e.join("; ")),
                        body: resp.body,
                    })
                }
            })
            .await?;
        Ok(signal.body)
    }

    fn bulk(&self) -> bool {
        self.use_graphql
    }

    /// GitHub's classic REST pagination has no `isLastPage` field: a page
    /// shorter than the requested size is the last one.
    fn to_rest_page(body: &Value, start: u64, page_size: u32) -> OffsetPage {
        let values = body.as_array().cloned().unwrap_or_default();
        let is_last_page = values.len() < page_size as usize;
        OffsetPage { values, is_last_page, next_page_start: if is_last_page { None } else { Some(start + 1) } }
    }

    fn to_cursor_page(body: &Value, nodes_path: &[&str]) -> CursorPage {
        let mut cursor_obj = body.get("data");
        for key in nodes_path {
            cursor_obj = cursor_obj.and_then(|v| v.get(key));
        }
        let obj = cursor_obj.cloned().unwrap_or(Value::Null);
        let nodes = obj.get("nodes").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let page_info = obj.get("pageInfo");
        let has_next_page = page_info.and_then(|p| p.get("hasNextPage")).and_then(|v| v.as_bool()).unwrap_or(false);
        let end_cursor = page_info.and_then(|p| p.get("endCursor")).and_then(|v| v.as_str()).map(|s| s.to_string());
        CursorPage { nodes, has_next_page, end_cursor }
    }

    fn map_repository(&self, raw: &Value) -> Repository {
        let now = Utc::now();
        Repository {
            project_key: self.org.clone(),
            repo_slug: raw.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            data_source: self.data_source.clone(),
            name: raw.get("full_name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            uuid: raw.get("node_id").and_then(|v| v.as_str()).map(|s| s.to_string()),
            is_private: raw.get("private").and_then(|v| v.as_bool()).unwrap_or(false),
            size: raw.get("size").and_then(|v| v.as_i64()),
            language: raw.get("language").and_then(|v| v.as_str()).map(|s| s.to_string()),
            has_issues: raw.get("has_issues").and_then(|v| v.as_bool()),
            has_wiki: raw.get("has_wiki").and_then(|v| v.as_bool()),
            fork_policy: None,
            is_empty: raw.get("size").and_then(|v| v.as_i64()).map(|s| s == 0).unwrap_or(false),
            last_commit_date: None,
            first_seen: now,
            last_updated: now,
            version: stamp_version(),
        }
    }

    fn map_branch(&self, repo_slug: &str, raw: &Value, default_branch: &str) -> Branch {
        let name = raw.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
        Branch {
            project_key: self.org.clone(),
            repo_slug: repo_slug.to_string(),
            is_default: name == default_branch,
            last_commit_hash: raw.get("commit").and_then(|c| c.get("sha")).and_then(|v| v.as_str()).unwrap_or("").to_string(),
            branch_name: name,
            data_source: self.data_source.clone(),
            last_commit_date: None,
            last_checked_at: Utc::now(),
            version: stamp_version(),
        }
    }

    /// REST stores `parents` as SHA strings, GraphQL stores them as `{oid}`
    /// objects; both normalize to a flat JSON array of ids.
    fn map_commit_rest(&self, repo_slug: &str, branch: &str, raw: &Value) -> (Commit, Vec<String>) {
        let sha = raw.get("sha").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let commit = raw.get("commit").cloned().unwrap_or(Value::Null);
        let author = commit.get("author");
        let committer = commit.get("committer").or(author);
        let message = commit.get("message").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let date = author
            .and_then(|a| a.get("date"))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
            .unwrap_or_else(Utc::now);
        let parent_ids: Vec<String> = raw
            .get("parents")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
            .iter()
            .filter_map(|p| p.get("sha").and_then(|v| v.as_str()).map(|s| s.to_string()))
            .collect();
        let parents_json = serde_json::to_string(&parent_ids).unwrap_or_else(|_| "[]".to_string());
        let (files_changed, lines_added, lines_removed) = Self::stats_from(raw);
        let built = Commit {
            project_key: self.org.clone(),
            repo_slug: repo_slug.to_string(),
            commit_hash: sha,
            data_source: self.data_source.clone(),
            branch: branch.to_string(),
            author_name: author.and_then(|a| a.get("name")).and_then(|v| v.as_str()).unwrap_or("").to_string(),
            author_email: author.and_then(|a| a.get("email")).and_then(|v| v.as_str()).unwrap_or("").to_string(),
            committer_name: committer.and_then(|a| a.get("name")).and_then(|v| v.as_str()).unwrap_or("").to_string(),
            committer_email: committer.and_then(|a| a.get("email")).and_then(|v| v.as_str()).unwrap_or("").to_string(),
            message: message.clone(),
            date,
            parents: parents_json,
            files_changed,
            lines_added,
            lines_removed,
            is_merge_commit: parent_ids.len() > 1,
            language_breakdown: None,
            version: stamp_version(),
        };
        (built, vec![message])
    }

    fn map_commit_graphql(&self, repo_slug: &str, branch: &str, raw: &Value) -> (Commit, Vec<String>) {
        let oid = raw.get("oid").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let author = raw.get("author");
        let message = raw.get("message").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let date = raw
            .get("committedDate")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
            .unwrap_or_else(Utc::now);
        let parent_ids: Vec<String> = raw
            .get("parents")
            .and_then(|p| p.get("nodes"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
            .iter()
            .filter_map(|p| p.get("oid").and_then(|v| v.as_str()).map(|s| s.to_string()))
            .collect();
        let parents_json = serde_json::to_string(&parent_ids).unwrap_or_else(|_| "[]".to_string());
        let author_user = author.and_then(|a| a.get("user"));
        let commit = Commit {
            project_key: self.org.clone(),
            repo_slug: repo_slug.to_string(),
            commit_hash: oid,
            data_source: self.data_source.clone(),
            branch: branch.to_string(),
            author_name: author.and_then(|a| a.get("name")).and_then(|v| v.as_str()).unwrap_or("").to_string(),
            author_email: author.and_then(|a| a.get("email")).and_then(|v| v.as_str()).unwrap_or("").to_string(),
            committer_name: author_user.and_then(|u| u.get("login")).and_then(|v| v.as_str()).unwrap_or("").to_string(),
            committer_email: String::new(),
            message: message.clone(),
            date,
            parents: parents_json,
            files_changed: raw.get("changedFilesIfAvailable").and_then(|v| v.as_i64()).unwrap_or(0),
            lines_added: raw.get("additions").and_then(|v| v.as_i64()).unwrap_or(0),
            lines_removed: raw.get("deletions").and_then(|v| v.as_i64()).unwrap_or(0),
            is_merge_commit: parent_ids.len() > 1,
            language_breakdown: None,
            version: stamp_version(),
        };
        (commit, vec![message])
    }

    fn stats_from(raw: &Value) -> (i64, i64, i64) {
        let stats = raw.get("stats");
        let added = stats.and_then(|s| s.get("additions")).and_then(|v| v.as_i64()).unwrap_or(0);
        let removed = stats.and_then(|s| s.get("deletions")).and_then(|v| v.as_i64()).unwrap_or(0);
        let files = raw.get("files").and_then(|v| v.as_array()).map(|a| a.len() as i64).unwrap_or(0);
        (files, added, removed)
    }

    /// `merged=true` wins over `state`; otherwise map OPEN/CLOSED directly.
    fn map_pr_state(merged: bool, state: &str) -> PrState {
        if merged {
            return PrState::Merged;
        }
        match state.to_uppercase().as_str() {
            "CLOSED" => PrState::Closed,
            _ => PrState::Open,
        }
    }

    fn parse_dt(v: Option<&Value>) -> Option<DateTime<Utc>> {
        v.and_then(|v| v.as_str()).and_then(|s| s.parse::<DateTime<Utc>>().ok())
    }

    fn map_pr_rest(&self, repo_slug: &str, raw: &Value) -> PullRequest {
        let pr_id = raw.get("id").and_then(|v| v.as_i64()).unwrap_or(0);
        let pr_number = raw.get("number").and_then(|v| v.as_i64()).unwrap_or(0);
        let title = raw.get("title").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let created_on = Self::parse_dt(raw.get("created_at")).unwrap_or_else(Utc::now);
        let updated_on = Self::parse_dt(raw.get("updated_at")).unwrap_or(created_on);
        let closed_on = Self::parse_dt(raw.get("closed_at"));
        let merged = raw.get("merged_at").map(|v| !v.is_null()).unwrap_or(false);
        let state_raw = raw.get("state").and_then(|v| v.as_str()).unwrap_or("open");
        PullRequest {
            project_key: self.org.clone(),
            repo_slug: repo_slug.to_string(),
            pr_id,
            data_source: self.data_source.clone(),
            pr_number,
            title,
            description: raw.get("body").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            state: Self::map_pr_state(merged, state_raw),
            author: raw.get("user").and_then(|u| u.get("login")).and_then(|v| v.as_str()).unwrap_or("").to_string(),
            created_on,
            updated_on,
            closed_on,
            merge_commit_hash: raw.get("merge_commit_sha").and_then(|v| v.as_str()).map(|s| s.to_string()),
            source_branch: raw.get("head").and_then(|h| h.get("ref")).and_then(|v| v.as_str()).unwrap_or("").to_string(),
            destination_branch: raw.get("base").and_then(|b| b.get("ref")).and_then(|v| v.as_str()).unwrap_or("").to_string(),
            commit_count: raw.get("commits").and_then(|v| v.as_i64()).unwrap_or(0),
            comment_count: raw.get("comments").and_then(|v| v.as_i64()).unwrap_or(0),
            task_count: 0,
            files_changed: raw.get("changed_files").and_then(|v| v.as_i64()).unwrap_or(0),
            lines_added: raw.get("additions").and_then(|v| v.as_i64()).unwrap_or(0),
            lines_removed: raw.get("deletions").and_then(|v| v.as_i64()).unwrap_or(0),
            duration_seconds: PullRequest::duration_seconds(created_on, closed_on),
            version: stamp_version(),
        }
    }

    fn map_pr_graphql(&self, repo_slug: &str, raw: &Value) -> PullRequest {
        let pr_id = raw.get("databaseId").and_then(|v| v.as_i64()).unwrap_or(0);
        let pr_number = raw.get("number").and_then(|v| v.as_i64()).unwrap_or(0);
        let created_on = Self::parse_dt(raw.get("createdAt")).unwrap_or_else(Utc::now);
        let updated_on = Self::parse_dt(raw.get("updatedAt")).unwrap_or(created_on);
        let closed_on = Self::parse_dt(raw.get("closedAt"));
        let merged = raw.get("merged").and_then(|v| v.as_bool()).unwrap_or(false);
        let state_raw = raw.get("state").and_then(|v| v.as_str()).unwrap_or("OPEN");
        PullRequest {
            project_key: self.org.clone(),
            repo_slug: repo_slug.to_string(),
            pr_id,
            data_source: self.data_source.clone(),
            pr_number,
            title: raw.get("title").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            description: raw.get("body").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            state: Self::map_pr_state(merged, state_raw),
            author: raw.get("author").and_then(|a| a.get("login")).and_then(|v| v.as_str()).unwrap_or("").to_string(),
            created_on,
            updated_on,
            closed_on,
            merge_commit_hash: raw.get("mergeCommit").and_then(|m| m.get("oid")).and_then(|v| v.as_str()).map(|s| s.to_string()),
            source_branch: raw.get("headRefName").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            destination_branch: raw.get("baseRefName").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            commit_count: raw
                .get("commits")
                .and_then(|c| c.get("totalCount"))
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            comment_count: raw
                .get("comments")
                .and_then(|c| c.get("totalCount"))
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            task_count: 0,
            files_changed: raw.get("changedFiles").and_then(|v| v.as_i64()).unwrap_or(0),
            lines_added: raw.get("additions").and_then(|v| v.as_i64()).unwrap_or(0),
            lines_removed: raw.get("deletions").and_then(|v| v.as_i64()).unwrap_or(0),
            duration_seconds: PullRequest::duration_seconds(created_on, closed_on),
            version: stamp_version(),
        }
    }

    /// `approved` is case-insensitive; GitHub's review API sometimes
    /// lowercases `state`.
    fn map_reviewer_rest(&self, repo_slug: &str, pr_id: i64, raw: &Value) -> Reviewer {
        let login = raw.get("user").and_then(|u| u.get("login")).and_then(|v| v.as_str()).unwrap_or("").to_string();
        let status = raw.get("state").and_then(|v| v.as_str()).unwrap_or("").to_string();
        Reviewer {
            project_key: self.org.clone(),
            repo_slug: repo_slug.to_string(),
            pr_id,
            reviewer_uuid: login.clone(),
            data_source: self.data_source.clone(),
            name: login,
            email: None,
            approved: Reviewer::derive_approved(&status),
            status,
            role: "REVIEWER".to_string(),
            reviewed_at: Self::parse_dt(raw.get("submitted_at")),
            version: stamp_version(),
        }
    }

    fn map_reviewer_graphql(&self, repo_slug: &str, pr_id: i64, raw: &Value) -> Reviewer {
        let login = raw.get("author").and_then(|a| a.get("login")).and_then(|v| v.as_str()).unwrap_or("").to_string();
        let status = raw.get("state").and_then(|v| v.as_str()).unwrap_or("").to_string();
        Reviewer {
            project_key: self.org.clone(),
            repo_slug: repo_slug.to_string(),
            pr_id,
            reviewer_uuid: login.clone(),
            data_source: self.data_source.clone(),
            name: login,
            email: None,
            approved: Reviewer::derive_approved(&status),
            status,
            role: "REVIEWER".to_string(),
            reviewed_at: Self::parse_dt(raw.get("submittedAt")),
            version: stamp_version(),
        }
    }

    fn map_comment_rest(&self, repo_slug: &str, pr_id: i64, raw: &Value) -> PrComment {
        PrComment {
            project_key: self.org.clone(),
            repo_slug: repo_slug.to_string(),
            pr_id,
            comment_id: raw.get("id").and_then(|v| v.as_i64()).unwrap_or(0),
            data_source: self.data_source.clone(),
            content: raw.get("body").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            author: raw.get("user").and_then(|u| u.get("login")).and_then(|v| v.as_str()).unwrap_or("").to_string(),
            created_at: Self::parse_dt(raw.get("created_at")).unwrap_or_else(Utc::now),
            updated_at: Self::parse_dt(raw.get("updated_at")),
            state: None,
            severity: None,
            thread_resolved: None,
            file_path: raw.get("path").and_then(|v| v.as_str()).map(|s| s.to_string()),
            line_number: raw.get("line").and_then(|v| v.as_i64()),
            version: stamp_version(),
        }
    }
}

#[async_trait]
impl SourceAdapter for GithubAdapter {
    fn data_source(&self) -> &str {
        &self.data_source
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities { supports_bulk: self.use_graphql }
    }

    /// GitHub has no project concept in this model; the configured org is
    /// the sole virtual project.
    async fn list_projects(&self, _cancel: &CancellationToken) -> Result<Vec<ProjectRef>, AdapterError> {
        Ok(vec![ProjectRef { project_key: self.org.clone(), name: self.org.clone() }])
    }

    async fn list_repositories(&self, _project: &ProjectRef, cancel: &CancellationToken) -> Result<Vec<Repository>, AdapterError> {
        let mut out = Vec::new();
        let path = format!("/orgs/{}/repos", self.org);
        drive_offset_pagination(
            OFFSET_PAGE_SIZE,
            |start, limit| async move {
                let page_num = start + 1;
                let body = self
                    .get(&path, &[("page", page_num.to_string()), ("per_page", limit.to_string())])
                    .await
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?;
                Ok(Self::to_rest_page(&body, start, limit))
            },
            |_v| false,
            |v| out.push(self.map_repository(&v)),
            cancel,
        )
        .await
        .map_err(|e| AdapterError::Permanent(e.to_string()))?;
        Ok(out)
    }

    async fn list_branches(&self, _project: &ProjectRef, repo: &Repository, cancel: &CancellationToken) -> Result<Vec<Branch>, AdapterError> {
        let repo_body = self.get(&format!("/repos/{}/{}", self.org, repo.repo_slug), &[]).await?;
        let default_branch = repo_body.get("default_branch").and_then(|v| v.as_str()).unwrap_or("main").to_string();

        let mut out = Vec::new();
        let path = format!("/repos/{}/{}/branches", self.org, repo.repo_slug);
        drive_offset_pagination(
            OFFSET_PAGE_SIZE,
            |start, limit| async move {
                let page_num = start + 1;
                let body = self
                    .get(&path, &[("page", page_num.to_string()), ("per_page", limit.to_string())])
                    .await
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?;
                Ok(Self::to_rest_page(&body, start, limit))
            },
            |_v| false,
            |v| out.push(self.map_branch(&repo.repo_slug, &v, &default_branch)),
            cancel,
        )
        .await
        .map_err(|e| AdapterError::Permanent(e.to_string()))?;
        Ok(out)
    }

    async fn stream_commits(
        &self,
        _project: &ProjectRef,
        repo: &Repository,
        branch: &str,
        since: Option<DateTime<Utc>>,
        on_commit: &mut dyn FnMut(CommitBundle),
        cancel: &CancellationToken,
    ) -> Result<CommitStreamStats, AdapterError> {
        let mut emitted = 0u64;

        if self.bulk() {
            let query = r#"
                query($owner: String!, $name: String!, $qualifiedName: String!, $first: Int!, $after: String) {
                  repository(owner: $owner, name: $name) {
                    ref(qualifiedName: $qualifiedName) {
                      target { ... on Commit {
                        history(first: $first, after: $after) {
                          pageInfo { hasNextPage endCursor }
                          nodes { oid message committedDate additions deletions changedFilesIfAvailable
                                   author { name email user { login } }
                                   parents(first: 10) { nodes { oid } } }
                        }
                      } }
                    }
                  }
                }"#;
            let owner = self.org.clone();
            let name = repo.repo_slug.clone();
            let qualified = format!("refs/heads/{}", branch);

            let outcome = drive_cursor_pagination(
                COMMIT_CURSOR_PAGE_SIZE,
                |cursor, first| async move {
                    let vars = json!({ "owner": owner, "name": name, "qualifiedName": qualified, "first": first, "after": cursor });
                    let body = self.graphql(query, vars).await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
                    Ok(Self::to_cursor_page(&body, &["repository", "ref", "target", "history"]))
                },
                |v| {
                    let ts = v
                        .get("committedDate")
                        .and_then(|x| x.as_str())
                        .and_then(|s| s.parse::<DateTime<Utc>>().ok())
                        .unwrap_or_else(Utc::now);
                    should_stop(&ts, &since)
                },
                |v| {
                    let (commit, texts) = self.map_commit_graphql(&repo.repo_slug, branch, &v);
                    let refs: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();
                    let tickets = self
                        .jira
                        .extract(&refs)
                        .into_iter()
                        .map(|tid| Ticket::for_commit(&self.org, &repo.repo_slug, &self.data_source, &tid, &commit.commit_hash))
                        .collect();
                    emitted += 1;
                    on_commit(CommitBundle { commit, files: Vec::new(), tickets });
                },
                cancel,
            )
            .await
            .map_err(|e| AdapterError::Permanent(e.to_string()))?;

            return Ok(CommitStreamStats {
                pages_fetched: outcome.pages,
                commits_emitted: emitted,
                stopped_early: outcome.stopped_early,
                cancelled: outcome.cancelled,
            });
        }

        let path = format!("/repos/{}/{}/commits", self.org, repo.repo_slug);
        let outcome = drive_offset_pagination(
            OFFSET_PAGE_SIZE,
            |start, limit| async move {
                let page_num = start + 1;
                let body = self
                    .get(&path, &[("sha", branch.to_string()), ("page", page_num.to_string()), ("per_page", limit.to_string())])
                    .await
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?;
                Ok(Self::to_rest_page(&body, start, limit))
            },
            |v| {
                let ts = v
                    .get("commit")
                    .and_then(|c| c.get("author"))
                    .and_then(|a| a.get("date"))
                    .and_then(|x| x.as_str())
                    .and_then(|s| s.parse::<DateTime<Utc>>().ok())
                    .unwrap_or_else(Utc::now);
                should_stop(&ts, &since)
            },
            |v| {
                let (commit, texts) = self.map_commit_rest(&repo.repo_slug, branch, &v);
                let refs: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();
                let tickets = self
                    .jira
                    .extract(&refs)
                    .into_iter()
                    .map(|tid| Ticket::for_commit(&self.org, &repo.repo_slug, &self.data_source, &tid, &commit.commit_hash))
                    .collect();
                emitted += 1;
                on_commit(CommitBundle { commit, files: Vec::new(), tickets });
            },
            cancel,
        )
        .await
        .map_err(|e| AdapterError::Permanent(e.to_string()))?;

        Ok(CommitStreamStats {
            pages_fetched: outcome.pages,
            commits_emitted: emitted,
            stopped_early: outcome.stopped_early,
            cancelled: outcome.cancelled,
        })
    }

    async fn stream_pull_requests(
        &self,
        _project: &ProjectRef,
        repo: &Repository,
        since: Option<DateTime<Utc>>,
        on_pr: &mut dyn FnMut(PrBundle),
        cancel: &CancellationToken,
    ) -> Result<PrStreamStats, AdapterError> {
        let mut emitted = 0u64;

        if self.bulk() {
            let query = r#"
                query($owner: String!, $name: String!, $first: Int!, $after: String) {
                  repository(owner: $owner, name: $name) {
                    pullRequests(first: $first, after: $after, orderBy: { field: UPDATED_AT, direction: DESC }) {
                      pageInfo { hasNextPage endCursor }
                      nodes {
                        databaseId number title body state merged createdAt updatedAt closedAt
                        headRefName baseRefName additions deletions changedFiles
                        author { login }
                        mergeCommit { oid }
                        commits { totalCount }
                        comments { totalCount }
                        reviews(first: 50) { nodes { author { login } state submittedAt } }
                      }
                    }
                  }
                }"#;
            let owner = self.org.clone();
            let name = repo.repo_slug.clone();

            let outcome = drive_cursor_pagination(
                PR_CURSOR_PAGE_SIZE_MAX,
                |cursor, first| async move {
                    let vars = json!({ "owner": owner, "name": name, "first": first, "after": cursor });
                    let body = self.graphql(query, vars).await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
                    Ok(Self::to_cursor_page(&body, &["repository", "pullRequests"]))
                },
                |v| {
                    let ts = v
                        .get("updatedAt")
                        .and_then(|x| x.as_str())
                        .and_then(|s| s.parse::<DateTime<Utc>>().ok())
                        .unwrap_or_else(Utc::now);
                    should_stop(&ts, &since)
                },
                |v| {
                    let pull_request = self.map_pr_graphql(&repo.repo_slug, &v);
                    let pr_id = pull_request.pr_id;
                    let reviewers: Vec<Reviewer> = v
                        .get("reviews")
                        .and_then(|r| r.get("nodes"))
                        .and_then(|n| n.as_array())
                        .cloned()
                        .unwrap_or_default()
                        .iter()
                        .map(|r| self.map_reviewer_graphql(&repo.repo_slug, pr_id, r))
                        .collect();
                    let texts = [pull_request.title.as_str(), pull_request.description.as_str()];
                    let tickets = self
                        .jira
                        .extract(&texts)
                        .into_iter()
                        .map(|tid| Ticket::for_pr(&self.org, &repo.repo_slug, &self.data_source, &tid, pr_id))
                        .collect();
                    emitted += 1;
                    on_pr(PrBundle { pull_request, reviewers, comments: Vec::new(), commit_links: Vec::new(), tickets });
                },
                cancel,
            )
            .await
            .map_err(|e| AdapterError::Permanent(e.to_string()))?;

            return Ok(PrStreamStats {
                pages_fetched: outcome.pages,
                prs_emitted: emitted,
                stopped_early: outcome.stopped_early,
                cancelled: outcome.cancelled,
            });
        }

        let path = format!("/repos/{}/{}/pulls", self.org, repo.repo_slug);
        let mut pending: Vec<PrBundle> = Vec::new();
        let outcome = drive_offset_pagination(
            OFFSET_PAGE_SIZE,
            |start, limit| async move {
                let page_num = start + 1;
                let body = self
                    .get(
                        &path,
                        &[
                            ("state", "all".to_string()),
                            ("sort", "updated".to_string()),
                            ("direction", "desc".to_string()),
                            ("page", page_num.to_string()),
                            ("per_page", limit.to_string()),
                        ],
                    )
                    .await
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?;
                Ok(Self::to_rest_page(&body, start, limit))
            },
            |v| {
                let ts = v
                    .get("updated_at")
                    .and_then(|x| x.as_str())
                    .and_then(|s| s.parse::<DateTime<Utc>>().ok())
                    .unwrap_or_else(Utc::now);
                should_stop(&ts, &since)
            },
            |v| {
                let pull_request = self.map_pr_rest(&repo.repo_slug, &v);
                let pr_id = pull_request.pr_id;
                let texts = [pull_request.title.as_str(), pull_request.description.as_str()];
                let tickets = self
                    .jira
                    .extract(&texts)
                    .into_iter()
                    .map(|tid| Ticket::for_pr(&self.org, &repo.repo_slug, &self.data_source, &tid, pr_id))
                    .collect();
                pending.push(PrBundle { pull_request, reviewers: Vec::new(), comments: Vec::new(), commit_links: Vec::new(), tickets });
            },
            cancel,
        )
        .await
        .map_err(|e| AdapterError::Permanent(e.to_string()))?;

        for mut bundle in pending {
            if cancel.is_cancelled() {
                break;
            }
            let pr_id = bundle.pull_request.pr_id;
            let (reviewers, comments, commit_links) = self
                .fetch_pr_details_rest(&repo.repo_slug, bundle.pull_request.pr_number, pr_id)
                .await?;
            bundle.reviewers = reviewers;
            bundle.comments = comments;
            bundle.commit_links = commit_links;
            emitted += 1;
            on_pr(bundle);
        }

        Ok(PrStreamStats {
            pages_fetched: outcome.pages,
            prs_emitted: emitted,
            stopped_early: outcome.stopped_early,
            cancelled: outcome.cancelled,
        })
    }
}

impl GithubAdapter {
    /// Per-item fallback detail calls the REST path makes once a PR is
    /// known: reviews, review comments, and commit shas.
    pub async fn fetch_pr_details_rest(&self, repo_slug: &str, pr_number: i64, pr_id: i64) -> Result<(Vec<Reviewer>, Vec<PrComment>, Vec<PrCommitLink>), AdapterError> {
        let reviews_body = self
            .get(&format!("/repos/{}/{}/pulls/{}/reviews", self.org, repo_slug, pr_number), &[])
            .await?;
        let reviewers = reviews_body
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .map(|r| self.map_reviewer_rest(repo_slug, pr_id, r))
            .collect();

        let comments_body = self
            .get(&format!("/repos/{}/{}/pulls/{}/comments", self.org, repo_slug, pr_number), &[])
            .await?;
        let comments = comments_body
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .map(|c| self.map_comment_rest(repo_slug, pr_id, c))
            .collect();

        let commits_body = self
            .get(&format!("/repos/{}/{}/pulls/{}/commits", self.org, repo_slug, pr_number), &[])
            .await?;
        let commit_links = commits_body
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(i, c)| PrCommitLink {
                project_key: self.org.clone(),
                repo_slug: repo_slug.to_string(),
                pr_id,
                commit_hash: c.get("sha").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                data_source: self.data_source.clone(),
                commit_order: i as i64,
                version: stamp_version(),
            })
            .collect();

        Ok((reviewers, comments, commit_links))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::{ok_response, FakeTransport};

    fn adapter(use_graphql: bool, responses: Vec<crate::adapters::HttpResponse>) -> GithubAdapter {
        GithubAdapter::new(
            "https://api.github.com".to_string(),
            "my-org".to_string(),
            "insight_github".to_string(),
            use_graphql,
            Arc::new(FakeTransport::new(responses)),
            Arc::new(RateLimiter::new(3)),
        )
    }

    #[test]
    fn map_pr_state_prefers_merged_over_raw_state() {
        assert_eq!(GithubAdapter::map_pr_state(true, "closed"), PrState::Merged);
        assert_eq!(GithubAdapter::map_pr_state(false, "closed"), PrState::Closed);
        assert_eq!(GithubAdapter::map_pr_state(false, "open"), PrState::Open);
    }

    #[test]
    fn to_rest_page_treats_short_page_as_last() {
        let body = json!([{"a": 1}, {"a": 2}]);
        let page = GithubAdapter::to_rest_page(&body, 0, 100);
        assert!(page.is_last_page);
        assert_eq!(page.next_page_start, None);

        let full = json!((0..100).map(|i| json!({"a": i})).collect::<Vec<_>>());
        let page2 = GithubAdapter::to_rest_page(&full, 0, 100);
        assert!(!page2.is_last_page);
        assert_eq!(page2.next_page_start, Some(1));
    }

    #[tokio::test]
    async fn list_projects_is_a_single_virtual_org_project() {
        let a = adapter(false, vec![]);
        let projects = a.list_projects(&CancellationToken::new()).await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].project_key, "my-org");
    }

    #[tokio::test]
    async fn graphql_pr_merge_scenario_maps_databaseId_and_duration() {
        let a = adapter(true, vec![ok_response(json!({
            "data": {
                "repository": {
                    "pullRequests": {
                        "pageInfo": { "hasNextPage": false, "endCursor": null },
                        "nodes": [{
                            "databaseId": 3018797339i64,
                            "number": 4,
                            "title": "PLTFRM-84867 feat: cli",
                            "body": "",
                            "state": "MERGED",
                            "merged": true,
                            "createdAt": "2025-11-17T19:45:14Z",
                            "updatedAt": "2025-11-22T10:07:07Z",
                            "closedAt": "2025-11-22T10:07:07Z",
                            "headRefName": "feature",
                            "baseRefName": "main",
                            "additions": 10,
                            "deletions": 2,
                            "changedFiles": 3,
                            "author": {"login": "alice"},
                            "mergeCommit": {"oid": "abc123"},
                            "commits": {"totalCount": 1},
                            "comments": {"totalCount": 0},
                            "reviews": {"nodes": []},
                        }],
                    }
                }
            }
        }))]);
        let project = ProjectRef { project_key: "my-org".to_string(), name: "my-org".to_string() };
        let repo = a.map_repository(&json!({"name": "svc", "full_name": "my-org/svc"}));
        let mut seen = Vec::new();
        a.stream_pull_requests(&project, &repo, None, &mut |b| seen.push(b), &CancellationToken::new()).await.unwrap();
        assert_eq!(seen.len(), 1);
        let bundle = &seen[0];
        assert_eq!(bundle.pull_request.pr_id, 3018797339);
        assert_eq!(bundle.pull_request.pr_number, 4);
        assert_eq!(bundle.pull_request.state, PrState::Merged);
        assert_eq!(bundle.pull_request.duration_seconds, Some(397_313));
        assert_eq!(bundle.tickets.len(), 1);
        assert_eq!(bundle.tickets[0].external_ticket_id, "PLTFRM-84867");
        assert_eq!(bundle.tickets[0].commit_hash, "");
    }

    #[tokio::test]
    async fn rest_fallback_paginates_commits_and_stops_at_watermark() {
        let a = adapter(false, vec![ok_response(json!([
            {"sha": "new", "commit": {"author": {"name": "a", "email": "a@x.com", "date": "2026-01-01T00:00:00Z"}, "message": "new"}, "parents": []},
            {"sha": "old", "commit": {"author": {"name": "a", "email": "a@x.com", "date": "2024-01-01T00:00:00Z"}, "message": "old"}, "parents": []},
        ]))]);
        let project = ProjectRef { project_key: "my-org".to_string(), name: "my-org".to_string() };
        let repo = a.map_repository(&json!({"name": "svc", "full_name": "my-org/svc"}));
        let since = "2025-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
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
        assert!(stats.stopped_early);
        assert!(!stats.cancelled);
    }

    #[tokio::test]
    async fn rest_fallback_does_not_report_stopped_early_when_watermark_never_triggers() {
        let a = adapter(false, vec![ok_response(json!([
            {"sha": "new", "commit": {"author": {"name": "a", "email": "a@x.com", "date": "2026-01-01T00:00:00Z"}, "message": "new"}, "parents": []},
        ]))]);
        let project = ProjectRef { project_key: "my-org".to_string(), name: "my-org".to_string() };
        let repo = a.map_repository(&json!({"name": "svc", "full_name": "my-org/svc"}));
        let since = "2020-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
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
        assert!(!stats.stopped_early, "every page ran newer than the watermark, pagination just exhausted");
        assert!(!stats.cancelled);
    }
}
