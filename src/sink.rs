//! Batched sink: accumulates records per destination table,
//! flushes by size or on `flush_all()`, and inserts via `INSERT ... ON
//! DUPLICATE KEY UPDATE` guarded on `_version` so the store's merge-on-read
//! semantics (keep the greater `_version`) hold even though MySQL itself has
//! no native ReplacingMergeTree equivalent (see DESIGN.md).
//!
//! Grounded directly on `index_github_repos.rs`/`index_github_issues.rs`'s
//! `conn.exec_batch(..., params_iter)` pattern, generalized to ten tables
//! and a version-guarded `ON DUPLICATE KEY UPDATE` clause.

use crate::error::SinkError;
use crate::models::*;
use log::info;
use mysql_async::prelude::*;
use mysql_async::{Params, Pool};

const DEFAULT_THRESHOLD: usize = 1000;

/// `add(table, record)` triggers a flush once `batch.size >= threshold`
///. Split out as a pure function so the threshold boundary
/// is unit-testable without a live database connection.
fn should_flush(batch_len: usize, threshold: usize) -> bool {
    batch_len >= threshold
}

#[derive(Default)]
struct Batches {
    repositories: Vec<Repository>,
    branches: Vec<Branch>,
    commits: Vec<Commit>,
    commit_files: Vec<CommitFile>,
    pull_requests: Vec<PullRequest>,
    reviewers: Vec<Reviewer>,
    pr_comments: Vec<PrComment>,
    pr_commit_links: Vec<PrCommitLink>,
    tickets: Vec<Ticket>,
    collection_runs: Vec<CollectionRun>,
}

pub struct BatchedSink {
    pool: Pool,
    threshold: usize,
    batches: Batches,
    pub rows_flushed: u64,
}

/// Dependency order for `flush_all()`.
const FLUSH_ORDER: &[&str] = &[
    "repositories",
    "branches",
    "commits",
    "commit_files",
    "pull_requests",
    "reviewers",
    "pr_comments",
    "pr_commit_links",
    "tickets",
    "collection_runs",
];

impl BatchedSink {
    pub fn new(pool: Pool, threshold: usize) -> Self {
        Self {
            pool,
            threshold: if threshold == 0 { DEFAULT_THRESHOLD } else { threshold },
            batches: Batches::default(),
            rows_flushed: 0,
        }
    }

    pub async fn add_repository(&mut self, r: Repository) -> Result<(), SinkError> {
        self.batches.repositories.push(r);
        self.maybe_flush("repositories").await
    }

    pub async fn add_branch(&mut self, b: Branch) -> Result<(), SinkError> {
        self.batches.branches.push(b);
        self.maybe_flush("branches").await
    }

    pub async fn add_commit(&mut self, c: Commit) -> Result<(), SinkError> {
        self.batches.commits.push(c);
        self.maybe_flush("commits").await
    }

    pub async fn add_commit_file(&mut self, cf: CommitFile) -> Result<(), SinkError> {
        self.batches.commit_files.push(cf);
        self.maybe_flush("commit_files").await
    }

    pub async fn add_pull_request(&mut self, pr: PullRequest) -> Result<(), SinkError> {
        self.batches.pull_requests.push(pr);
        self.maybe_flush("pull_requests").await
    }

    pub async fn add_reviewer(&mut self, r: Reviewer) -> Result<(), SinkError> {
        self.batches.reviewers.push(r);
        self.maybe_flush("reviewers").await
    }

    pub async fn add_pr_comment(&mut self, c: PrComment) -> Result<(), SinkError> {
        self.batches.pr_comments.push(c);
        self.maybe_flush("pr_comments").await
    }

    pub async fn add_pr_commit_link(&mut self, l: PrCommitLink) -> Result<(), SinkError> {
        self.batches.pr_commit_links.push(l);
        self.maybe_flush("pr_commit_links").await
    }

    pub async fn add_ticket(&mut self, t: Ticket) -> Result<(), SinkError> {
        self.batches.tickets.push(t);
        self.maybe_flush("tickets").await
    }

    pub async fn add_collection_run(&mut self, r: CollectionRun) -> Result<(), SinkError> {
        self.batches.collection_runs.push(r);
        self.maybe_flush("collection_runs").await
    }

    async fn maybe_flush(&mut self, table: &str) -> Result<(), SinkError> {
        if should_flush(self.batch_len(table), self.threshold) {
            self.flush(table).await?;
        }
        Ok(())
    }

    fn batch_len(&self, table: &str) -> usize {
        match table {
            "repositories" => self.batches.repositories.len(),
            "branches" => self.batches.branches.len(),
            "commits" => self.batches.commits.len(),
            "commit_files" => self.batches.commit_files.len(),
            "pull_requests" => self.batches.pull_requests.len(),
            "reviewers" => self.batches.reviewers.len(),
            "pr_comments" => self.batches.pr_comments.len(),
            "pr_commit_links" => self.batches.pr_commit_links.len(),
            "tickets" => self.batches.tickets.len(),
            "collection_runs" => self.batches.collection_runs.len(),
            _ => 0,
        }
    }

    /// Flushes one table's batch, clearing it on success. A failed flush
    /// propagates — batches stay intact on `Err` so an
    /// operator retry at the orchestrator level can re-attempt them.
    pub async fn flush(&mut self, table: &str) -> Result<usize, SinkError> {
        let n = match table {
            "repositories" => self.flush_repositories().await?,
            "branches" => self.flush_branches().await?,
            "commits" => self.flush_commits().await?,
            "commit_files" => self.flush_commit_files().await?,
            "pull_requests" => self.flush_pull_requests().await?,
            "reviewers" => self.flush_reviewers().await?,
            "pr_comments" => self.flush_pr_comments().await?,
            "pr_commit_links" => self.flush_pr_commit_links().await?,
            "tickets" => self.flush_tickets().await?,
            "collection_runs" => self.flush_collection_runs().await?,
            _ => 0,
        };
        if n > 0 {
            info!("sink: flushed {} rows into {}", n, table);
            self.rows_flushed += n as u64;
        }
        Ok(n)
    }

    /// Flushes every non-empty table in dependency order.
    pub async fn flush_all(&mut self) -> Result<u64, SinkError> {
        let mut total = 0u64;
        for table in FLUSH_ORDER {
            let n = self.flush(table).await?;
            total += n as u64;
        }
        Ok(total)
    }

    async fn conn(&self) -> Result<mysql_async::Conn, SinkError> {
        self.pool.get_conn().await.map_err(|e| SinkError::Insert {
            table: "<connection>".to_string(),
            reason: e.to_string(),
        })
    }

    async fn flush_repositories(&mut self) -> Result<usize, SinkError> {
        if self.batches.repositories.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(&mut self.batches.repositories);
        let n = batch.len();
        let mut conn = self.conn().await?;
        let params_iter = batch.into_iter().map(|r| {
            Params::from(params! {
                "project_key" => r.project_key,
                "repo_slug" => r.repo_slug,
                "data_source" => r.data_source,
                "name" => r.name,
                "uuid" => r.uuid,
                "is_private" => r.is_private,
                "size" => r.size,
                "language" => r.language,
                "has_issues" => r.has_issues,
                "has_wiki" => r.has_wiki,
                "fork_policy" => r.fork_policy,
                "is_empty" => r.is_empty,
                "last_commit_date" => r.last_commit_date,
                "first_seen" => r.first_seen,
                "last_updated" => r.last_updated,
                "version" => r.version,
            })
        });
        conn.exec_batch(
            r#"INSERT INTO repositories
                (project_key, repo_slug, data_source, name, uuid, is_private, size, language,
                 has_issues, has_wiki, fork_policy, is_empty, last_commit_date, first_seen, last_updated, _version)
               VALUES
                (:project_key, :repo_slug, :data_source, :name, :uuid, :is_private, :size, :language,
                 :has_issues, :has_wiki, :fork_policy, :is_empty, :last_commit_date, :first_seen, :last_updated, :version)
               ON DUPLICATE KEY UPDATE
                 name = IF(VALUES(_version) > _version, VALUES(name), name),
                 uuid = IF(VALUES(_version) > _version, VALUES(uuid), uuid),
                 is_private = IF(VALUES(_version) > _version, VALUES(is_private), is_private),
                 size = IF(VALUES(_version) > _version, VALUES(size), size),
                 language = IF(VALUES(_version) > _version, VALUES(language), language),
                 has_issues = IF(VALUES(_version) > _version, VALUES(has_issues), has_issues),
                 has_wiki = IF(VALUES(_version) > _version, VALUES(has_wiki), has_wiki),
                 fork_policy = IF(VALUES(_version) > _version, VALUES(fork_policy), fork_policy),
                 is_empty = IF(VALUES(_version) > _version, VALUES(is_empty), is_empty),
                 last_commit_date = IF(VALUES(_version) > _version, VALUES(last_commit_date), last_commit_date),
                 last_updated = IF(VALUES(_version) > _version, VALUES(last_updated), last_updated),
                 _version = IF(VALUES(_version) > _version, VALUES(_version), _version)
            "#,
            params_iter,
        )
        .await
        .map_err(|e| SinkError::Insert { table: "repositories".to_string(), reason: e.to_string() })?;
        Ok(n)
    }

    async fn flush_branches(&mut self) -> Result<usize, SinkError> {
        if self.batches.branches.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(&mut self.batches.branches);
        let n = batch.len();
        let mut conn = self.conn().await?;
        let params_iter = batch.into_iter().map(|b| {
            Params::from(params! {
                "project_key" => b.project_key,
                "repo_slug" => b.repo_slug,
                "branch_name" => b.branch_name,
                "data_source" => b.data_source,
                "is_default" => b.is_default,
                "last_commit_hash" => b.last_commit_hash,
                "last_commit_date" => b.last_commit_date,
                "last_checked_at" => b.last_checked_at,
                "version" => b.version,
            })
        });
        conn.exec_batch(
            r#"INSERT INTO branches
                (project_key, repo_slug, branch_name, data_source, is_default, last_commit_hash, last_commit_date, last_checked_at, _version)
               VALUES
                (:project_key, :repo_slug, :branch_name, :data_source, :is_default, :last_commit_hash, :last_commit_date, :last_checked_at, :version)
               ON DUPLICATE KEY UPDATE
                 is_default = IF(VALUES(_version) > _version, VALUES(is_default), is_default),
                 last_commit_hash = IF(VALUES(_version) > _version, VALUES(last_commit_hash), last_commit_hash),
                 last_commit_date = IF(VALUES(_version) > _version, VALUES(last_commit_date), last_commit_date),
                 last_checked_at = IF(VALUES(_version) > _version, VALUES(last_checked_at), last_checked_at),
                 _version = IF(VALUES(_version) > _version, VALUES(_version), _version)
            "#,
            params_iter,
        )
        .await
        .map_err(|e| SinkError::Insert { table: "branches".to_string(), reason: e.to_string() })?;
        Ok(n)
    }

    async fn flush_commits(&mut self) -> Result<usize, SinkError> {
        if self.batches.commits.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(&mut self.batches.commits);
        let n = batch.len();
        let mut conn = self.conn().await?;
        let params_iter = batch.into_iter().map(|c| {
            Params::from(params! {
                "project_key" => c.project_key,
                "repo_slug" => c.repo_slug,
                "commit_hash" => c.commit_hash,
                "data_source" => c.data_source,
                "branch" => c.branch,
                "author_name" => c.author_name,
                "author_email" => c.author_email,
                "committer_name" => c.committer_name,
                "committer_email" => c.committer_email,
                "message" => c.message,
                "date" => c.date,
                "parents" => c.parents,
                "files_changed" => c.files_changed,
                "lines_added" => c.lines_added,
                "lines_removed" => c.lines_removed,
                "is_merge_commit" => c.is_merge_commit,
                "language_breakdown" => c.language_breakdown,
                "version" => c.version,
            })
        });
        conn.exec_batch(
            r#"INSERT INTO commits
                (project_key, repo_slug, commit_hash, data_source, branch, author_name, author_email,
                 committer_name, committer_email, message, date, parents, files_changed, lines_added,
                 lines_removed, is_merge_commit, language_breakdown, _version)
               VALUES
                (:project_key, :repo_slug, :commit_hash, :data_source, :branch, :author_name, :author_email,
                 :committer_name, :committer_email, :message, :date, :parents, :files_changed, :lines_added,
                 :lines_removed, :is_merge_commit, :language_breakdown, :version)
               ON DUPLICATE KEY UPDATE
                 branch = IF(VALUES(_version) > _version, VALUES(branch), branch),
                 message = IF(VALUES(_version) > _version, VALUES(message), message),
                 files_changed = IF(VALUES(_version) > _version, VALUES(files_changed), files_changed),
                 lines_added = IF(VALUES(_version) > _version, VALUES(lines_added), lines_added),
                 lines_removed = IF(VALUES(_version) > _version, VALUES(lines_removed), lines_removed),
                 language_breakdown = IF(VALUES(_version) > _version, VALUES(language_breakdown), language_breakdown),
                 _version = IF(VALUES(_version) > _version, VALUES(_version), _version)
            "#,
            params_iter,
        )
        .await
        .map_err(|e| SinkError::Insert { table: "commits".to_string(), reason: e.to_string() })?;
        Ok(n)
    }

    async fn flush_commit_files(&mut self) -> Result<usize, SinkError> {
        if self.batches.commit_files.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(&mut self.batches.commit_files);
        let n = batch.len();
        let mut conn = self.conn().await?;
        let params_iter = batch.into_iter().map(|cf| {
            Params::from(params! {
                "project_key" => cf.project_key,
                "repo_slug" => cf.repo_slug,
                "commit_hash" => cf.commit_hash,
                "file_path" => cf.file_path,
                "data_source" => cf.data_source,
                "diff_hash" => cf.diff_hash,
                "extension" => cf.extension,
                "lines_added" => cf.lines_added,
                "lines_removed" => cf.lines_removed,
                "is_third_party" => cf.is_third_party,
                "scancode_license" => cf.scancode_license,
                "version" => cf.version,
            })
        });
        conn.exec_batch(
            r#"INSERT INTO commit_files
                (project_key, repo_slug, commit_hash, file_path, data_source, diff_hash, extension,
                 lines_added, lines_removed, is_third_party, scancode_license, _version)
               VALUES
                (:project_key, :repo_slug, :commit_hash, :file_path, :data_source, :diff_hash, :extension,
                 :lines_added, :lines_removed, :is_third_party, :scancode_license, :version)
               ON DUPLICATE KEY UPDATE
                 diff_hash = IF(VALUES(_version) > _version, VALUES(diff_hash), diff_hash),
                 lines_added = IF(VALUES(_version) > _version, VALUES(lines_added), lines_added),
                 lines_removed = IF(VALUES(_version) > _version, VALUES(lines_removed), lines_removed),
                 is_third_party = IF(VALUES(_version) > _version, VALUES(is_third_party), is_third_party),
                 scancode_license = IF(VALUES(_version) > _version, VALUES(scancode_license), scancode_license),
                 _version = IF(VALUES(_version) > _version, VALUES(_version), _version)
            "#,
            params_iter,
        )
        .await
        .map_err(|e| SinkError::Insert { table: "commit_files".to_string(), reason: e.to_string() })?;
        Ok(n)
    }

    async fn flush_pull_requests(&mut self) -> Result<usize, SinkError> {
        if self.batches.pull_requests.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(&mut self.batches.pull_requests);
        let n = batch.len();
        let mut conn = self.conn().await?;
        let params_iter = batch.into_iter().map(|pr| {
            Params::from(params! {
                "project_key" => pr.project_key,
                "repo_slug" => pr.repo_slug,
                "pr_id" => pr.pr_id,
                "data_source" => pr.data_source,
                "pr_number" => pr.pr_number,
                "title" => pr.title,
                "description" => pr.description,
                "state" => pr.state.to_string(),
                "author" => pr.author,
                "created_on" => pr.created_on,
                "updated_on" => pr.updated_on,
                "closed_on" => pr.closed_on,
                "merge_commit_hash" => pr.merge_commit_hash,
                "source_branch" => pr.source_branch,
                "destination_branch" => pr.destination_branch,
                "commit_count" => pr.commit_count,
                "comment_count" => pr.comment_count,
                "task_count" => pr.task_count,
                "files_changed" => pr.files_changed,
                "lines_added" => pr.lines_added,
                "lines_removed" => pr.lines_removed,
                "duration_seconds" => pr.duration_seconds,
                "version" => pr.version,
            })
        });
        conn.exec_batch(
            r#"INSERT INTO pull_requests
                (project_key, repo_slug, pr_id, data_source, pr_number, title, description, state, author,
                 created_on, updated_on, closed_on, merge_commit_hash, source_branch, destination_branch,
                 commit_count, comment_count, task_count, files_changed, lines_added, lines_removed,
                 duration_seconds, _version)
               VALUES
                (:project_key, :repo_slug, :pr_id, :data_source, :pr_number, :title, :description, :state, :author,
                 :created_on, :updated_on, :closed_on, :merge_commit_hash, :source_branch, :destination_branch,
                 :commit_count, :comment_count, :task_count, :files_changed, :lines_added, :lines_removed,
                 :duration_seconds, :version)
               ON DUPLICATE KEY UPDATE
                 title = IF(VALUES(_version) > _version, VALUES(title), title),
                 description = IF(VALUES(_version) > _version, VALUES(description), description),
                 state = IF(VALUES(_version) > _version, VALUES(state), state),
                 updated_on = IF(VALUES(_version) > _version, VALUES(updated_on), updated_on),
                 closed_on = IF(VALUES(_version) > _version, VALUES(closed_on), closed_on),
                 merge_commit_hash = IF(VALUES(_version) > _version, VALUES(merge_commit_hash), merge_commit_hash),
                 commit_count = IF(VALUES(_version) > _version, VALUES(commit_count), commit_count),
                 comment_count = IF(VALUES(_version) > _version, VALUES(comment_count), comment_count),
                 task_count = IF(VALUES(_version) > _version, VALUES(task_count), task_count),
                 files_changed = IF(VALUES(_version) > _version, VALUES(files_changed), files_changed),
                 lines_added = IF(VALUES(_version) > _version, VALUES(lines_added), lines_added),
                 lines_removed = IF(VALUES(_version) > _version, VALUES(lines_removed), lines_removed),
                 duration_seconds = IF(VALUES(_version) > _version, VALUES(duration_seconds), duration_seconds),
                 _version = IF(VALUES(_version) > _version, VALUES(_version), _version)
            "#,
            params_iter,
        )
        .await
        .map_err(|e| SinkError::Insert { table: "pull_requests".to_string(), reason: e.to_string() })?;
        Ok(n)
    }

    async fn flush_reviewers(&mut self) -> Result<usize, SinkError> {
        if self.batches.reviewers.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(&mut self.batches.reviewers);
        let n = batch.len();
        let mut conn = self.conn().await?;
        let params_iter = batch.into_iter().map(|r| {
            Params::from(params! {
                "project_key" => r.project_key,
                "repo_slug" => r.repo_slug,
                "pr_id" => r.pr_id,
                "reviewer_uuid" => r.reviewer_uuid,
                "data_source" => r.data_source,
                "name" => r.name,
                "email" => r.email,
                "status" => r.status,
                "role" => r.role,
                "approved" => r.approved,
                "reviewed_at" => r.reviewed_at,
                "version" => r.version,
            })
        });
        conn.exec_batch(
            r#"INSERT INTO reviewers
                (project_key, repo_slug, pr_id, reviewer_uuid, data_source, name, email, status, role, approved, reviewed_at, _version)
               VALUES
                (:project_key, :repo_slug, :pr_id, :reviewer_uuid, :data_source, :name, :email, :status, :role, :approved, :reviewed_at, :version)
               ON DUPLICATE KEY UPDATE
                 name = IF(VALUES(_version) > _version, VALUES(name), name),
                 email = IF(VALUES(_version) > _version, VALUES(email), email),
                 status = IF(VALUES(_version) > _version, VALUES(status), status),
                 approved = IF(VALUES(_version) > _version, VALUES(approved), approved),
                 reviewed_at = IF(VALUES(_version) > _version, VALUES(reviewed_at), reviewed_at),
                 _version = IF(VALUES(_version) > _version, VALUES(_version), _version)
            "#,
            params_iter,
        )
        .await
        .map_err(|e| SinkError::Insert { table: "reviewers".to_string(), reason: e.to_string() })?;
        Ok(n)
    }

    async fn flush_pr_comments(&mut self) -> Result<usize, SinkError> {
        if self.batches.pr_comments.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(&mut self.batches.pr_comments);
        let n = batch.len();
        let mut conn = self.conn().await?;
        let params_iter = batch.into_iter().map(|c| {
            Params::from(params! {
                "project_key" => c.project_key,
                "repo_slug" => c.repo_slug,
                "pr_id" => c.pr_id,
                "comment_id" => c.comment_id,
                "data_source" => c.data_source,
                "content" => c.content,
                "author" => c.author,
                "created_at" => c.created_at,
                "updated_at" => c.updated_at,
                "state" => c.state,
                "severity" => c.severity,
                "thread_resolved" => c.thread_resolved,
                "file_path" => c.file_path,
                "line_number" => c.line_number,
                "version" => c.version,
            })
        });
        conn.exec_batch(
            r#"INSERT INTO pr_comments
                (project_key, repo_slug, pr_id, comment_id, data_source, content, author, created_at,
                 updated_at, state, severity, thread_resolved, file_path, line_number, _version)
               VALUES
                (:project_key, :repo_slug, :pr_id, :comment_id, :data_source, :content, :author, :created_at,
                 :updated_at, :state, :severity, :thread_resolved, :file_path, :line_number, :version)
               ON DUPLICATE KEY UPDATE
                 content = IF(VALUES(_version) > _version, VALUES(content), content),
                 updated_at = IF(VALUES(_version) > _version, VALUES(updated_at), updated_at),
                 state = IF(VALUES(_version) > _version, VALUES(state), state),
                 severity = IF(VALUES(_version) > _version, VALUES(severity), severity),
                 thread_resolved = IF(VALUES(_version) > _version, VALUES(thread_resolved), thread_resolved),
                 _version = IF(VALUES(_version) > _version, VALUES(_version), _version)
            "#,
            params_iter,
        )
        .await
        .map_err(|e| SinkError::Insert { table: "pr_comments".to_string(), reason: e.to_string() })?;
        Ok(n)
    }

    async fn flush_pr_commit_links(&mut self) -> Result<usize, SinkError> {
        if self.batches.pr_commit_links.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(&mut self.batches.pr_commit_links);
        let n = batch.len();
        let mut conn = self.conn().await?;
        let params_iter = batch.into_iter().map(|l| {
            Params::from(params! {
                "project_key" => l.project_key,
                "repo_slug" => l.repo_slug,
                "pr_id" => l.pr_id,
                "commit_hash" => l.commit_hash,
                "data_source" => l.data_source,
                "commit_order" => l.commit_order,
                "version" => l.version,
            })
        });
        conn.exec_batch(
            r#"INSERT INTO pr_commit_links
                (project_key, repo_slug, pr_id, commit_hash, data_source, commit_order, _version)
               VALUES
                (:project_key, :repo_slug, :pr_id, :commit_hash, :data_source, :commit_order, :version)
               ON DUPLICATE KEY UPDATE
                 commit_order = IF(VALUES(_version) > _version, VALUES(commit_order), commit_order),
                 _version = IF(VALUES(_version) > _version, VALUES(_version), _version)
            "#,
            params_iter,
        )
        .await
        .map_err(|e| SinkError::Insert { table: "pr_commit_links".to_string(), reason: e.to_string() })?;
        Ok(n)
    }

    async fn flush_tickets(&mut self) -> Result<usize, SinkError> {
        if self.batches.tickets.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(&mut self.batches.tickets);
        let n = batch.len();
        let mut conn = self.conn().await?;
        let params_iter = batch.into_iter().map(|t| {
            Params::from(params! {
                "project_key" => t.project_key,
                "repo_slug" => t.repo_slug,
                "data_source" => t.data_source,
                "external_ticket_id" => t.external_ticket_id,
                "pr_id" => t.pr_id,
                "commit_hash" => t.commit_hash,
                "version" => t.version,
            })
        });
        conn.exec_batch(
            r#"INSERT INTO tickets
                (project_key, repo_slug, data_source, external_ticket_id, pr_id, commit_hash, _version)
               VALUES
                (:project_key, :repo_slug, :data_source, :external_ticket_id, :pr_id, :commit_hash, :version)
               ON DUPLICATE KEY UPDATE
                 _version = IF(VALUES(_version) > _version, VALUES(_version), _version)
            "#,
            params_iter,
        )
        .await
        .map_err(|e| SinkError::Insert { table: "tickets".to_string(), reason: e.to_string() })?;
        Ok(n)
    }

    async fn flush_collection_runs(&mut self) -> Result<usize, SinkError> {
        if self.batches.collection_runs.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(&mut self.batches.collection_runs);
        let n = batch.len();
        let mut conn = self.conn().await?;
        let params_iter = batch.into_iter().map(|r| {
            Params::from(params! {
                "run_id" => r.run_id,
                "data_source" => r.data_source,
                "started_at" => r.started_at,
                "completed_at" => r.completed_at,
                "status" => r.status.to_string(),
                "repos_processed" => r.stats.repos_processed,
                "commits_collected" => r.stats.commits_collected,
                "prs_collected" => r.stats.prs_collected,
                "api_calls" => r.stats.api_calls,
                "errors" => r.stats.errors,
                "settings" => r.settings,
                "version" => r.version,
            })
        });
        conn.exec_batch(
            r#"INSERT INTO collection_runs
                (run_id, data_source, started_at, completed_at, status, repos_processed, commits_collected,
                 prs_collected, api_calls, errors, settings, _version)
               VALUES
                (:run_id, :data_source, :started_at, :completed_at, :status, :repos_processed, :commits_collected,
                 :prs_collected, :api_calls, :errors, :settings, :version)
               ON DUPLICATE KEY UPDATE
                 completed_at = IF(VALUES(_version) > _version, VALUES(completed_at), completed_at),
                 status = IF(VALUES(_version) > _version, VALUES(status), status),
                 repos_processed = IF(VALUES(_version) > _version, VALUES(repos_processed), repos_processed),
                 commits_collected = IF(VALUES(_version) > _version, VALUES(commits_collected), commits_collected),
                 prs_collected = IF(VALUES(_version) > _version, VALUES(prs_collected), prs_collected),
                 api_calls = IF(VALUES(_version) > _version, VALUES(api_calls), api_calls),
                 errors = IF(VALUES(_version) > _version, VALUES(errors), errors),
                 _version = IF(VALUES(_version) > _version, VALUES(_version), _version)
            "#,
            params_iter,
        )
        .await
        .map_err(|e| SinkError::Insert { table: "collection_runs".to_string(), reason: e.to_string() })?;
        Ok(n)
    }
}

/// Schema bootstrap, following `index_github_repos.rs`'s
/// `CREATE TABLE IF NOT EXISTS` pattern. Run once at startup.
pub async fn ensure_schema(pool: &Pool) -> anyhow::Result<()> {
    let mut conn = pool.get_conn().await?;
    conn.query_drop(
        r#"CREATE TABLE IF NOT EXISTS repositories (
            project_key VARCHAR(255) NOT NULL,
            repo_slug VARCHAR(255) NOT NULL,
            data_source VARCHAR(64) NOT NULL,
            name VARCHAR(255) NOT NULL,
            uuid VARCHAR(64),
            is_private BOOL NOT NULL DEFAULT FALSE,
            size BIGINT,
            language VARCHAR(128),
            has_issues BOOL,
            has_wiki BOOL,
            fork_policy VARCHAR(64),
            is_empty BOOL NOT NULL DEFAULT FALSE,
            last_commit_date DATETIME(3),
            first_seen DATETIME(3) NOT NULL,
            last_updated DATETIME(3) NOT NULL,
            _version BIGINT NOT NULL,
            PRIMARY KEY (project_key, repo_slug, data_source)
        )"#,
    )
    .await?;
    conn.query_drop(
        r#"CREATE TABLE IF NOT EXISTS branches (
            project_key VARCHAR(255) NOT NULL,
            repo_slug VARCHAR(255) NOT NULL,
            branch_name VARCHAR(255) NOT NULL,
            data_source VARCHAR(64) NOT NULL,
            is_default BOOL NOT NULL DEFAULT FALSE,
            last_commit_hash VARCHAR(64) NOT NULL,
            last_commit_date DATETIME(3),
            last_checked_at DATETIME(3) NOT NULL,
            _version BIGINT NOT NULL,
            PRIMARY KEY (project_key, repo_slug, branch_name, data_source)
        )"#,
    )
    .await?;
    conn.query_drop(
        r#"CREATE TABLE IF NOT EXISTS commits (
            project_key VARCHAR(255) NOT NULL,
            repo_slug VARCHAR(255) NOT NULL,
            commit_hash VARCHAR(64) NOT NULL,
            data_source VARCHAR(64) NOT NULL,
            branch VARCHAR(255),
            author_name VARCHAR(255),
            author_email VARCHAR(255),
            committer_name VARCHAR(255),
            committer_email VARCHAR(255),
            message TEXT,
            date DATETIME(3) NOT NULL,
            parents TEXT NOT NULL,
            files_changed INT NOT NULL DEFAULT 0,
            lines_added INT NOT NULL DEFAULT 0,
            lines_removed INT NOT NULL DEFAULT 0,
            is_merge_commit BOOL NOT NULL DEFAULT FALSE,
            language_breakdown TEXT,
            _version BIGINT NOT NULL,
            PRIMARY KEY (project_key, repo_slug, commit_hash, data_source),
            INDEX idx_commits_date (project_key, repo_slug, data_source, date)
        )"#,
    )
    .await?;
    conn.query_drop(
        r#"CREATE TABLE IF NOT EXISTS commit_files (
            project_key VARCHAR(255) NOT NULL,
            repo_slug VARCHAR(255) NOT NULL,
            commit_hash VARCHAR(64) NOT NULL,
            file_path VARCHAR(1024) NOT NULL,
            data_source VARCHAR(64) NOT NULL,
            diff_hash CHAR(64) NOT NULL,
            extension VARCHAR(32),
            lines_added INT NOT NULL DEFAULT 0,
            lines_removed INT NOT NULL DEFAULT 0,
            is_third_party BOOL,
            scancode_license TEXT,
            _version BIGINT NOT NULL,
            PRIMARY KEY (project_key, repo_slug, commit_hash, file_path(191), data_source)
        )"#,
    )
    .await?;
    conn.query_drop(
        r#"CREATE TABLE IF NOT EXISTS pull_requests (
            project_key VARCHAR(255) NOT NULL,
            repo_slug VARCHAR(255) NOT NULL,
            pr_id BIGINT NOT NULL,
            data_source VARCHAR(64) NOT NULL,
            pr_number BIGINT NOT NULL,
            title VARCHAR(1024),
            description TEXT,
            state VARCHAR(16) NOT NULL,
            author VARCHAR(255),
            created_on DATETIME(3) NOT NULL,
            updated_on DATETIME(3) NOT NULL,
            closed_on DATETIME(3),
            merge_commit_hash VARCHAR(64),
            source_branch VARCHAR(255),
            destination_branch VARCHAR(255),
            commit_count INT NOT NULL DEFAULT 0,
            comment_count INT NOT NULL DEFAULT 0,
            task_count INT NOT NULL DEFAULT 0,
            files_changed INT NOT NULL DEFAULT 0,
            lines_added INT NOT NULL DEFAULT 0,
            lines_removed INT NOT NULL DEFAULT 0,
            duration_seconds BIGINT,
            _version BIGINT NOT NULL,
            PRIMARY KEY (project_key, repo_slug, pr_id, data_source),
            INDEX idx_pr_updated (project_key, repo_slug, data_source, updated_on)
        )"#,
    )
    .await?;
    conn.query_drop(
        r#"CREATE TABLE IF NOT EXISTS reviewers (
            project_key VARCHAR(255) NOT NULL,
            repo_slug VARCHAR(255) NOT NULL,
            pr_id BIGINT NOT NULL,
            reviewer_uuid VARCHAR(255) NOT NULL,
            data_source VARCHAR(64) NOT NULL,
            name VARCHAR(255),
            email VARCHAR(255),
            status VARCHAR(32),
            role VARCHAR(32) NOT NULL DEFAULT 'REVIEWER',
            approved BOOL NOT NULL DEFAULT FALSE,
            reviewed_at DATETIME(3),
            _version BIGINT NOT NULL,
            PRIMARY KEY (project_key, repo_slug, pr_id, reviewer_uuid, data_source)
        )"#,
    )
    .await?;
    conn.query_drop(
        r#"CREATE TABLE IF NOT EXISTS pr_comments (
            project_key VARCHAR(255) NOT NULL,
            repo_slug VARCHAR(255) NOT NULL,
            pr_id BIGINT NOT NULL,
            comment_id BIGINT NOT NULL,
            data_source VARCHAR(64) NOT NULL,
            content TEXT,
            author VARCHAR(255),
            created_at DATETIME(3) NOT NULL,
            updated_at DATETIME(3),
            state VARCHAR(32),
            severity VARCHAR(32),
            thread_resolved BOOL,
            file_path VARCHAR(1024),
            line_number INT,
            _version BIGINT NOT NULL,
            PRIMARY KEY (project_key, repo_slug, pr_id, comment_id, data_source)
        )"#,
    )
    .await?;
    conn.query_drop(
        r#"CREATE TABLE IF NOT EXISTS pr_commit_links (
            project_key VARCHAR(255) NOT NULL,
            repo_slug VARCHAR(255) NOT NULL,
            pr_id BIGINT NOT NULL,
            commit_hash VARCHAR(64) NOT NULL,
            data_source VARCHAR(64) NOT NULL,
            commit_order INT NOT NULL,
            _version BIGINT NOT NULL,
            PRIMARY KEY (project_key, repo_slug, pr_id, commit_hash, data_source)
        )"#,
    )
    .await?;
    conn.query_drop(
        r#"CREATE TABLE IF NOT EXISTS tickets (
            project_key VARCHAR(255) NOT NULL,
            repo_slug VARCHAR(255) NOT NULL,
            data_source VARCHAR(64) NOT NULL,
            external_ticket_id VARCHAR(64) NOT NULL,
            pr_id BIGINT NOT NULL DEFAULT 0,
            commit_hash VARCHAR(64) NOT NULL DEFAULT '',
            _version BIGINT NOT NULL,
            PRIMARY KEY (project_key, repo_slug, data_source, external_ticket_id, pr_id, commit_hash)
        )"#,
    )
    .await?;
    conn.query_drop(
        r#"CREATE TABLE IF NOT EXISTS collection_runs (
            run_id VARCHAR(128) NOT NULL,
            data_source VARCHAR(64) NOT NULL,
            started_at DATETIME(3) NOT NULL,
            completed_at DATETIME(3),
            status VARCHAR(16) NOT NULL,
            repos_processed BIGINT NOT NULL DEFAULT 0,
            commits_collected BIGINT NOT NULL DEFAULT 0,
            prs_collected BIGINT NOT NULL DEFAULT 0,
            api_calls BIGINT NOT NULL DEFAULT 0,
            errors BIGINT NOT NULL DEFAULT 0,
            settings TEXT,
            _version BIGINT NOT NULL,
            PRIMARY KEY (run_id)
        )"#,
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{should_flush, FLUSH_ORDER};

    #[test]
    fn flush_order_puts_repositories_before_children() {
        let repo_idx = FLUSH_ORDER.iter().position(|t| *t == "repositories").unwrap();
        let commit_idx = FLUSH_ORDER.iter().position(|t| *t == "commits").unwrap();
        let pr_idx = FLUSH_ORDER.iter().position(|t| *t == "pull_requests").unwrap();
        assert!(repo_idx < commit_idx);
        assert!(repo_idx < pr_idx);
        assert!(commit_idx < FLUSH_ORDER.iter().position(|t| *t == "commit_files").unwrap());
        assert!(pr_idx < FLUSH_ORDER.iter().position(|t| *t == "reviewers").unwrap());
        assert_eq!(FLUSH_ORDER.last(), Some(&"collection_runs"));
    }

    /// batch_size=3, 7 commits -> flushes of 3, 3, 1.
    #[test]
    fn threshold_of_three_flushes_at_three_three_then_remainder_one() {
        let threshold = 3;
        let mut pending = 0usize;
        let mut flush_sizes = Vec::new();
        for _ in 0..7 {
            pending += 1;
            if should_flush(pending, threshold) {
                flush_sizes.push(pending);
                pending = 0;
            }
        }
        if pending > 0 {
            flush_sizes.push(pending);
        }
        assert_eq!(flush_sizes, vec![3, 3, 1]);
        assert_eq!(flush_sizes.iter().sum::<usize>(), 7);
    }
}
