use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The `data_source` discriminator carried by every row.
///
/// The canonical four values are matched explicitly; anything else observed
/// in config or upstream payloads is carried through opaquely rather than
/// rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataSource {
    InsightBitbucketServer,
    InsightGithub,
    InsightGitlab,
    CustomEtl,
    Other(String),
}

impl Serialize for DataSource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DataSource {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(DataSource::from(s.as_str()))
    }
}

impl DataSource {
    pub fn as_str(&self) -> &str {
        match self {
            DataSource::InsightBitbucketServer => "insight_bitbucket_server",
            DataSource::InsightGithub => "insight_github",
            DataSource::InsightGitlab => "insight_gitlab",
            DataSource::CustomEtl => "custom_etl",
            DataSource::Other(s) => s.as_str(),
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for DataSource {
    fn from(s: &str) -> Self {
        match s {
            "insight_bitbucket_server" => DataSource::InsightBitbucketServer,
            "insight_github" => DataSource::InsightGithub,
            "insight_gitlab" => DataSource::InsightGitlab,
            "custom_etl" => DataSource::CustomEtl,
            other => DataSource::Other(other.to_string()),
        }
    }
}

/// Milliseconds-since-epoch monotonic version stamp, read once per mapped
/// record.
pub fn stamp_version() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub project_key: String,
    pub repo_slug: String,
    pub data_source: String,
    pub name: String,
    pub uuid: Option<String>,
    pub is_private: bool,
    pub size: Option<i64>,
    pub language: Option<String>,
    pub has_issues: Option<bool>,
    pub has_wiki: Option<bool>,
    pub fork_policy: Option<String>,
    pub is_empty: bool,
    pub last_commit_date: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub project_key: String,
    pub repo_slug: String,
    pub branch_name: String,
    pub data_source: String,
    pub is_default: bool,
    pub last_commit_hash: String,
    pub last_commit_date: Option<DateTime<Utc>>,
    pub last_checked_at: DateTime<Utc>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub project_key: String,
    pub repo_slug: String,
    pub commit_hash: String,
    pub data_source: String,
    pub branch: String,
    pub author_name: String,
    pub author_email: String,
    pub committer_name: String,
    pub committer_email: String,
    pub message: String,
    pub date: DateTime<Utc>,
    /// JSON array of parent ids/shas.
    pub parents: String,
    pub files_changed: i64,
    pub lines_added: i64,
    pub lines_removed: i64,
    pub is_merge_commit: bool,
    pub language_breakdown: Option<String>,
    pub version: i64,
}

impl Commit {
    /// `is_merge_commit` is derived, never independently set.
    pub fn parent_count(parents_json: &str) -> usize {
        serde_json::from_str::<Vec<serde_json::Value>>(parents_json)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitFile {
    pub project_key: String,
    pub repo_slug: String,
    pub commit_hash: String,
    pub file_path: String,
    pub data_source: String,
    pub diff_hash: String,
    pub extension: String,
    pub lines_added: i64,
    pub lines_removed: i64,
    pub is_third_party: Option<bool>,
    pub scancode_license: Option<String>,
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrState {
    Open,
    Merged,
    Closed,
    Declined,
}

impl fmt::Display for PrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PrState::Open => "OPEN",
            PrState::Merged => "MERGED",
            PrState::Closed => "CLOSED",
            PrState::Declined => "DECLINED",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub project_key: String,
    pub repo_slug: String,
    pub pr_id: i64,
    pub data_source: String,
    pub pr_number: i64,
    pub title: String,
    pub description: String,
    pub state: PrState,
    pub author: String,
    pub created_on: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
    pub closed_on: Option<DateTime<Utc>>,
    pub merge_commit_hash: Option<String>,
    pub source_branch: String,
    pub destination_branch: String,
    pub commit_count: i64,
    pub comment_count: i64,
    pub task_count: i64,
    pub files_changed: i64,
    pub lines_added: i64,
    pub lines_removed: i64,
    pub duration_seconds: Option<i64>,
    pub version: i64,
}

impl PullRequest {
    /// `duration_seconds = floor((closed_on - created_on).seconds)`.
    pub fn duration_seconds(created_on: DateTime<Utc>, closed_on: Option<DateTime<Utc>>) -> Option<i64> {
        closed_on.map(|c| (c - created_on).num_seconds())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reviewer {
    pub project_key: String,
    pub repo_slug: String,
    pub pr_id: i64,
    pub reviewer_uuid: String,
    pub data_source: String,
    pub name: String,
    pub email: Option<String>,
    pub status: String,
    pub role: String,
    pub approved: bool,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Reviewer {
    /// Approved iff status is (case-insensitively) APPROVED.
    pub fn derive_approved(status: &str) -> bool {
        status.eq_ignore_ascii_case("approved")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrComment {
    pub project_key: String,
    pub repo_slug: String,
    pub pr_id: i64,
    pub comment_id: i64,
    pub data_source: String,
    pub content: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub state: Option<String>,
    pub severity: Option<String>,
    pub thread_resolved: Option<bool>,
    pub file_path: Option<String>,
    pub line_number: Option<i64>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrCommitLink {
    pub project_key: String,
    pub repo_slug: String,
    pub pr_id: i64,
    pub commit_hash: String,
    pub data_source: String,
    pub commit_order: i64,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub project_key: String,
    pub repo_slug: String,
    pub data_source: String,
    pub external_ticket_id: String,
    pub pr_id: i64,
    pub commit_hash: String,
    pub version: i64,
}

impl Ticket {
    pub fn for_pr(project_key: &str, repo_slug: &str, data_source: &str, ticket_id: &str, pr_id: i64) -> Self {
        Self {
            project_key: project_key.to_string(),
            repo_slug: repo_slug.to_string(),
            data_source: data_source.to_string(),
            external_ticket_id: ticket_id.to_string(),
            pr_id,
            commit_hash: String::new(),
            version: stamp_version(),
        }
    }

    pub fn for_commit(project_key: &str, repo_slug: &str, data_source: &str, ticket_id: &str, commit_hash: &str) -> Self {
        Self {
            project_key: project_key.to_string(),
            repo_slug: repo_slug.to_string(),
            data_source: data_source.to_string(),
            external_ticket_id: ticket_id.to_string(),
            pr_id: 0,
            commit_hash: commit_hash.to_string(),
            version: stamp_version(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub repos_processed: u64,
    pub commits_collected: u64,
    pub prs_collected: u64,
    pub api_calls: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionRun {
    pub run_id: String,
    pub data_source: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub stats: RunStats,
    pub settings: String,
    pub version: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_source_round_trips_canonical_values() {
        for s in [
            "insight_bitbucket_server",
            "insight_github",
            "insight_gitlab",
            "custom_etl",
        ] {
            let ds = DataSource::from(s);
            assert_eq!(ds.as_str(), s);
        }
    }

    #[test]
    fn data_source_passes_through_unknown_values_opaquely() {
        let ds = DataSource::from("dev_metrics");
        assert_eq!(ds.as_str(), "dev_metrics");
        assert!(matches!(ds, DataSource::Other(_)));
    }

    #[test]
    fn is_merge_commit_matches_parent_count() {
        assert_eq!(Commit::parent_count("[]"), 0);
        assert_eq!(Commit::parent_count(r#"["a"]"#), 1);
        assert_eq!(Commit::parent_count(r#"["a","b"]"#), 2);
    }

    #[test]
    fn pr_duration_is_floor_seconds_between_created_and_closed() {
        let created = "2025-11-17T19:45:14Z".parse::<DateTime<Utc>>().unwrap();
        let closed = "2025-11-22T10:07:07Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(PullRequest::duration_seconds(created, Some(closed)), Some(397_313));
        assert_eq!(PullRequest::duration_seconds(created, None), None);
    }

    #[test]
    fn reviewer_approved_is_case_insensitive() {
        assert!(Reviewer::derive_approved("APPROVED"));
        assert!(Reviewer::derive_approved("approved"));
        assert!(!Reviewer::derive_approved("CHANGES_REQUESTED"));
    }
}
