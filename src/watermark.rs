//! Read-only watermark lookups. Single-row aggregations
//! against the sink's Commit/PullRequest/Branch tables; a missing row means
//! "no prior watermark — collect everything".

use anyhow::Result;
use chrono::{DateTime, Utc};
use mysql_async::prelude::*;
use mysql_async::Pool;

#[derive(Debug, Clone, Default)]
pub struct Watermark {
    pub max_commit_date: Option<DateTime<Utc>>,
    pub max_pr_updated: Option<DateTime<Utc>>,
}

pub struct WatermarkStore {
    pool: Pool,
}

impl WatermarkStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn read(&self, project_key: &str, repo_slug: &str, data_source: &str) -> Result<Watermark> {
        let mut conn = self.pool.get_conn().await?;
        let max_commit_date: Option<DateTime<Utc>> = conn
            .exec_first(
                "SELECT MAX(date) FROM commits WHERE project_key = :p AND repo_slug = :r AND data_source = :d",
                params! { "p" => project_key, "r" => repo_slug, "d" => data_source },
            )
            .await?
            .flatten();

        let max_pr_updated: Option<DateTime<Utc>> = conn
            .exec_first(
                "SELECT MAX(updated_on) FROM pull_requests WHERE project_key = :p AND repo_slug = :r AND data_source = :d",
                params! { "p" => project_key, "r" => repo_slug, "d" => data_source },
            )
            .await?
            .flatten();

        Ok(Watermark { max_commit_date, max_pr_updated })
    }

    pub async fn last_commit_hash(
        &self,
        project_key: &str,
        repo_slug: &str,
        branch_name: &str,
        data_source: &str,
    ) -> Result<Option<String>> {
        let mut conn = self.pool.get_conn().await?;
        let hash: Option<String> = conn
            .exec_first(
                "SELECT last_commit_hash FROM branches WHERE project_key = :p AND repo_slug = :r AND branch_name = :b AND data_source = :d",
                params! { "p" => project_key, "r" => repo_slug, "b" => branch_name, "d" => data_source },
            )
            .await?;
        Ok(hash)
    }
}
