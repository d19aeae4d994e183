use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Deserialize;
use std::collections::HashSet;

/// File-level config, loaded from `--config-path` (default `config.toml`),
/// mirroring `news-indexer`'s `Config`/`GeneralConfig` split.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub general: Option<GeneralFileConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeneralFileConfig {
    pub upstream_url: Option<String>,
    pub token: Option<String>,
    pub data_source: Option<String>,
    pub sink_url: Option<String>,
    pub sink_auth: Option<String>,
    pub repositories: Option<Vec<String>>,
    pub batch_size: Option<usize>,
    pub max_workers: Option<usize>,
    pub max_retries: Option<u32>,
    pub use_graphql: Option<bool>,
}

/// CLI surface. Every field here can also come from the config file or an
/// environment variable (`clap`'s `env` attribute), in that precedence order
/// (CLI > env > file > default) — the same layering `email-fetcher` does by
/// hand with `std::env::var(..).unwrap_or(..)`, made declarative via `clap`.
#[derive(Parser, Debug, Clone)]
#[command(name = "insight-etl", about = "Incremental source-control ETL engine")]
pub struct Args {
    #[arg(long, default_value = "config.toml")]
    pub config_path: String,

    #[arg(long, env = "UPSTREAM_URL")]
    pub upstream_url: Option<String>,

    #[arg(long, env = "UPSTREAM_TOKEN")]
    pub token: Option<String>,

    #[arg(long, env = "DATA_SOURCE")]
    pub data_source: Option<String>,

    #[arg(long, env = "SINK_URL")]
    pub sink_url: Option<String>,

    #[arg(long, env = "SINK_AUTH")]
    pub sink_auth: Option<String>,

    /// Override the watermarked window lower bound (RFC3339).
    #[arg(long, env = "SINCE")]
    pub since: Option<String>,

    /// Override the watermarked window upper bound (RFC3339).
    #[arg(long, env = "UNTIL")]
    pub until: Option<String>,

    /// Comma-separated `project/repo` subset; empty means "all".
    #[arg(long, env = "REPOSITORIES", value_delimiter = ',')]
    pub repositories: Vec<String>,

    #[arg(long, env = "COLLECT_COMMITS", default_value_t = true)]
    pub collect_commits: bool,

    #[arg(long, env = "COLLECT_PRS", default_value_t = true)]
    pub collect_prs: bool,

    #[arg(long, env = "COLLECT_REVIEWS", default_value_t = true)]
    pub collect_reviews: bool,

    #[arg(long, env = "COLLECT_COMMENTS", default_value_t = true)]
    pub collect_comments: bool,

    /// `"all"` or `"default"`.
    #[arg(long, env = "BRANCHES", default_value = "default")]
    pub branches: String,

    #[arg(long, env = "FORCE_REFETCH", default_value_t = false)]
    pub force_refetch: bool,

    #[arg(long, env = "BATCH_SIZE")]
    pub batch_size: Option<usize>,

    #[arg(long, env = "MAX_WORKERS")]
    pub max_workers: Option<usize>,

    #[arg(long, env = "USE_GRAPHQL")]
    pub use_graphql: Option<bool>,

    #[arg(long, env = "MAX_RETRIES")]
    pub max_retries: Option<u32>,

    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value_t = 30)]
    pub http_timeout_secs: u64,

    /// If set, re-invoke the collection loop every N seconds instead of
    /// exiting after a single run (cron-in-process deployment mode).
    #[arg(long, env = "LOOP_SECS")]
    pub loop_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchSelector {
    All,
    DefaultOnly,
}

/// Fully resolved configuration the orchestrator runs against.
#[derive(Debug, Clone)]
pub struct Settings {
    pub upstream_url: String,
    pub token: Option<String>,
    pub data_source: String,
    pub sink_url: String,
    pub sink_auth: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub repositories: HashSet<String>,
    pub collect_commits: bool,
    pub collect_prs: bool,
    pub collect_reviews: bool,
    pub collect_comments: bool,
    pub branches: BranchSelector,
    pub force_refetch: bool,
    pub batch_size: usize,
    pub max_workers: usize,
    pub use_graphql: bool,
    pub max_retries: u32,
    pub http_timeout_secs: u64,
    pub loop_secs: Option<u64>,
}

impl Settings {
    pub fn load(args: Args) -> Result<Self, ConfigError> {
        let file_cfg: FileConfig = match std::fs::read_to_string(&args.config_path) {
            Ok(s) => toml::from_str(&s).unwrap_or_default(),
            Err(_) => FileConfig::default(),
        };
        let general = file_cfg.general.unwrap_or_default();

        let upstream_url = args
            .upstream_url
            .or(general.upstream_url)
            .ok_or_else(|| ConfigError::MissingField("upstream_url".to_string()))?;

        let data_source = args
            .data_source
            .or(general.data_source)
            .ok_or_else(|| ConfigError::MissingField("data_source".to_string()))?;

        let sink_url = args
            .sink_url
            .or(general.sink_url)
            .ok_or_else(|| ConfigError::MissingField("sink_url".to_string()))?;

        let token = args.token.or(general.token);
        let sink_auth = args.sink_auth.or(general.sink_auth);

        let since = args
            .since
            .as_deref()
            .map(parse_rfc3339)
            .transpose()
            .map_err(|e| ConfigError::InvalidValue("since".to_string(), e))?;
        let until = args
            .until
            .as_deref()
            .map(parse_rfc3339)
            .transpose()
            .map_err(|e| ConfigError::InvalidValue("until".to_string(), e))?;

        let repositories: HashSet<String> = if !args.repositories.is_empty() {
            args.repositories.into_iter().collect()
        } else {
            general.repositories.unwrap_or_default().into_iter().collect()
        };

        let branches = match args.branches.as_str() {
            "all" => BranchSelector::All,
            "default" => BranchSelector::DefaultOnly,
            other => {
                return Err(ConfigError::InvalidValue(
                    "branches".to_string(),
                    format!("expected \"all\" or \"default\", got {:?}", other),
                ))
            }
        };

        let batch_size = args.batch_size.or(general.batch_size).unwrap_or(1000);
        let max_workers = args.max_workers.or(general.max_workers).unwrap_or(5);
        let use_graphql = args.use_graphql.or(general.use_graphql).unwrap_or(true);
        let max_retries = args.max_retries.or(general.max_retries).unwrap_or(3);

        Ok(Self {
            upstream_url,
            token,
            data_source,
            sink_url,
            sink_auth,
            since,
            until,
            repositories,
            collect_commits: args.collect_commits,
            collect_prs: args.collect_prs,
            collect_reviews: args.collect_reviews,
            collect_comments: args.collect_comments,
            branches,
            force_refetch: args.force_refetch,
            batch_size,
            max_workers,
            use_graphql,
            max_retries,
            http_timeout_secs: args.http_timeout_secs,
            loop_secs: args.loop_secs,
        })
    }

    pub fn wants_repo(&self, project_key: &str, repo_slug: &str) -> bool {
        if self.repositories.is_empty() {
            return true;
        }
        let full = format!("{}/{}", project_key, repo_slug);
        self.repositories.contains(&full) || self.repositories.contains(repo_slug)
    }

    pub fn settings_json(&self) -> String {
        serde_json::json!({
            "data_source": self.data_source,
            "batch_size": self.batch_size,
            "max_workers": self.max_workers,
            "use_graphql": self.use_graphql,
            "max_retries": self.max_retries,
            "force_refetch": self.force_refetch,
            "branches": format!("{:?}", self.branches),
        })
        .to_string()
    }
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            config_path: "nonexistent-config.toml".to_string(),
            upstream_url: Some("https://bitbucket.example.com".to_string()),
            token: None,
            data_source: Some("insight_bitbucket_server".to_string()),
            sink_url: Some("mysql://localhost/insight".to_string()),
            sink_auth: None,
            since: None,
            until: None,
            repositories: vec![],
            collect_commits: true,
            collect_prs: true,
            collect_reviews: true,
            collect_comments: true,
            branches: "default".to_string(),
            force_refetch: false,
            batch_size: None,
            max_workers: None,
            use_graphql: None,
            max_retries: None,
            http_timeout_secs: 30,
            loop_secs: None,
        }
    }

    #[test]
    fn defaults_match_spec_table() {
        let settings = Settings::load(base_args()).unwrap();
        assert_eq!(settings.batch_size, 1000);
        assert_eq!(settings.max_workers, 5);
        assert!(settings.use_graphql);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.branches, BranchSelector::DefaultOnly);
    }

    #[test]
    fn missing_required_field_is_fatal() {
        let mut args = base_args();
        args.upstream_url = None;
        let err = Settings::load(args).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "upstream_url"));
    }

    #[test]
    fn invalid_branches_value_is_rejected() {
        let mut args = base_args();
        args.branches = "weird".to_string();
        assert!(Settings::load(args).is_err());
    }

    #[test]
    fn wants_repo_defaults_to_everything() {
        let settings = Settings::load(base_args()).unwrap();
        assert!(settings.wants_repo("TEST", "test-core"));
    }

    #[test]
    fn wants_repo_restricts_to_subset() {
        let mut args = base_args();
        args.repositories = vec!["TEST/test-core".to_string()];
        let settings = Settings::load(args).unwrap();
        assert!(settings.wants_repo("TEST", "test-core"));
        assert!(!settings.wants_repo("TEST", "other-repo"));
    }
}
