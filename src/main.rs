mod adapters;
mod config;
mod error;
mod jira;
mod models;
mod orchestrator;
mod paginator;
mod rate_limiter;
mod run_recorder;
mod sink;
mod watermark;

use adapters::bitbucket::BitbucketAdapter;
use adapters::github::GithubAdapter;
use adapters::{HttpTransport, ReqwestTransport, SourceAdapter};
use anyhow::{Context, Result};
use clap::Parser;
use config::{Args, Settings};
use models::RunStatus;
use orchestrator::Orchestrator;
use rate_limiter::RateLimiter;
use sink::BatchedSink;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use watermark::WatermarkStore;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let settings = Settings::load(args).context("failed to resolve configuration")?;

    let opts = mysql_async::Opts::from_url(&settings.sink_url).context("invalid sink_url")?;
    let pool = mysql_async::Pool::new(opts);
    sink::ensure_schema(&pool).await.context("failed to prepare sink schema")?;

    let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(
        settings.token.as_deref(),
        "insight-etl/0.1",
        Duration::from_secs(settings.http_timeout_secs),
    )?);
    let limiter = Arc::new(RateLimiter::new(settings.max_retries));
    let adapter = build_adapter(&settings, transport, limiter)?;
    let watermarks = Arc::new(WatermarkStore::new(pool.clone()));

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("received shutdown signal, cancelling after the current page completes");
            ctrl_c_cancel.cancel();
        }
    });

    loop {
        let sink = Arc::new(Mutex::new(BatchedSink::new(pool.clone(), settings.batch_size)));
        let orchestrator = Orchestrator::new(settings.clone());
        let outcome = orchestrator.run(Arc::clone(&adapter), Arc::clone(&watermarks), sink, cancel.clone()).await?;
        log::info!("run {} finished with status {} stats={:?}", outcome.run_id, outcome.status, outcome.stats);

        if cancel.is_cancelled() {
            return Ok(());
        }

        match settings.loop_secs {
            Some(secs) => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                    _ = cancel.cancelled() => return Ok(()),
                }
            }
            None if outcome.status == RunStatus::Completed => return Ok(()),
            None => std::process::exit(1),
        }
    }
}

/// Picks an adapter by `data_source`. GitHub has no dedicated
/// org config field, so `upstream_url` is expected as `<api_root>/<org>`
/// (e.g. `https://api.github.com/my-org`) and split on the last `/`.
fn build_adapter(settings: &Settings, transport: Arc<dyn HttpTransport>, limiter: Arc<RateLimiter>) -> Result<Arc<dyn SourceAdapter>> {
    match settings.data_source.as_str() {
        "insight_bitbucket_server" => Ok(Arc::new(BitbucketAdapter::new(
            settings.upstream_url.clone(),
            settings.data_source.clone(),
            transport,
            limiter,
        ))),
        "insight_github" => {
            let (rest_base, org) = settings
                .upstream_url
                .trim_end_matches('/')
                .rsplit_once('/')
                .context("GitHub upstream_url must be <api_root>/<org>")?;
            Ok(Arc::new(GithubAdapter::new(
                rest_base.to_string(),
                org.to_string(),
                settings.data_source.clone(),
                settings.use_graphql,
                transport,
                limiter,
            )))
        }
        other => anyhow::bail!("unsupported data_source: {}", other),
    }
}
