//! Run recorder: writes the `collection_runs` row at start
//! and finalizes it at end, refreshing `_version` on the final write so the
//! completed snapshot wins over the running one under merge-on-read.

use crate::models::{CollectionRun, RunStats, RunStatus};
use crate::sink::BatchedSink;
use chrono::Utc;

pub struct RunRecorder {
    run: CollectionRun,
}

impl RunRecorder {
    /// `run_id` format: `"{data_source}-{YYYYMMDD-HHMMSS}"`.
    pub fn new_run_id(data_source: &str) -> String {
        let now = Utc::now();
        format!("{}-{}", data_source, now.format("%Y%m%d-%H%M%S"))
    }

    pub fn start(data_source: &str, settings_json: String) -> Self {
        let run_id = Self::new_run_id(data_source);
        let now = Utc::now();
        Self {
            run: CollectionRun {
                run_id,
                data_source: data_source.to_string(),
                started_at: now,
                completed_at: None,
                status: RunStatus::Running,
                stats: RunStats::default(),
                settings: settings_json,
                version: now.timestamp_millis(),
            },
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run.run_id
    }

    pub fn stats_mut(&mut self) -> &mut RunStats {
        &mut self.run.stats
    }

    pub fn stats(&self) -> &RunStats {
        &self.run.stats
    }

    pub async fn write_initial(&self, sink: &mut BatchedSink) -> Result<(), crate::error::SinkError> {
        sink.add_collection_run(self.run.clone()).await
    }

    /// Finalizes with `status`, `completed_at=now`, and a refreshed
    /// `_version` so the final row wins the merge-on-read tie-break over the
    /// initial `"running"` row.
    pub async fn finalize(&mut self, sink: &mut BatchedSink, status: RunStatus) -> Result<(), crate::error::SinkError> {
        let now = Utc::now();
        self.run.completed_at = Some(now);
        self.run.status = status;
        self.run.version = now.timestamp_millis();
        sink.add_collection_run(self.run.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_embeds_data_source_and_timestamp() {
        let id = RunRecorder::new_run_id("insight_bitbucket_server");
        assert!(id.starts_with("insight_bitbucket_server-"));
        let suffix = id.strip_prefix("insight_bitbucket_server-").unwrap();
        assert_eq!(suffix.len(), "YYYYMMDD-HHMMSS".len());
    }

    #[test]
    fn finalize_refreshes_version_to_be_greater_than_initial() {
        let mut recorder = RunRecorder::start("insight_github", "{}".to_string());
        let initial_version = recorder.run.version;
        std::thread::sleep(std::time::Duration::from_millis(2));
        recorder.run.status = RunStatus::Completed;
        recorder.run.completed_at = Some(Utc::now());
        recorder.run.version = Utc::now().timestamp_millis();
        assert!(recorder.run.version >= initial_version);
    }

    #[test]
    fn completed_at_is_at_or_after_started_at_once_set() {
        let recorder = RunRecorder::start("insight_github", "{}".to_string());
        let started = recorder.run.started_at;
        let completed = Utc::now();
        assert!(completed >= started);
    }
}
