//! Background tasks for a hosted partition.

use std::{sync::Arc, time::Duration};

use crate::{
    config::SchedulerConfig,
    error::Result,
    file_tracker::FileTracker,
    partition::PartitionWriter,
    scheduler::BackgroundTask,
};

/// Drains the head arena to a segment whenever records are pending.
pub struct CommitTask {
    writer: Arc<PartitionWriter>,
    interval: Duration,
}

impl CommitTask {
    pub fn new(writer: Arc<PartitionWriter>, config: &SchedulerConfig) -> Self {
        Self {
            writer,
            interval: config.commit_interval,
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CommitTask {
    fn name(&self) -> &'static str {
        "arena-commit"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self) -> Result<()> {
        if self.writer.needs_commit() {
            self.writer.commit().await?;
        }
        Ok(())
    }
}

/// Runs the compaction strategy when it reports work to do.
pub struct CompactionTask {
    writer: Arc<PartitionWriter>,
    interval: Duration,
}

impl CompactionTask {
    pub fn new(writer: Arc<PartitionWriter>, config: &SchedulerConfig) -> Self {
        Self {
            writer,
            interval: config.compaction_interval,
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self) -> Result<()> {
        if self.writer.needs_compaction() {
            self.writer.compact(false).await?;
        }
        Ok(())
    }
}

/// Retries pending file deletions whose snapshot references have drained.
pub struct TrackerSweepTask {
    tracker: Arc<FileTracker>,
    interval: Duration,
}

impl TrackerSweepTask {
    pub fn new(tracker: Arc<FileTracker>, config: &SchedulerConfig) -> Self {
        Self {
            tracker,
            interval: config.tracker_sweep_interval,
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for TrackerSweepTask {
    fn name(&self) -> &'static str {
        "tracker-sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self) -> Result<()> {
        let deleted = self.tracker.sweep()?;
        if deleted > 0 {
            tracing::debug!(deleted, "tracker sweep removed files");
        }
        Ok(())
    }
}
