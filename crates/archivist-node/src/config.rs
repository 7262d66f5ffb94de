use std::time::Duration;

use crate::messages::UPLOAD;

const MINUTE: Duration = Duration::from_secs(60);

/// Batch orchestrator settings.
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Flush as soon as this many items are pending.
    pub max_batch_size: usize,
    /// Flush once the oldest pending item is this old.
    pub batch_timeout: Duration,
    /// Delay before a submitted batch is checked for confirmation.
    pub verify_submission_interval: Duration,
    /// Delay before each submitted item is checked individually.
    pub verify_chunk_interval: Duration,
    /// Delay before an item that failed for a non-funding reason is retried.
    pub requeue_after_error: Duration,
    /// Tick of the affordability probe while intake is paused.
    pub health_check_interval: Duration,
    /// Intake source paused on funding shortfall.
    pub intake_source: String,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            batch_timeout: 5 * MINUTE,
            verify_submission_interval: 60 * MINUTE,
            verify_chunk_interval: 24 * 60 * MINUTE,
            requeue_after_error: 10 * MINUTE,
            health_check_interval: 5 * MINUTE,
            intake_source: UPLOAD.to_string(),
        }
    }
}

impl UploaderConfig {
    /// Broker prefetch for the intake subscription. Pooled items stay
    /// unacked until their batch settles, so the broker must be willing to
    /// hand out a full batch or the size trigger can never fire.
    pub fn intake_prefetch(&self, concurrency: usize) -> u16 {
        u16::try_from(concurrency.max(self.max_batch_size).max(1)).unwrap_or(u16::MAX)
    }
}

/// Reupload orchestrator settings.
#[derive(Debug, Clone)]
pub struct ReuploadConfig {
    pub verify_submission_interval: Duration,
}

impl Default for ReuploadConfig {
    fn default() -> Self {
        Self {
            verify_submission_interval: 60 * MINUTE,
        }
    }
}

impl From<&UploaderConfig> for ReuploadConfig {
    fn from(cfg: &UploaderConfig) -> Self {
        Self {
            verify_submission_interval: cfg.verify_submission_interval,
        }
    }
}
