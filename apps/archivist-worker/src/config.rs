use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use archivist_node::{ReuploadConfig, UploaderConfig};

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    pub max_batch_size: usize,
    pub batch_timeout_minutes: u64,
    pub verify_submission_interval_minutes: u64,
    pub verify_chunk_interval_minutes: u64,
    pub requeue_after_error_minutes: u64,
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    pub max_concurrency: usize,
    pub broker_url: String,
    pub object_store_endpoint: String,
    pub object_store_access_key: Option<String>,
    pub object_store_secret_key: Option<String>,
    pub object_store_bucket: String,
    pub ledger_gateway_url: String,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub health_bind: String,
    pub health_port: u16,
    /// Pinged every `keep_alive_interval` so idle hosts don't sleep the worker.
    pub keep_alive_url: Option<String>,
    #[serde(with = "humantime_serde")]
    pub keep_alive_interval: Duration,
}

fn minutes(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(60))
}

impl WorkerConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("max_batch_size", 100)?
            .set_default("batch_timeout_minutes", 5)?
            .set_default("verify_submission_interval_minutes", 60)?
            .set_default("verify_chunk_interval_minutes", 1440)?
            .set_default("requeue_after_error_minutes", 10)?
            .set_default("health_check_interval", "5m")?
            .set_default("max_concurrency", 10)?
            .set_default("object_store_access_key", None::<String>)?
            .set_default("object_store_secret_key", None::<String>)?
            .set_default("request_timeout", "30s")?
            .set_default("health_bind", "0.0.0.0")?
            .set_default("health_port", 3000)?
            .set_default("keep_alive_url", None::<String>)?
            .set_default("keep_alive_interval", "20m")?;

        if let Some(path) = config_path {
            if path.extension().and_then(|ext| ext.to_str()) == Some("env") {
                // .env files feed the environment source below.
                match dotenvy::from_path(&path) {
                    Ok(_) => tracing::info!("loaded environment from {}", path.display()),
                    Err(err) => {
                        tracing::warn!("failed to load .env from {}: {}", path.display(), err)
                    }
                }
            } else {
                builder = builder.add_source(File::from(path));
            }
        }

        builder = builder.add_source(Environment::with_prefix("ARCHIVIST").try_parsing(true));

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::Message(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("broker_url", &self.broker_url),
            ("object_store_endpoint", &self.object_store_endpoint),
            ("object_store_bucket", &self.object_store_bucket),
            ("ledger_gateway_url", &self.ledger_gateway_url),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Message(format!("{name} must not be empty")));
            }
        }
        Ok(())
    }

    pub fn uploader(&self) -> UploaderConfig {
        UploaderConfig {
            max_batch_size: self.max_batch_size,
            batch_timeout: minutes(self.batch_timeout_minutes),
            verify_submission_interval: minutes(self.verify_submission_interval_minutes),
            verify_chunk_interval: minutes(self.verify_chunk_interval_minutes),
            requeue_after_error: minutes(self.requeue_after_error_minutes),
            health_check_interval: self.health_check_interval,
            ..UploaderConfig::default()
        }
    }

    pub fn reupload(&self) -> ReuploadConfig {
        ReuploadConfig::from(&self.uploader())
    }
}
