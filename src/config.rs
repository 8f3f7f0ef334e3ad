use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub broker_url: String,
    pub stream_url: String,

    pub host: String,
    pub port: u16,

    pub metrics_namespace: String,
    pub prefetch: u16,
    pub batch_size: usize,

    pub poll_sleep_s: u64,
    pub memory_cap_mb: u64,
    pub max_uptime_s: u64,
    pub restart_flag_path: String,
    pub dlq_backup_file: String,
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: env::var("DATABASE_URL")?,
            broker_url: env::var("BROKER_URL")?,
            stream_url: env::var("STREAM_URL")?,

            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT").unwrap_or_else(|_| "8080".to_string()).parse()?,

            metrics_namespace: env::var("METRICS_NAMESPACE").unwrap_or_else(|_| "analytics_ingest".to_string()),
            prefetch: env::var("PREFETCH").unwrap_or_else(|_| "10".to_string()).parse()?,
            batch_size: env::var("BATCH_SIZE").unwrap_or_else(|_| "10".to_string()).parse()?,

            poll_sleep_s: env::var("POLL_SLEEP_S").unwrap_or_else(|_| "1".to_string()).parse()?,
            memory_cap_mb: env::var("MEMORY_CAP_MB").unwrap_or_else(|_| "512".to_string()).parse()?,
            max_uptime_s: env::var("MAX_UPTIME_S").unwrap_or_else(|_| "86400".to_string()).parse()?,
            restart_flag_path: env::var("RESTART_FLAG_PATH").unwrap_or_else(|_| "/tmp/analytics_worker.restart".to_string()),
            dlq_backup_file: env::var("DLQ_BACKUP_FILE").unwrap_or_else(|_| "dlq_backup.log".to_string()),
        })
    }
}
