use envconfig::Envconfig;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3303")]
    pub port: u16,

    #[envconfig(from = "STORE_HOST", default = "redis://localhost:6379")]
    pub store_host: String,

    #[envconfig(from = "CELERY_DB_INDEX", default = "0")]
    pub queue_db_index: u8,

    #[envconfig(from = "STATUS_DB_INDEX", default = "1")]
    pub status_db_index: u8,

    #[envconfig(default = "1")]
    pub compute_concurrency: usize,

    #[envconfig(default = "4")]
    pub delivery_concurrency: usize,

    #[envconfig(default = "30")]
    pub delivery_retry_min_s: u64,

    #[envconfig(default = "300")]
    pub delivery_retry_max_s: u64,

    #[envconfig(default = "3")]
    pub compute_max_attempts: u32,

    #[envconfig(default = "30")]
    pub compute_retry_min_s: u64,

    #[envconfig(default = "300")]
    pub compute_retry_max_s: u64,

    #[envconfig(default = "5")]
    pub breaker_failure_threshold: u32,

    #[envconfig(default = "60")]
    pub breaker_reset_s: u64,

    #[envconfig(from = "WEBHOOK_ALLOWLIST")]
    pub webhook_allowlist: Option<String>,

    #[envconfig(from = "WEBHOOK_HMAC_SECRET")]
    pub webhook_hmac_secret: Option<String>,

    #[envconfig(default = "false")]
    pub allow_private_destinations: bool,

    #[envconfig(default = "10")]
    pub delivery_timeout_s: u64,

    #[envconfig(default = "3600")]
    pub compute_timeout_s: u64,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
