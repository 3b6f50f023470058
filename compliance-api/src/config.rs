use envconfig::Envconfig;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3300")]
    pub port: u16,

    #[envconfig(from = "STORE_HOST", default = "redis://localhost:6379")]
    pub store_host: String,

    #[envconfig(from = "CELERY_DB_INDEX", default = "0")]
    pub queue_db_index: u8,

    #[envconfig(from = "STATUS_DB_INDEX", default = "1")]
    pub status_db_index: u8,

    #[envconfig(from = "DELIVERY_MAX_ATTEMPTS", default = "3")]
    pub delivery_max_attempts: u32,

    #[envconfig(from = "WEBHOOK_ALLOWLIST")]
    pub webhook_allowlist: Option<String>,

    #[envconfig(default = "false")]
    pub allow_private_destinations: bool,

    /// Wall-clock ceiling for the synchronous (no `webhook_url`) path.
    #[envconfig(default = "3600")]
    pub compute_timeout_s: u64,

    #[envconfig(default = "5000000")]
    pub max_body_size: usize,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
