use envconfig::Envconfig;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(from = "STORE_HOST", default = "redis://localhost:6379")]
    pub store_host: String,

    #[envconfig(from = "STATUS_DB_INDEX", default = "1")]
    pub status_db_index: u8,

    #[envconfig(default = "60")]
    pub cleanup_interval_secs: u64,

    #[envconfig(default = "7")]
    pub cleanup_age_days: i64,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
