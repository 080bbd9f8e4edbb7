use std::env;
use std::time::Duration;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub database_url: String,
    pub server_host: String,
    pub server_port: u16,
    pub metrics_flush_interval_secs: u64,
    pub metrics_flush_deadline_secs: u64,
    pub metrics_app_cache_capacity: usize,
    pub metrics_route_cache_capacity: usize,
    pub metrics_cache_ttl_flushes: u32,
    pub metrics_hll_precision: u8,
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        dotenv::dotenv().ok();

        Ok(Config {
            database_url: env::var("DATABASE_URL")?,
            server_host: env::var("SERVER_HOST")?,
            server_port: env::var("SERVER_PORT")?.parse().unwrap_or(3000),
            metrics_flush_interval_secs: env_or("METRICS_FLUSH_INTERVAL_SECS", 60),
            metrics_flush_deadline_secs: env_or("METRICS_FLUSH_DEADLINE_SECS", 30),
            // 每条目约 250 字节，100 万条约 250MB
            metrics_app_cache_capacity: env_or("METRICS_APP_CACHE_CAPACITY", 1_000_000),
            metrics_route_cache_capacity: env_or("METRICS_ROUTE_CACHE_CAPACITY", 1_000_000),
            // 条目在 N 个 flush 周期未活跃后过期
            metrics_cache_ttl_flushes: env_or("METRICS_CACHE_TTL_FLUSHES", 10),
            metrics_hll_precision: env_or("METRICS_HLL_PRECISION", 12),
        })
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_flush_interval_secs)
    }

    pub fn flush_deadline(&self) -> Duration {
        Duration::from_secs(self.metrics_flush_deadline_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        self.flush_interval() * self.metrics_cache_ttl_flushes
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
