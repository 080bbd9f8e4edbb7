use std::sync::Arc;

use config::Config;
use metrics::MetricsCollector;
use sqlx::PgPool;

pub mod config;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod utils;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub collector: Arc<MetricsCollector>,
}
