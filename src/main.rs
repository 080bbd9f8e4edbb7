use std::net::SocketAddr;
use std::sync::Arc;

use api_metrics::{
    AppState,
    config::Config,
    metrics::{CardinalityEstimator, MetricsCollector, MetricsConfig, PgMetricsStore},
    middleware::track_metrics,
    routes,
};
use axum::{Router, middleware, routing::get};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 加载配置
    let config = Config::from_env().expect("Failed to load configuration");

    // 设置数据库连接池
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to Postgres");

    // 执行数据库迁移
    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    // 构建指标采集器并启动后台 flush 任务
    let estimator = Arc::new(
        CardinalityEstimator::new("api_metrics_counts", config.metrics_hll_precision)
            .expect("Failed to create hll estimator"),
    );
    let store = Arc::new(PgMetricsStore::new(pool.clone(), Arc::clone(&estimator)));
    let collector = MetricsCollector::new(store, estimator, MetricsConfig::from_config(&config));

    let state = AppState {
        pool,
        config: config.clone(),
        collector: Arc::clone(&collector),
    };

    let app = Router::new()
        .route("/health", get(routes::debug::health))
        .route("/debug/metrics", get(routes::debug::metrics_debug))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&collector),
            track_metrics,
        ))
        .with_state(state);

    #[cfg(debug_assertions)]
    let app = {
        use tower_http::cors::{Any, CorsLayer};
        tracing::info!("Running in debug mode with CORS enabled");
        app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    };

    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port)
        .parse()
        .expect("Invalid server address");
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind address");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Server error");

    // 退出前停止后台任务并执行最后一次 flush
    collector.shutdown().await;
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install ctrl-c handler");
    tracing::info!("Shutdown signal received");
}
