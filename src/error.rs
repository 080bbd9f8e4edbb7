use thiserror::Error;

/// 指标子系统内部错误
/// flush 路径上的错误只记录日志，绝不向请求处理传播 panic
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("sketch error: {0}")]
    Sketch(String),
}
