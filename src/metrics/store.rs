// 指标落库
// 一个 flush 纪元对应一个数据库事务：计数 upsert 与 sketch 合并同提交、同回滚
// 单行 upsert 失败只记日志跳过，事务 begin/commit 失败则丢弃整个纪元

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::PgPool;
use std::sync::Arc;

use crate::error::MetricsError;
use crate::metrics::cache::CounterSnapshot;
use crate::metrics::estimator::{CardinalityEstimator, SketchSnapshot};

/// 按调用方标识聚合的请求计数
#[derive(Debug, Clone)]
pub struct AppUsage {
    pub api_key: String,
    pub app_name: String,
}

/// 按路由与方法聚合的请求计数
#[derive(Debug, Clone)]
pub struct RouteUsage {
    pub route_pattern: String,
    pub method: String,
}

/// 一个 flush 纪元内冻结的全部内存状态，在任何 I/O 之前取得
#[derive(Debug, Default)]
pub struct FlushEpoch {
    pub apps: Vec<CounterSnapshot<AppUsage>>,
    pub routes: Vec<CounterSnapshot<RouteUsage>>,
    pub sketch: Option<SketchSnapshot>,
}

impl FlushEpoch {
    /// 空纪元跳过所有 I/O
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty() && self.routes.is_empty() && self.sketch.is_none()
    }
}

/// 单次 flush 的落库结果
#[derive(Debug, Default, Clone)]
pub struct FlushReport {
    pub apps_upserted: usize,
    pub apps_total: usize,
    pub routes_upserted: usize,
    pub routes_total: usize,
    pub sketch_merged: bool,
}

/// 持久化计数存储
/// 每天一行、冲突时累加，跨实例并发 flush 由数据库的行级并发控制保护
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn commit_epoch(
        &self,
        date_bucket: NaiveDate,
        epoch: FlushEpoch,
    ) -> Result<FlushReport, MetricsError>;
}

/// Postgres 实现
pub struct PgMetricsStore {
    pool: PgPool,
    estimator: Arc<CardinalityEstimator>,
}

impl PgMetricsStore {
    pub fn new(pool: PgPool, estimator: Arc<CardinalityEstimator>) -> Self {
        Self { pool, estimator }
    }
}

#[async_trait]
impl MetricsStore for PgMetricsStore {
    async fn commit_epoch(
        &self,
        date_bucket: NaiveDate,
        epoch: FlushEpoch,
    ) -> Result<FlushReport, MetricsError> {
        let mut report = FlushReport {
            apps_total: epoch.apps.len(),
            routes_total: epoch.routes.len(),
            ..FlushReport::default()
        };
        if epoch.is_empty() {
            return Ok(report);
        }

        let mut tx = self.pool.begin().await?;

        for entry in &epoch.apps {
            let result = sqlx::query(
                r#"
                INSERT INTO api_metrics_apps (date, api_key, app_name, request_count, created_at, updated_at)
                VALUES ($1, $2, $3, $4, NOW(), NOW())
                ON CONFLICT (date, api_key, app_name)
                DO UPDATE SET
                    request_count = api_metrics_apps.request_count + EXCLUDED.request_count,
                    updated_at = NOW()
                "#,
            )
            .bind(date_bucket)
            .bind(&entry.value.api_key)
            .bind(&entry.value.app_name)
            .bind(entry.count)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => report.apps_upserted += 1,
                Err(e) => tracing::error!(
                    api_key = %entry.value.api_key,
                    app_name = %entry.value.app_name,
                    error = %e,
                    "Failed to upsert app metrics"
                ),
            }
        }

        for entry in &epoch.routes {
            let result = sqlx::query(
                r#"
                INSERT INTO api_metrics_routes (date, route_pattern, method, request_count, created_at, updated_at)
                VALUES ($1, $2, $3, $4, NOW(), NOW())
                ON CONFLICT (date, route_pattern, method)
                DO UPDATE SET
                    request_count = api_metrics_routes.request_count + EXCLUDED.request_count,
                    updated_at = NOW()
                "#,
            )
            .bind(date_bucket)
            .bind(&entry.value.route_pattern)
            .bind(&entry.value.method)
            .bind(entry.count)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => report.routes_upserted += 1,
                Err(e) => tracing::error!(
                    route_pattern = %entry.value.route_pattern,
                    method = %entry.value.method,
                    error = %e,
                    "Failed to upsert route metrics"
                ),
            }
        }

        // sketch 合并失败不回滚已暂存的计数写入，仍随同一事务提交
        if let Some(snapshot) = &epoch.sketch {
            match self
                .estimator
                .merge_into(&mut tx, snapshot, date_bucket)
                .await
            {
                Ok(()) => report.sketch_merged = true,
                Err(e) => tracing::error!(
                    error = %e,
                    date = %date_bucket,
                    "Failed to aggregate count metrics hll sketch"
                ),
            }
        }

        tx.commit().await?;
        Ok(report)
    }
}
