// 指标采集器
// 持有两个计数缓存、基数估计器与后台 flush 任务
// ingest 只做内存操作，落库由独立的定时任务串行执行

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Local;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::metrics::cache::CounterCache;
use crate::metrics::estimator::CardinalityEstimator;
use crate::metrics::store::{AppUsage, FlushEpoch, MetricsStore, RouteUsage};

/// 采集器运行参数
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub flush_interval: Duration,
    pub flush_deadline: Duration,
    pub app_cache_capacity: usize,
    pub route_cache_capacity: usize,
    pub cache_ttl: Duration,
}

impl MetricsConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            flush_interval: config.flush_interval(),
            flush_deadline: config.flush_deadline(),
            app_cache_capacity: config.metrics_app_cache_capacity,
            route_cache_capacity: config.metrics_route_cache_capacity,
            cache_ttl: config.cache_ttl(),
        }
    }
}

/// 单次请求完成后由 HTTP 层提交的观测值，所有字段可缺省
#[derive(Debug, Default, Clone)]
pub struct RequestObservation {
    pub api_key: Option<String>,
    pub app_name: Option<String>,
    pub route_pattern: Option<String>,
    pub method: Option<String>,
    pub client_address: Option<String>,
}

/// 进程内唯一的采集器实例，显式构造、显式关闭，由 HTTP 层按引用持有
pub struct MetricsCollector {
    app_metrics: CounterCache<AppUsage>,
    route_metrics: CounterCache<RouteUsage>,
    count_metrics: Arc<CardinalityEstimator>,
    store: Arc<dyn MetricsStore>,
    flush_deadline: Duration,
    stopped: AtomicBool,
    stop_tx: watch::Sender<bool>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl MetricsCollector {
    /// 构造采集器并启动后台 flush 任务
    pub fn new(
        store: Arc<dyn MetricsStore>,
        estimator: Arc<CardinalityEstimator>,
        config: MetricsConfig,
    ) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let collector = Arc::new(Self {
            app_metrics: CounterCache::new(config.app_cache_capacity, config.cache_ttl),
            route_metrics: CounterCache::new(config.route_cache_capacity, config.cache_ttl),
            count_metrics: estimator,
            store,
            flush_deadline: config.flush_deadline,
            stopped: AtomicBool::new(false),
            stop_tx,
            flush_task: Mutex::new(None),
        });

        let task = tokio::spawn(Self::flush_loop(
            Arc::clone(&collector),
            stop_rx,
            config.flush_interval,
        ));
        *collector
            .flush_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);

        collector
    }

    /// 记录一次完成的请求观测，关闭后为 no-op
    pub fn ingest(&self, observation: RequestObservation) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        let api_key = observation.api_key.unwrap_or_default();
        let app_name = observation.app_name.unwrap_or_default();
        if !api_key.is_empty() || !app_name.is_empty() {
            // api_key 优先于 app_name 作为标识
            let identifier = if api_key.is_empty() {
                app_name.clone()
            } else {
                api_key.clone()
            };
            self.app_metrics.record(&identifier, || AppUsage {
                api_key: api_key.clone(),
                app_name: app_name.clone(),
            });
        }

        if let (Some(route_pattern), Some(method)) =
            (observation.route_pattern, observation.method)
        {
            // 同一路由的不同方法分开计数，与落库表的唯一键一致
            let key = format!("{method} {route_pattern}");
            self.route_metrics.record(&key, || RouteUsage {
                route_pattern,
                method,
            });
        }

        if let Some(address) = observation.client_address {
            if !address.is_empty() {
                self.count_metrics.record(&address);
            }
        }
    }

    async fn flush_loop(
        collector: Arc<Self>,
        mut stop_rx: watch::Receiver<bool>,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        // flush 仍在进行时错过的 tick 被合并，周期之间严格串行
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // interval 的首个 tick 立即完成，跳过
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    collector.flush_once().await;
                }
                _ = stop_rx.changed() => {
                    tracing::info!("Stopping metrics flush routine");
                    return;
                }
            }
        }
    }

    /// 执行一个 flush 周期：先冻结内存纪元，再在截止时间内落库
    /// 已换出的纪元不会二次提交，提交失败时该纪元数据丢失并记录错误
    pub async fn flush_once(&self) {
        let epoch = self.take_epoch();
        if epoch.is_empty() {
            return;
        }
        let (apps_total, routes_total) = (epoch.apps.len(), epoch.routes.len());
        let sketch_count = epoch
            .sketch
            .as_ref()
            .map(|s| s.observation_count)
            .unwrap_or(0);

        // 按 flush 时刻的日历日期分桶，接近午夜的观测归入 flush 当天
        let date_bucket = Local::now().date_naive();

        match tokio::time::timeout(
            self.flush_deadline,
            self.store.commit_epoch(date_bucket, epoch),
        )
        .await
        {
            Ok(Ok(report)) => tracing::debug!(
                apps_upserted = report.apps_upserted,
                apps_total,
                routes_upserted = report.routes_upserted,
                routes_total,
                sketch_merged = report.sketch_merged,
                total_count = sketch_count,
                "Successfully flushed metrics"
            ),
            Ok(Err(e)) => tracing::error!(error = %e, "Failed to flush metrics, epoch dropped"),
            Err(_) => tracing::error!(
                deadline = ?self.flush_deadline,
                "Metrics flush exceeded deadline, epoch dropped"
            ),
        }
    }

    // 在任何 I/O 开始之前冻结本纪元的全部内存状态
    fn take_epoch(&self) -> FlushEpoch {
        let apps = self.app_metrics.take_all_and_clear();
        let routes = self.route_metrics.take_all_and_clear();
        let sketch = match self.count_metrics.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "Failed to snapshot hll sketch");
                None
            }
        };
        FlushEpoch {
            apps,
            routes,
            sketch,
        }
    }

    /// 运行状态快照，只读，供运维排查
    pub fn debug_snapshot(&self) -> Value {
        let mut result = serde_json::Map::new();
        result.insert("memory_stats".to_string(), crate::utils::memory_stats());
        result.insert(
            "api_metrics_apps_cache_size".to_string(),
            Value::from(self.app_metrics.len()),
        );
        result.insert(
            "api_metrics_routes_cache_size".to_string(),
            Value::from(self.route_metrics.len()),
        );
        if let Value::Object(stats) = self.count_metrics.stats() {
            for (key, value) in stats {
                result.insert(format!("api_metrics_counts_{key}"), value);
            }
        }
        Value::Object(result)
    }

    /// 停止后台任务并执行最后一次同步 flush
    /// 返回前保证关闭前记录的观测都已尝试落库
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Shutting down metrics collector");

        let _ = self.stop_tx.send(true);
        let task = self
            .flush_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Metrics flush task ended abnormally");
            }
        }

        self.flush_once().await;
        tracing::info!("Metrics collector shutdown complete");
    }
}
