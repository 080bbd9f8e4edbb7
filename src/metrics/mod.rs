// 指标模块
// 请求指标的内存聚合与周期性落库

pub mod cache;
pub mod collector;
pub mod estimator;
pub mod store;

// 重新导出常用类型，方便其他模块使用
pub use cache::{CounterCache, CounterSnapshot};
pub use collector::{MetricsCollector, MetricsConfig, RequestObservation};
pub use estimator::{CardinalityEstimator, SketchSnapshot};
pub use store::{AppUsage, FlushEpoch, FlushReport, MetricsStore, PgMetricsStore, RouteUsage};
