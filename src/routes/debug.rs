use axum::{Json, extract::State};
use serde_json::Value;

use crate::AppState;

pub async fn health() -> &'static str {
    "ok"
}

/// 指标采集器运行状态，只读，供运维排查
pub async fn metrics_debug(State(state): State<AppState>) -> Json<Value> {
    Json(state.collector.debug_snapshot())
}
