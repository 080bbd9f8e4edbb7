// 指标中间件
// 请求完成后上报一次观测值，本中间件永不使请求失败

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::Request,
    middleware::Next,
    response::Response,
};
use url::form_urlencoded;

use crate::metrics::{MetricsCollector, RequestObservation};
use crate::utils::client_ip;

pub async fn track_metrics(
    State(collector): State<Arc<MetricsCollector>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    // 请求被消费前先取出要上报的字段
    let (api_key, app_name) = query_identity(req.uri().query());
    let route_pattern = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string());
    // 只在路由解析成功时记录方法，与路由成对
    let method = route_pattern
        .as_ref()
        .map(|_| req.method().as_str().to_string());
    let client_address = client_ip(&req);

    let response = next.run(req).await;

    collector.ingest(RequestObservation {
        api_key,
        app_name,
        route_pattern,
        method,
        client_address,
    });

    response
}

fn query_identity(query: Option<&str>) -> (Option<String>, Option<String>) {
    let mut api_key = None;
    let mut app_name = None;
    if let Some(query) = query {
        for (name, value) in form_urlencoded::parse(query.as_bytes()) {
            match name.as_ref() {
                "api_key" if !value.is_empty() => api_key = Some(value.into_owned()),
                "app_name" if !value.is_empty() => app_name = Some(value.into_owned()),
                _ => {}
            }
        }
    }
    (api_key, app_name)
}
