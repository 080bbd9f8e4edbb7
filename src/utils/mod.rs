// 工具模块
// 客户端IP提取与进程内存统计

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Request;
use serde_json::Value;

/// 从请求头或连接信息中提取客户端IP
pub fn client_ip(req: &Request<Body>) -> Option<String> {
    // 从连接信息获取原始IP
    let remote_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string());

    // 优先使用代理头中的IP，降级使用连接IP
    req.headers()
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .or_else(|| {
            req.headers()
                .get("x-forwarded-for")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.split(',').find(|ip| !ip.trim().is_empty()))
        })
        .map(|s| s.trim().to_string())
        .or(remote_ip)
        .filter(|ip| !ip.is_empty())
}

/// 进程内存统计，Linux 下读取 /proc/self/status，其他平台返回空对象
pub fn memory_stats() -> Value {
    let mut stats = serde_json::Map::new();

    if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
        for line in status.lines() {
            let Some((name, rest)) = line.split_once(':') else {
                continue;
            };
            let field = match name {
                "VmRSS" => "resident_bytes",
                "VmHWM" => "peak_resident_bytes",
                "VmSize" => "virtual_bytes",
                _ => continue,
            };
            if let Some(kb) = rest
                .trim()
                .strip_suffix(" kB")
                .and_then(|v| v.parse::<u64>().ok())
            {
                stats.insert(field.to_string(), Value::from(kb * 1024));
            }
        }
    }

    Value::Object(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::{HeaderName, HeaderValue};

    fn request_with_header(name: &str, value: &str) -> Request<Body> {
        let mut req = Request::new(Body::empty());
        req.headers_mut().insert(
            name.parse::<HeaderName>().expect("valid header name"),
            HeaderValue::from_str(value).expect("valid header value"),
        );
        req
    }

    #[test]
    fn prefers_x_real_ip_header() {
        let req = request_with_header("x-real-ip", "203.0.113.7");
        assert_eq!(client_ip(&req), Some("203.0.113.7".to_string()));
    }

    #[test]
    fn falls_back_to_forwarded_for_first_hop() {
        let req = request_with_header("x-forwarded-for", "198.51.100.2, 10.0.0.1");
        assert_eq!(client_ip(&req), Some("198.51.100.2".to_string()));
    }

    #[test]
    fn no_headers_no_conn_info_yields_none() {
        let req = Request::new(Body::empty());
        assert_eq!(client_ip(&req), None);
    }
}
