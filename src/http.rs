//! HTTP 辅助工具：监听方案、反向代理头、对外地址推导、CORS 与安全头。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, header};
use axum::{middleware, response::Response};
use std::net::IpAddr;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::config::{
    HEADER_HANDLER_DIAG, HEADER_ITEM_VERSION, HEADER_LOCK, HEADER_LOCK_FAILURE_REASON,
    HEADER_OLD_LOCK,
};

/// 浏览器内编辑器需要读取的 WOPI 响应头。
const EXPOSED_WOPI_HEADERS: [&str; 5] = [
    HEADER_ITEM_VERSION,
    HEADER_LOCK,
    HEADER_OLD_LOCK,
    HEADER_LOCK_FAILURE_REASON,
    HEADER_HANDLER_DIAG,
];

/// 请求到达的监听器类型，由各监听器以 `Extension` 注入。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestScheme {
    Http,
    Https,
}

impl RequestScheme {
    fn as_str(self) -> &'static str {
        match self {
            RequestScheme::Http => "http",
            RequestScheme::Https => "https",
        }
    }

    /// 反向代理声明的 `x-forwarded-proto` 优先于监听器类型。
    pub fn effective(self, headers: &HeaderMap) -> Self {
        match forwarded_value(headers, "x-forwarded-proto") {
            Some(proto) if proto.eq_ignore_ascii_case("https") => RequestScheme::Https,
            Some(_) => RequestScheme::Http,
            None => self,
        }
    }
}

/// CORS Layer：逗号分隔的来源列表，并暴露 WOPI 响应头。
pub fn build_cors_layer(cors_origins: Option<&str>) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = cors_origins?
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| {
            HeaderValue::from_str(origin)
                .inspect_err(|_| warn!(origin, "invalid cors origin"))
                .ok()
        })
        .collect();
    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers(EXPOSED_WOPI_HEADERS.map(HeaderName::from_static)),
    )
}

/// 客户端 IP：`x-forwarded-for` 的第一跳，否则为连接地址。
pub fn resolve_client_ip(headers: &HeaderMap, connect_ip: Option<IpAddr>) -> Option<IpAddr> {
    forwarded_value(headers, "x-forwarded-for")
        .and_then(|value| value.parse::<IpAddr>().ok())
        .or(connect_ip)
}

/// 推导对外可见的基础地址：优先使用配置的公开地址，否则由请求的 Host 头拼出。
pub fn request_base_url(
    public_url: Option<&str>,
    headers: &HeaderMap,
    scheme: RequestScheme,
) -> String {
    if let Some(url) = public_url {
        return url.trim_end_matches('/').to_string();
    }
    let host = forwarded_value(headers, "x-forwarded-host")
        .or_else(|| headers.get(header::HOST).and_then(|value| value.to_str().ok()))
        .unwrap_or("localhost");
    format!("{}://{host}", scheme.effective(headers).as_str())
}

/// 逗号分隔转发头的第一个非空值。
fn forwarded_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// 为所有响应加上基础安全头。
pub async fn add_security_headers(request: Request<AxumBody>, next: middleware::Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}
