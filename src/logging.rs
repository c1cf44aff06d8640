use axum::http::HeaderMap;
use std::time::Duration;

/// 日志等级：
/// - off：只保留常规 tracing 输出
/// - low：额外打印客户端请求/响应块（脱敏）
/// - medium：再加上后端请求/响应块（脱敏）
/// - high：同 medium，但不截断响应体
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Low,
            "medium" | "backend" => Self::Medium,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn client_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Medium
    }

    pub fn raw_enabled(self) -> bool {
        self >= Self::High
    }
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

pub fn client_request(method: &str, path: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n===================== 客户端请求 ======================\n[客户端请求] {method} {path}\n[客户端请求头]\n{}\n{}\n=========================================================",
        format_headers(headers),
        format_body(body, 4 * 1024),
    );
}

pub fn client_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n===================== 客户端响应 ======================\n[客户端响应] {} {}ms\n{}\n=========================================================",
        status,
        format_duration_ms(duration),
        format_body(body, 4 * 1024),
    );
}

pub fn backend_request(method: &str, url: &str, body: &[u8]) {
    tracing::info!(
        "\n====================== 后端请求 ========================\n[后端请求] {method} {url}\n{}\n=========================================================",
        format_body(body, 4 * 1024),
    );
}

/// high 等级不截断响应体，其余按 4KiB 截断。
pub fn backend_response(level: LogLevel, status: u16, duration: Duration, body: &[u8]) {
    let limit = if level.raw_enabled() {
        usize::MAX
    } else {
        4 * 1024
    };
    tracing::info!(
        "\n====================== 后端响应 ========================\n[后端响应] {} {}ms\n{}\n=========================================================",
        status,
        format_duration_ms(duration),
        format_body(body, limit),
    );
}

/// cookie 与认证头不落日志。
fn format_headers(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers {
        let name_str = name.as_str();
        let shown = if is_sensitive_header(name_str) {
            "<redacted>"
        } else {
            value.to_str().unwrap_or("<binary>")
        };
        out.push_str(name_str);
        out.push_str(": ");
        out.push_str(shown);
        out.push('\n');
    }
    out.pop();
    out
}

fn is_sensitive_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "cookie" | "set-cookie" | "authorization" | "proxy-authorization"
    )
}

fn format_body(body: &[u8], limit: usize) -> String {
    if body.is_empty() {
        return "[空内容]".to_string();
    }
    let text = String::from_utf8_lossy(body);
    if text.len() <= limit {
        return text.into_owned();
    }
    // 截断点退到字符边界，多字节字符切半会 panic
    let mut cut = limit;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…（截断，共 {} 字节）", &text[..cut], body.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn log_level_parse() {
        assert_eq!(LogLevel::parse("off"), LogLevel::Off);
        assert_eq!(LogLevel::parse("LOW"), LogLevel::Low);
        assert_eq!(LogLevel::parse(" medium "), LogLevel::Medium);
        assert_eq!(LogLevel::parse("high"), LogLevel::High);
        assert_eq!(LogLevel::parse("garbage"), LogLevel::Off);

        assert!(LogLevel::Medium.client_enabled());
        assert!(!LogLevel::Low.backend_enabled());
        assert!(LogLevel::High.raw_enabled());
    }

    #[test]
    fn body_truncation_respects_char_boundaries() {
        // 4096 不是 3 字节字符的整数倍，裸字节切片会切在字符中间
        let body = "汉".repeat(2000);
        let out = format_body(body.as_bytes(), 4 * 1024);
        assert!(out.contains("截断"));
        assert!(out.contains("6000 字节"));

        let small = format_body("短文本".as_bytes(), 4 * 1024);
        assert_eq!(small, "短文本");

        assert_eq!(format_body(b"", 10), "[空内容]");
    }

    #[test]
    fn sensitive_headers_are_redacted() {
        let mut headers = HeaderMap::new();
        headers.insert("cookie", HeaderValue::from_static("secret=1"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));

        let formatted = format_headers(&headers);
        assert!(formatted.contains("cookie: <redacted>"));
        assert!(!formatted.contains("secret=1"));
        assert!(formatted.contains("x-request-id: abc"));
    }
}
