//! Perplexity 会话句柄：一个 cookie 凭证 + 一个独立的 HTTP 连接池。
//!
//! 会话只暴露固定能力集 `search` / `fetch_rate_limits` / `fetch_user_info`，
//! 供客户端池在其上做调度；cookie 在构造时深拷贝，构造后外部不可再影响会话状态。

use crate::logging::{self, LogLevel};
use crate::perplexity::sse;
use crate::perplexity::types::{
    ModeQuota, RateLimits, SearchRequest, SearchResponse, UserInfo, model_preference,
};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use sonic_rs::{JsonContainerTrait, JsonValueTrait};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

const API_BASE_URL: &str = "https://www.perplexity.ai";
const API_VERSION: &str = "2.18";

const ENDPOINT_AUTH_SESSION: &str = "/api/auth/session";
const ENDPOINT_SSE_ASK: &str = "/rest/sse/perplexity_ask";
const ENDPOINT_UPLOAD_URL: &str = "/rest/uploads/create_upload_url";
const ENDPOINT_RATE_LIMIT: &str = "/rest/rate-limit";
const ENDPOINT_RATE_LIMIT_STATUS: &str = "/rest/rate-limit/status";

/// cookie 名 → 值。BTreeMap 保证序列化顺序稳定。
pub type CookieMap = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("Perplexity API 错误 {status}: {message}")]
    Http { status: u16, message: String },

    #[error("上游响应为空（连接可能已中断，未收到 end_of_stream 标记）")]
    EmptyResponse,

    #[error("deep research 请求被静默降级为普通 pro 回答")]
    SilentDowngrade,

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] sonic_rs::Error),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// 会话能力集。调度层只依赖该 trait，测试用 mock 实现替换。
#[async_trait]
pub trait Session: Send + Sync {
    /// 执行一次查询。流结束于 end_of_stream 标记时返回最终消息，
    /// 否则以 `EmptyResponse` 失败，绝不静默返回空值。
    async fn search(&self, req: &SearchRequest) -> Result<SearchResponse, ApiError>;

    /// 拉取配额快照。不消耗任何用户配额。
    async fn fetch_rate_limits(&self) -> Result<RateLimits, ApiError>;

    /// 拉取登录会话信息，用于健康检查判定 session 是否有效。
    async fn fetch_user_info(&self) -> Result<UserInfo, ApiError>;
}

/// 会话构造参数（来自全局配置）。
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub timeout: Duration,
    pub socks_proxy: Option<String>,
    pub log_level: LogLevel,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(900),
            socks_proxy: None,
            log_level: LogLevel::Off,
        }
    }
}

/// 基于 reqwest 的真实会话。每个会话持有独立连接池，互不共享。
pub struct SessionClient {
    http: reqwest::Client,
    cookie_header: Option<HeaderValue>,
    /// 是否为登录会话（带 cookie）。匿名会话不允许选择模型。
    own: bool,
    timeout: Duration,
    log_level: LogLevel,
}

impl SessionClient {
    /// 构造会话。cookie map 在此处整体拷贝，调用方之后的修改不影响会话。
    pub fn new(cookies: &CookieMap, opts: &SessionOptions) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .default_headers(browser_headers())
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .gzip(true);

        if let Some(proxy) = &opts.socks_proxy {
            // 格式 socks5://[user[:pass]@]host[:port][#remark]，去掉 remark 再用。
            let url = proxy.split('#').next().unwrap_or(proxy).trim();
            if !url.is_empty() {
                builder = builder.proxy(reqwest::Proxy::all(url)?);
            }
        }

        let cookie_header = build_cookie_header(cookies);
        Ok(Self {
            http: builder.build()?,
            cookie_header,
            own: !cookies.is_empty(),
            timeout: opts.timeout,
            log_level: opts.log_level,
        })
    }

    fn log_request(&self, method: &str, url: &str, body: &[u8]) {
        if self.log_level.backend_enabled() {
            logging::backend_request(method, url, body);
        }
    }

    fn log_response(&self, status: u16, start: Instant, body: &[u8]) {
        if self.log_level.backend_enabled() {
            logging::backend_response(self.log_level, status, start.elapsed(), body);
        }
    }

    pub fn is_own(&self) -> bool {
        self.own
    }

    fn url(&self, path: &str) -> String {
        format!("{API_BASE_URL}{path}")
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let mut rb = self.http.get(self.url(path)).timeout(self.timeout);
        if let Some(cookie) = &self.cookie_header {
            rb = rb.header(reqwest::header::COOKIE, cookie.clone());
        }
        rb
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut rb = self.http.post(self.url(path)).timeout(self.timeout);
        if let Some(cookie) = &self.cookie_header {
            rb = rb.header(reqwest::header::COOKIE, cookie.clone());
        }
        rb
    }

    /// 上传单个文件：先向上游申请 S3 表单，再以 multipart 提交。
    async fn upload_file(&self, filename: &str, data: &[u8]) -> Result<String, ApiError> {
        let content_type = guess_mime(filename);

        let create_body = sonic_rs::to_vec(&CreateUploadPayload {
            content_type,
            file_size: data.len(),
            filename,
            force_image: false,
            source: "default",
        })?;
        self.log_request("POST", &self.url(ENDPOINT_UPLOAD_URL), &create_body);
        let start = Instant::now();
        let create = self
            .post(ENDPOINT_UPLOAD_URL)
            .query(&[("version", API_VERSION), ("source", "default")])
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(create_body)
            .send()
            .await?;

        let status = create.status();
        let bytes = create.bytes().await?;
        self.log_response(status.as_u16(), start, &bytes);
        if !status.is_success() {
            return Err(http_error(status.as_u16(), &bytes));
        }
        let info: sonic_rs::Value = sonic_rs::from_slice(&bytes)?;

        let bucket_url = info
            .get("s3_bucket_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ApiError::Validation("File upload error: missing s3_bucket_url".to_string()))?
            .to_string();
        let object_url = info
            .get("s3_object_url")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let mut form = reqwest::multipart::Form::new();
        if let Some(fields) = info.get("fields").and_then(|v| v.as_object()) {
            for (k, v) in fields.iter() {
                let value = v
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| sonic_rs::to_string(v).unwrap_or_default());
                form = form.text(k.to_string(), value);
            }
        }
        let part = reqwest::multipart::Part::bytes(data.to_vec())
            .file_name(filename.to_string())
            .mime_str(content_type)
            .map_err(|e| ApiError::Validation(format!("File upload error: {e}")))?;
        form = form.part("file", part);

        // multipart 表单体不落日志，只记目标与结果
        self.log_request("POST", &bucket_url, &[]);
        let start = Instant::now();
        let upload = self
            .http
            .post(&bucket_url)
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await?;
        let status = upload.status();
        if !status.is_success() {
            let bytes = upload.bytes().await.unwrap_or_default();
            self.log_response(status.as_u16(), start, &bytes);
            return Err(http_error(status.as_u16(), &bytes));
        }
        self.log_response(status.as_u16(), start, &[]);

        // 图片上传会返回带签名段的 secure_url，规整为稳定路径。
        if object_url.contains("image/upload") {
            let body: sonic_rs::Value = sonic_rs::from_slice(&upload.bytes().await?)?;
            if let Some(secure) = body.get("secure_url").and_then(|v| v.as_str()) {
                return Ok(normalize_image_url(secure));
            }
        }
        Ok(object_url)
    }
}

#[async_trait]
impl Session for SessionClient {
    async fn search(&self, req: &SearchRequest) -> Result<SearchResponse, ApiError> {
        req.validate()?;
        if req.model.is_some() && !self.own {
            return Err(ApiError::Validation(
                "Model selection requires an account with cookies.".to_string(),
            ));
        }
        let preference = model_preference(req.mode, req.model.as_deref())?;

        let mut attachments = Vec::with_capacity(req.files.len());
        for (filename, data) in &req.files {
            attachments.push(self.upload_file(filename, data).await?);
        }

        let sources: Vec<&str> = req.sources.iter().map(|s| s.as_str()).collect();
        let payload = AskPayload {
            query_str: &req.query,
            params: AskParams {
                attachments,
                frontend_context_uuid: Uuid::new_v4().to_string(),
                frontend_uuid: Uuid::new_v4().to_string(),
                is_incognito: req.incognito,
                language: &req.language,
                last_backend_uuid: None,
                mode: req.mode.wire_mode(),
                model_preference: preference,
                source: "default",
                sources,
                version: API_VERSION,
            },
        };

        let ask_body = sonic_rs::to_vec(&payload)?;
        self.log_request("POST", &self.url(ENDPOINT_SSE_ASK), &ask_body);
        let start = Instant::now();
        let resp = self
            .post(ENDPOINT_SSE_ASK)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .body(ask_body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let bytes = resp.bytes().await?;
            self.log_response(status.as_u16(), start, &bytes);
            return Err(http_error(status.as_u16(), &bytes));
        }

        // SSE 流不在内存里重组，这里只记状态与耗时
        let result = sse::collect_final(resp).await;
        self.log_response(status.as_u16(), start, &[]);
        result
    }

    async fn fetch_rate_limits(&self) -> Result<RateLimits, ApiError> {
        let mut limits = RateLimits {
            fetched_at: chrono::Utc::now().timestamp(),
            ..Default::default()
        };

        self.log_request("GET", &self.url(ENDPOINT_RATE_LIMIT), &[]);
        let start = Instant::now();
        let resp = self
            .get(ENDPOINT_RATE_LIMIT)
            .query(&[("version", API_VERSION), ("source", "default")])
            .send()
            .await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        self.log_response(status.as_u16(), start, &bytes);
        if !status.is_success() {
            return Err(http_error(status.as_u16(), &bytes));
        }
        let body: sonic_rs::Value = sonic_rs::from_slice(&bytes)?;
        limits.pro_remaining = body.get("remaining").and_then(|v| v.as_i64());

        self.log_request("GET", &self.url(ENDPOINT_RATE_LIMIT_STATUS), &[]);
        let start = Instant::now();
        let resp = self
            .get(ENDPOINT_RATE_LIMIT_STATUS)
            .query(&[("version", API_VERSION), ("source", "default")])
            .send()
            .await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        self.log_response(status.as_u16(), start, &bytes);
        if !status.is_success() {
            return Err(http_error(status.as_u16(), &bytes));
        }
        let body: sonic_rs::Value = sonic_rs::from_slice(&bytes)?;
        if let Some(modes) = body.get("modes").and_then(|v| v.as_object()) {
            for (name, data) in modes.iter() {
                let detail = data.get("remaining_detail");
                limits.modes.insert(
                    name.to_string(),
                    ModeQuota {
                        available: data.get("available").and_then(|v| v.as_bool()).unwrap_or(false),
                        remaining: detail
                            .as_ref()
                            .and_then(|d| d.get("remaining"))
                            .and_then(|v| v.as_i64()),
                        kind: detail
                            .as_ref()
                            .and_then(|d| d.get("kind"))
                            .and_then(|v| v.as_str())
                            .map(str::to_string),
                    },
                );
            }
        }

        Ok(limits)
    }

    async fn fetch_user_info(&self) -> Result<UserInfo, ApiError> {
        self.log_request("GET", &self.url(ENDPOINT_AUTH_SESSION), &[]);
        let start = Instant::now();
        let resp = self.get(ENDPOINT_AUTH_SESSION).send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        self.log_response(status.as_u16(), start, &bytes);
        if !status.is_success() {
            return Err(http_error(status.as_u16(), &bytes));
        }
        Ok(sonic_rs::from_slice(&bytes)?)
    }
}

#[derive(Serialize)]
struct CreateUploadPayload<'a> {
    content_type: &'a str,
    file_size: usize,
    filename: &'a str,
    force_image: bool,
    source: &'a str,
}

#[derive(Serialize)]
struct AskPayload<'a> {
    query_str: &'a str,
    params: AskParams<'a>,
}

#[derive(Serialize)]
struct AskParams<'a> {
    attachments: Vec<String>,
    frontend_context_uuid: String,
    frontend_uuid: String,
    is_incognito: bool,
    language: &'a str,
    last_backend_uuid: Option<&'a str>,
    mode: &'a str,
    model_preference: &'a str,
    source: &'a str,
    sources: Vec<&'a str>,
    version: &'a str,
}

/// 从错误响应体提取 message 字段，取不到则截断原文。
fn http_error(status: u16, body: &[u8]) -> ApiError {
    let message = sonic_rs::from_slice::<sonic_rs::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .and_then(|m| m.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| {
            let text = String::from_utf8_lossy(body);
            let mut t = text.trim().to_string();
            if t.len() > 200 {
                let mut cut = 200;
                while !t.is_char_boundary(cut) {
                    cut -= 1;
                }
                t.truncate(cut);
            }
            t
        });
    ApiError::Http { status, message }
}

/// Chrome 档位的默认请求头，用于绕过上游的机器人拦截。
fn browser_headers() -> HeaderMap {
    let mut h = HeaderMap::new();
    let entries: [(&str, &str); 10] = [
        ("accept-language", "en-US,en;q=0.9"),
        ("dnt", "1"),
        ("sec-ch-ua", "\"Not;A=Brand\";v=\"24\", \"Chromium\";v=\"128\""),
        ("sec-ch-ua-mobile", "?0"),
        ("sec-ch-ua-platform", "\"Windows\""),
        ("sec-fetch-dest", "empty"),
        ("sec-fetch-mode", "cors"),
        ("sec-fetch-site", "same-origin"),
        ("upgrade-insecure-requests", "1"),
        (
            "user-agent",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/128.0.0.0 Safari/537.36",
        ),
    ];
    for (name, value) in entries {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            h.insert(name, value);
        }
    }
    h
}

fn build_cookie_header(cookies: &CookieMap) -> Option<HeaderValue> {
    if cookies.is_empty() {
        return None;
    }
    let joined = cookies
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("; ");
    HeaderValue::from_str(&joined).ok()
}

/// 去掉 Cloudinary 风格 URL 里的签名/版本段。
fn normalize_image_url(secure_url: &str) -> String {
    let re = regex_for_image_url();
    re.replace(secure_url, "/private/user_uploads/").to_string()
}

fn regex_for_image_url() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"/private/s--.*?--/v\d+/user_uploads/").expect("图片 URL 正则非法")
    })
}

fn guess_mime(filename: &str) -> &'static str {
    let ext = filename.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "txt" | "md" => "text/plain",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "csv" => "text/csv",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "html" | "htm" => "text/html",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_map_is_copied_per_session() {
        // 两个会话从同一个 map 构造后互不影响；调用方随后的修改也不可见。
        let mut cookies = CookieMap::new();
        cookies.insert("next-auth.csrf-token".to_string(), "aaa".to_string());

        let opts = SessionOptions::default();
        let s1 = SessionClient::new(&cookies, &opts).unwrap();

        cookies.insert("next-auth.csrf-token".to_string(), "bbb".to_string());
        let s2 = SessionClient::new(&cookies, &opts).unwrap();

        let h1 = s1.cookie_header.as_ref().unwrap().to_str().unwrap().to_string();
        let h2 = s2.cookie_header.as_ref().unwrap().to_str().unwrap().to_string();
        assert!(h1.contains("aaa"));
        assert!(h2.contains("bbb"));

        cookies.clear();
        assert!(s1.cookie_header.is_some());
        assert!(s2.cookie_header.is_some());
    }

    #[test]
    fn anonymous_session_has_no_cookie_and_not_own() {
        let s = SessionClient::new(&CookieMap::new(), &SessionOptions::default()).unwrap();
        assert!(s.cookie_header.is_none());
        assert!(!s.is_own());
    }

    #[test]
    fn image_url_normalization() {
        let url = "https://res.example/private/s--Sig99--/v17/user_uploads/pic.png";
        assert_eq!(
            normalize_image_url(url),
            "https://res.example/private/user_uploads/pic.png"
        );
        // 非图片 URL 原样返回
        let plain = "https://bucket.example/private/user_uploads/doc.pdf";
        assert_eq!(normalize_image_url(plain), plain);
    }

    #[test]
    fn http_error_extracts_message_field() {
        let e = http_error(429, br#"{"message":"Rate limit exceeded"}"#);
        assert_eq!(e.status(), Some(429));
        assert!(e.to_string().contains("Rate limit exceeded"));

        let e = http_error(500, b"plain body");
        assert!(e.to_string().contains("plain body"));
    }
}
