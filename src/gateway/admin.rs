//! 管理 HTTP 面：池的增删改查、monitor/fallback 配置、日志尾部与查询入口。
//!
//! 写操作在配置了 PPLX_ADMIN_TOKEN 时要求 Bearer 鉴权；读操作开放。

use crate::config::Config;
use crate::error::AppError;
use crate::logging;
use crate::perplexity::types::CleanResult;
use crate::pool::manager::MonitorConfigUpdate;
use crate::pool::types::TokenCredentials;
use crate::pool::{Pool, monitor};
use crate::query::{QueryError, QueryRequest, run_query};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

pub struct AdminState {
    pub pool: Arc<Pool>,
    pub cfg: Config,
}

pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/search", post(handle_search))
        .route("/pool/status", get(handle_pool_status))
        .route("/pool/export", get(handle_pool_export))
        .route("/pool/export/{id}", get(handle_pool_export_single))
        .route("/pool/import", post(handle_pool_import))
        .route("/pool/{action}", post(handle_pool_action))
        .route(
            "/monitor/config",
            get(handle_monitor_config_get).post(handle_monitor_config_set),
        )
        .route("/monitor/test", post(handle_monitor_test))
        .route(
            "/fallback/config",
            get(handle_fallback_config_get).post(handle_fallback_config_set),
        )
        .route("/logs/tail", get(handle_logs_tail))
        .with_state(state)
}

// ======================= 鉴权 =======================

/// 写操作鉴权：未配置 admin token 时放行（内网部署场景）。
fn require_admin(state: &AdminState, headers: &HeaderMap) -> Result<(), AppError> {
    let expected = state.cfg.admin_token.trim();
    if expected.is_empty() {
        return Ok(());
    }
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    if provided != expected {
        return Err(AppError::unauthorized("admin token 缺失或不正确"));
    }
    Ok(())
}

// ======================= 通用响应 =======================

#[derive(Serialize)]
struct OkMessage {
    status: &'static str,
    message: String,
}

fn ok_message(message: impl Into<String>) -> Json<OkMessage> {
    Json(OkMessage {
        status: "ok",
        message: message.into(),
    })
}

#[derive(Serialize)]
struct OkData<T> {
    status: &'static str,
    data: T,
}

fn ok_data<T: Serialize>(data: T) -> Json<OkData<T>> {
    Json(OkData { status: "ok", data })
}

// ======================= 健康与状态 =======================

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    service: &'static str,
    pool: HealthPool,
}

#[derive(Serialize)]
struct HealthPool {
    total: usize,
    available: usize,
}

async fn handle_health(State(state): State<Arc<AdminState>>) -> Json<HealthBody> {
    let status = state.pool.status().await;
    Json(HealthBody {
        status: "healthy",
        service: "pplx2api",
        pool: HealthPool {
            total: status.total,
            available: status.available,
        },
    })
}

async fn handle_pool_status(State(state): State<Arc<AdminState>>) -> Response {
    Json(state.pool.status().await).into_response()
}

// ======================= 查询入口 =======================

#[derive(Deserialize)]
struct SearchBody {
    query: String,
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    sources: Option<Vec<String>>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    incognito: bool,
}

fn default_mode() -> String {
    "auto".to_string()
}

#[derive(Serialize)]
struct QueryErrorBody {
    status: &'static str,
    error_type: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    earliest_available_at: Option<String>,
}

async fn handle_search(
    State(state): State<Arc<AdminState>>,
    headers: HeaderMap,
    Json(body): Json<SearchBody>,
) -> Response {
    let start = Instant::now();
    let log_enabled = state.cfg.log_level().client_enabled();
    if log_enabled {
        logging::client_request("POST", "/search", &headers, body.query.as_bytes());
    }

    let request = QueryRequest {
        query: body.query,
        mode: body.mode,
        model: body.model,
        sources: body.sources,
        files: None,
        language: body.language,
        incognito: body.incognito,
    };

    let response = match run_query(&state.pool, request).await {
        Ok(clean) => (StatusCode::OK, ok_data::<CleanResult>(clean)).into_response(),
        Err(e) => query_error_response(e),
    };
    if log_enabled {
        logging::client_response(response.status().as_u16(), start.elapsed(), &[]);
    }
    response
}

fn query_error_response(err: QueryError) -> Response {
    let (status, error_type, earliest) = match &err {
        QueryError::Validation(_) => (StatusCode::BAD_REQUEST, "ValidationError".to_string(), None),
        QueryError::AllUnavailable { earliest_backoff } => (
            StatusCode::SERVICE_UNAVAILABLE,
            "AllUnavailable".to_string(),
            *earliest_backoff,
        ),
        QueryError::Exhausted {
            kind,
            earliest_backoff,
            ..
        } => (
            StatusCode::BAD_GATEWAY,
            kind.as_str().to_string(),
            *earliest_backoff,
        ),
    };
    let body = QueryErrorBody {
        status: "error",
        error_type,
        message: err.to_string(),
        earliest_available_at: earliest
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
            .map(|dt| dt.to_rfc3339()),
    };
    (status, Json(body)).into_response()
}

// ======================= 池管理 =======================

#[derive(Deserialize, Default)]
struct PoolActionBody {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    csrf_token: Option<String>,
    #[serde(default)]
    session_token: Option<String>,
    #[serde(default)]
    tokens: Option<Vec<TokenCredentials>>,
}

fn parse_body<T: serde::de::DeserializeOwned + Default>(body: &Bytes) -> T {
    if body.is_empty() {
        return T::default();
    }
    sonic_rs::from_slice(body).unwrap_or_default()
}

#[derive(Serialize)]
struct ClientBrief {
    id: String,
    available: bool,
    enabled: bool,
}

#[derive(Serialize)]
struct ClientList {
    clients: Vec<ClientBrief>,
}

async fn handle_pool_action(
    State(state): State<Arc<AdminState>>,
    AxumPath(action): AxumPath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let body: PoolActionBody = parse_body(&body);

    match action.as_str() {
        "list" => {
            let status = state.pool.status().await;
            let clients = status
                .clients
                .into_iter()
                .map(|c| ClientBrief {
                    id: c.id,
                    available: c.available,
                    enabled: c.enabled,
                })
                .collect();
            Ok(ok_data(ClientList { clients }).into_response())
        }
        "add" => {
            require_admin(&state, &headers)?;
            let (Some(id), Some(csrf), Some(session)) =
                (body.id, body.csrf_token, body.session_token)
            else {
                return Err(AppError::bad_request("缺少必填参数 id/csrf_token/session_token"));
            };
            state
                .pool
                .add_token(TokenCredentials::new(id.clone(), csrf, session))
                .await
                .map_err(|e| AppError::bad_request(e.to_string()))?;

            // 新 token 立即做一次单客户端健康检查，不等下一个 monitor 周期
            let pool = state.pool.clone();
            let check_id = id.clone();
            tokio::spawn(async move {
                monitor::run_cycle(&pool, Some(&check_id)).await;
            });

            Ok(ok_message(format!("客户端 '{id}' 已添加")).into_response())
        }
        "remove" | "enable" | "disable" | "reset" => {
            require_admin(&state, &headers)?;
            let Some(id) = body.id else {
                return Err(AppError::bad_request("缺少必填参数 id"));
            };
            let result = match action.as_str() {
                "remove" => state.pool.remove_token(&id).await,
                "enable" => state.pool.enable_token(&id).await,
                "disable" => state.pool.disable_token(&id).await,
                _ => state.pool.reset_token(&id).await,
            };
            result.map_err(|e| AppError::bad_request(e.to_string()))?;
            Ok(ok_message(format!("客户端 '{id}' 操作 {action} 完成")).into_response())
        }
        "user_info" => {
            if let Some(id) = &body.id
                && !state.pool.has_token(id).await
            {
                return Err(AppError::not_found(format!("客户端 '{id}' 不存在")));
            }
            // HTTP 拉取在池锁之外执行
            let info = state.pool.user_info(body.id.as_deref()).await;
            Ok(ok_data(info).into_response())
        }
        "export" => Ok(Json(state.pool.export_config().await).into_response()),
        "import" => {
            require_admin(&state, &headers)?;
            let tokens = body.tokens.unwrap_or_default();
            if tokens.is_empty() {
                return Err(AppError::bad_request("请求体中没有 tokens"));
            }
            let report = state.pool.import_tokens(tokens).await;
            Ok(ok_data(report).into_response())
        }
        other => Err(AppError::bad_request(format!("未知操作: {other}"))),
    }
}

async fn handle_pool_export(State(state): State<Arc<AdminState>>) -> Response {
    Json(state.pool.export_config().await).into_response()
}

async fn handle_pool_export_single(
    State(state): State<Arc<AdminState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Response, AppError> {
    match state.pool.export_token(&id).await {
        Some(token) => Ok(Json(vec![token]).into_response()),
        None => Err(AppError::not_found(format!("客户端 '{id}' 不存在"))),
    }
}

async fn handle_pool_import(
    State(state): State<Arc<AdminState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    require_admin(&state, &headers)?;

    // 兼容两种格式：裸数组，或 {"tokens": [...]} 对象
    let tokens: Vec<TokenCredentials> = match sonic_rs::from_slice::<Vec<TokenCredentials>>(&body) {
        Ok(v) => v,
        Err(_) => parse_body::<PoolActionBody>(&body).tokens.unwrap_or_default(),
    };
    if tokens.is_empty() {
        return Err(AppError::bad_request("请求体中没有 tokens"));
    }
    Ok(ok_data(state.pool.import_tokens(tokens).await).into_response())
}

// ======================= monitor =======================

async fn handle_monitor_config_get(State(state): State<Arc<AdminState>>) -> Response {
    #[derive(Serialize)]
    struct Body {
        status: &'static str,
        config: crate::pool::persist::MonitorConfig,
    }
    Json(Body {
        status: "ok",
        config: state.pool.monitor_config().await,
    })
    .into_response()
}

async fn handle_monitor_config_set(
    State(state): State<Arc<AdminState>>,
    headers: HeaderMap,
    Json(update): Json<MonitorConfigUpdate>,
) -> Result<Response, AppError> {
    require_admin(&state, &headers)?;
    let config = state.pool.set_monitor_config(update).await;

    #[derive(Serialize)]
    struct Body {
        status: &'static str,
        config: crate::pool::persist::MonitorConfig,
    }
    Ok(Json(Body {
        status: "ok",
        config,
    })
    .into_response())
}

#[derive(Deserialize, Default)]
struct MonitorTestBody {
    #[serde(default)]
    id: Option<String>,
}

async fn handle_monitor_test(
    State(state): State<Arc<AdminState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    require_admin(&state, &headers)?;
    let body: MonitorTestBody = parse_body(&body);
    if let Some(id) = &body.id
        && !state.pool.has_token(id).await
    {
        return Err(AppError::not_found(format!("客户端 '{id}' 不存在")));
    }

    let report = monitor::run_cycle(&state.pool, body.id.as_deref()).await;

    #[derive(Serialize)]
    struct Body {
        status: &'static str,
        results: monitor::MonitorReport,
    }
    Ok(Json(Body {
        status: "ok",
        results: report,
    })
    .into_response())
}

// ======================= fallback =======================

async fn handle_fallback_config_get(State(state): State<Arc<AdminState>>) -> Response {
    #[derive(Serialize)]
    struct Body {
        status: &'static str,
        config: crate::pool::persist::FallbackConfig,
    }
    Json(Body {
        status: "ok",
        config: state.pool.fallback_config().await,
    })
    .into_response()
}

#[derive(Deserialize)]
struct FallbackUpdate {
    fallback_to_auto: bool,
}

async fn handle_fallback_config_set(
    State(state): State<Arc<AdminState>>,
    headers: HeaderMap,
    Json(update): Json<FallbackUpdate>,
) -> Result<Response, AppError> {
    require_admin(&state, &headers)?;
    let config = state.pool.set_fallback_config(update.fallback_to_auto).await;

    #[derive(Serialize)]
    struct Body {
        status: &'static str,
        config: crate::pool::persist::FallbackConfig,
    }
    Ok(Json(Body {
        status: "ok",
        config,
    })
    .into_response())
}

// ======================= 日志尾部 =======================

#[derive(Deserialize, Default)]
struct TailQuery {
    #[serde(default)]
    lines: Option<usize>,
}

#[derive(Serialize)]
struct TailBody {
    status: &'static str,
    lines: Vec<String>,
    file_size: u64,
}

async fn handle_logs_tail(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<TailQuery>,
) -> Result<Response, AppError> {
    let log_file = state.cfg.log_file.trim().to_string();
    if log_file.is_empty() {
        return Err(AppError::not_found("未配置 LOG_FILE，无日志可读"));
    }
    let count = query.lines.unwrap_or(100).min(1000);

    let result =
        tokio::task::spawn_blocking(move || tail_file(Path::new(&log_file), count))
            .await
            .map_err(|e| AppError::backend(e.to_string()))?;

    match result {
        Ok((lines, file_size)) => Ok(Json(TailBody {
            status: "ok",
            lines,
            file_size,
        })
        .into_response()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(AppError::not_found("日志文件不存在"))
        }
        Err(e) => Err(AppError::Io(e)),
    }
}

/// 从文件尾部按 8KB 块向前读，直到凑够 n 行。
fn tail_file(path: &Path, n: usize) -> std::io::Result<(Vec<String>, u64)> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = std::fs::File::open(path)?;
    let file_size = file.metadata()?.len();
    if file_size == 0 {
        return Ok((Vec::new(), 0));
    }

    const BLOCK: u64 = 8192;
    let mut buffer: Vec<u8> = Vec::new();
    let mut remaining = file_size;

    while remaining > 0 {
        let read_size = remaining.min(BLOCK);
        remaining -= read_size;
        file.seek(SeekFrom::Start(remaining))?;
        let mut chunk = vec![0u8; read_size as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&buffer);
        buffer = chunk;

        let line_count = buffer.iter().filter(|&&b| b == b'\n').count();
        if line_count > n {
            break;
        }
    }

    let text = String::from_utf8_lossy(&buffer);
    let lines: Vec<String> = text.lines().map(str::to_string).collect();
    let start = lines.len().saturating_sub(n);
    Ok((lines[start..].to_vec(), file_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_reads_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let content: String = (1..=250).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&path, &content).unwrap();

        let (lines, size) = tail_file(&path, 100).unwrap();
        assert_eq!(lines.len(), 100);
        assert_eq!(lines.first().unwrap(), "line 151");
        assert_eq!(lines.last().unwrap(), "line 250");
        assert_eq!(size, content.len() as u64);
    }

    #[test]
    fn tail_handles_small_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.log");
        std::fs::write(&path, "only one line\n").unwrap();
        let (lines, _) = tail_file(&path, 100).unwrap();
        assert_eq!(lines, vec!["only one line".to_string()]);

        let empty = dir.path().join("empty.log");
        std::fs::write(&empty, "").unwrap();
        let (lines, size) = tail_file(&empty, 100).unwrap();
        assert!(lines.is_empty());
        assert_eq!(size, 0);

        assert!(tail_file(&dir.path().join("missing.log"), 10).is_err());
    }
}
