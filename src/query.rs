//! 查询引擎：校验 → 跨进程同步 → 轮询重试 → 降级兜底。
//!
//! 轮询用 seen 集合保证每个客户端每次请求至多被访问一次（游标回绕产生的
//! 重复直接跳过），三级兜底链为：pro 客户端 → auto 模式复用同池 → 匿名一次性会话。

use crate::perplexity::client::{ApiError, CookieMap};
use crate::perplexity::types::{
    CleanResult, FallbackInfo, SearchMode, SearchRequest, Source, extract_clean_result,
};
use crate::pool::Pool;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// 错误分类。决定对客户端与对请求分别采取的动作。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Validation,
    SessionInvalid,
    QuotaExhausted,
    SilentDowngrade,
    EmptyResponse,
    Transient,
    Fatal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::SessionInvalid => "session_invalid",
            Self::QuotaExhausted => "quota_exhausted",
            Self::SilentDowngrade => "silent_downgrade",
            Self::EmptyResponse => "empty_response",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 账号级限额错误的关键词。必须整词匹配：裸 "pro"/"limit" 会误伤
/// "provide"、"process"、"unlimited" 之类的普通词。
fn client_limit_pattern() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?i)\b(pro queries|pro search|rate.?limit|quota|remaining|file upload)\b")
            .expect("限额关键词正则非法")
    })
}

pub fn is_client_limit_message(message: &str) -> bool {
    client_limit_pattern().is_match(message)
}

/// 把上游错误归入 §错误策略 的七类之一。
pub fn classify(err: &ApiError) -> FailureKind {
    match err {
        ApiError::Validation(msg) => {
            // 配额预检产生的 ValidationError（如 "No remaining pro queries."）
            // 语义上是账号限额，换下一个客户端而非直接失败。
            if is_client_limit_message(msg) {
                FailureKind::QuotaExhausted
            } else {
                FailureKind::Validation
            }
        }
        ApiError::Http { status, message } => match *status {
            401 | 403 => FailureKind::SessionInvalid,
            429 => FailureKind::QuotaExhausted,
            _ if is_client_limit_message(message) => FailureKind::QuotaExhausted,
            s if s >= 500 => FailureKind::Transient,
            _ => FailureKind::Fatal,
        },
        ApiError::EmptyResponse => FailureKind::EmptyResponse,
        ApiError::SilentDowngrade => FailureKind::SilentDowngrade,
        ApiError::Transport(_) => FailureKind::Transient,
        ApiError::Json(_) => FailureKind::Fatal,
    }
}

/// 调用方看到的查询入参（线上格式，未解析）。
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub query: String,
    pub mode: String,
    pub model: Option<String>,
    pub sources: Option<Vec<String>>,
    pub files: Option<BTreeMap<String, Vec<u8>>>,
    pub language: Option<String>,
    pub incognito: bool,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("{0}")]
    Validation(String),

    #[error("所有客户端当前均不可用{}", format_earliest(*earliest_backoff))]
    AllUnavailable { earliest_backoff: Option<i64> },

    #[error("查询失败（已尝试 {attempts} 个客户端，最后错误 {kind}）：{message}")]
    Exhausted {
        kind: FailureKind,
        message: String,
        attempts: usize,
        earliest_backoff: Option<i64>,
    },
}

fn format_earliest(ts: Option<i64>) -> String {
    match ts.and_then(|t| chrono::DateTime::from_timestamp(t, 0)) {
        Some(dt) => format!("，最早恢复时间 {}", dt.to_rfc3339()),
        None => String::new(),
    }
}

/// 执行一次查询。成功返回精简结果，失败返回结构化错误。
pub async fn run_query(pool: &Pool, req: QueryRequest) -> Result<CleanResult, QueryError> {
    // ---------- 1. 无状态校验 ----------
    let Some(mode) = SearchMode::parse(&req.mode) else {
        return Err(QueryError::Validation(format!(
            "Invalid mode '{}'. Must be one of: auto, pro, reasoning, deep research",
            req.mode
        )));
    };

    let mut sources = Vec::new();
    for raw in req.sources.as_deref().unwrap_or(&[]) {
        let Some(s) = Source::parse(raw) else {
            return Err(QueryError::Validation(format!(
                "Invalid sources: {raw}. Valid sources: web, scholar, social"
            )));
        };
        sources.push(s);
    }
    if sources.is_empty() {
        sources.push(Source::Web);
    }

    let request = SearchRequest {
        query: req.query.trim().to_string(),
        mode,
        model: req.model.clone(),
        sources,
        files: req.files.unwrap_or_default(),
        language: req.language.unwrap_or_else(|| "en-US".to_string()),
        incognito: req.incognito,
    };
    request
        .validate()
        .map_err(|e| QueryError::Validation(e.to_string()))?;

    // ---------- 2. 跨进程状态同步 ----------
    pool.sync_from_disk().await;

    // ---------- 3. 主轮询 ----------
    let primary = rotate_once(pool, &request, mode).await;
    let primary_failed = match primary {
        RotateOutcome::Success(clean) => return Ok(clean),
        RotateOutcome::Validation(msg) => return Err(QueryError::Validation(msg)),
        RotateOutcome::Failed(f) => f,
    };

    // ---------- 4. auto 模式兜底 ----------
    let should_fallback = mode.is_pro_tier() && pool.fallback_to_auto_enabled().await;
    let mut last = primary_failed.last.clone();

    if should_fallback {
        // 用同一池子换 auto 模式重试：配额耗尽的客户端重新合格
        let mut auto_request = request.clone();
        auto_request.mode = SearchMode::Auto;
        auto_request.model = None;
        auto_request.files.clear();

        tracing::info!(
            original_mode = %mode,
            "pro 档轮询未成功，降级为 auto 模式重试"
        );
        match rotate_once(pool, &auto_request, SearchMode::Auto).await {
            RotateOutcome::Success(mut clean) => {
                clean.fallback = Some(FallbackInfo {
                    fallback: true,
                    fallback_mode: "auto".to_string(),
                    original_mode: Some(mode.as_str().to_string()),
                    original_model: req.model.clone(),
                });
                tracing::info!(original_mode = %mode, "auto 兜底成功");
                return Ok(clean);
            }
            RotateOutcome::Validation(msg) => return Err(QueryError::Validation(msg)),
            RotateOutcome::Failed(f) => {
                if f.last.is_some() {
                    last = f.last;
                }
            }
        }

        // ---------- 5. 匿名一次性会话兜底 ----------
        match anonymous_fallback(pool, &request).await {
            Ok(Some(mut clean)) => {
                clean.fallback = Some(FallbackInfo {
                    fallback: true,
                    fallback_mode: "anonymous_auto".to_string(),
                    original_mode: Some(mode.as_str().to_string()),
                    original_model: req.model.clone(),
                });
                tracing::info!("匿名 auto 兜底成功");
                return Ok(clean);
            }
            Ok(None) => {
                tracing::warn!("匿名 auto 兜底未返回有效回答");
            }
            Err(e) => {
                tracing::warn!("匿名 auto 兜底失败：{e:#}");
            }
        }
    }

    // ---------- 6. 汇总失败 ----------
    if primary_failed.none_available {
        return Err(QueryError::AllUnavailable {
            earliest_backoff: pool.earliest_backoff_until().await,
        });
    }
    let (kind, message) = last.unwrap_or((
        FailureKind::Fatal,
        "Request failed after multiple attempts.".to_string(),
    ));
    Err(QueryError::Exhausted {
        kind,
        message,
        attempts: primary_failed.attempts,
        earliest_backoff: pool.earliest_backoff_until().await,
    })
}

enum RotateOutcome {
    Success(CleanResult),
    Validation(String),
    Failed(RotateFailure),
}

#[derive(Debug, Clone)]
struct RotateFailure {
    last: Option<(FailureKind, String)>,
    attempts: usize,
    /// 首次 acquire 就一无所获：池里所有客户端都不可用。
    none_available: bool,
}

/// 按 seen 集合契约走一遍池子。每个不同客户端至多访问一次；
/// acquire 因游标回绕给出的重复 id 直接跳过。
async fn rotate_once(pool: &Pool, request: &SearchRequest, mode: SearchMode) -> RotateOutcome {
    let total = pool.len().await;
    if total == 0 {
        return RotateOutcome::Failed(RotateFailure {
            last: None,
            attempts: 0,
            none_available: true,
        });
    }
    let mut seen: HashSet<String> = HashSet::new();
    let mut last: Option<(FailureKind, String)> = None;

    for _ in 0..total.saturating_mul(2) {
        let Some((id, session)) = pool.acquire(mode).await else {
            if seen.is_empty() {
                return RotateOutcome::Failed(RotateFailure {
                    last: None,
                    attempts: 0,
                    none_available: true,
                });
            }
            break;
        };

        if seen.contains(&id) {
            if seen.len() >= total {
                break;
            }
            continue;
        }
        seen.insert(id.clone());

        tracing::debug!(client_id = %id, mode = %mode, "选中客户端，开始请求");
        // 会话调用在锁外进行；acquire 返回的 Arc 即本地引用
        match session.search(request).await {
            Ok(resp) if resp.is_empty() => {
                // 连接中断表现为空响应，换下一个客户端而不是崩溃
                last = Some((FailureKind::EmptyResponse, ApiError::EmptyResponse.to_string()));
                pool.record_failure(&id, mode, FailureKind::EmptyResponse).await;
            }
            Ok(resp) if mode == SearchMode::DeepResearch && !resp.is_research_shaped() => {
                // 静默降级：结构是普通 pro 回答。钉死该客户端的 research 配额。
                tracing::warn!(client_id = %id, "deep research 响应为 pro 形态，判定为静默降级");
                last = Some((
                    FailureKind::SilentDowngrade,
                    ApiError::SilentDowngrade.to_string(),
                ));
                pool.record_failure(&id, mode, FailureKind::SilentDowngrade).await;
            }
            Ok(resp) => {
                pool.record_success(&id, mode).await;
                return RotateOutcome::Success(extract_clean_result(&resp));
            }
            Err(e) => {
                let kind = classify(&e);
                if kind == FailureKind::Validation {
                    // 入参问题与客户端无关，立即上抛，不消耗重试机会
                    return RotateOutcome::Validation(e.to_string());
                }
                tracing::debug!(client_id = %id, kind = %kind, "请求失败：{e}");
                last = Some((kind, e.to_string()));
                pool.record_failure(&id, mode, kind).await;
            }
        }
    }

    let attempts = seen.len();
    RotateOutcome::Failed(RotateFailure {
        last,
        attempts,
        none_available: false,
    })
}

/// 最后一级兜底：空凭证的一次性会话，auto 模式 + 无痕。
/// 成功与否都不计入任何客户端的统计。
async fn anonymous_fallback(
    pool: &Pool,
    request: &SearchRequest,
) -> anyhow::Result<Option<CleanResult>> {
    let session = (pool.session_factory())(&CookieMap::new())?;
    let mut anon_request = request.clone();
    anon_request.mode = SearchMode::Auto;
    anon_request.model = None;
    anon_request.files.clear();
    anon_request.incognito = true;

    let resp = session.search(&anon_request).await?;
    if resp.is_empty() || resp.answer.is_none() {
        return Ok(None);
    }
    Ok(Some(extract_clean_result(&resp)))
}
