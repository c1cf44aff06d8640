//! 客户端包装：单个账号在池内的全部可变状态。

use crate::perplexity::client::{CookieMap, Session};
use crate::perplexity::types::{RateLimits, SearchMode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// 首次失败的冷却时长（秒）。
pub const INITIAL_BACKOFF_SECS: i64 = 60;
/// 冷却时长上限（秒）。
pub const MAX_BACKOFF_SECS: i64 = 3_600;

/// 配置文件里的一条 token。未知字段原样保留以便回写。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCredentials {
    pub id: String,
    pub csrf_token: String,
    pub session_token: String,
    #[serde(flatten)]
    pub extra: HashMap<String, sonic_rs::Value>,
}

impl TokenCredentials {
    pub fn new(id: impl Into<String>, csrf: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            csrf_token: csrf.into(),
            session_token: session.into(),
            extra: HashMap::new(),
        }
    }

    /// 构造会话用的 cookie 集合。会话构造方会再拷贝一次。
    pub fn cookie_map(&self) -> CookieMap {
        let mut m = CookieMap::new();
        m.insert("next-auth.csrf-token".to_string(), self.csrf_token.clone());
        m.insert(
            "__Secure-next-auth.session-token".to_string(),
            self.session_token.clone(),
        );
        m
    }
}

/// 展示/过滤用的派生状态。永不落盘为事实来源，每次读取重新计算。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Normal,
    Exhausted,
    Offline,
    Unknown,
}

impl ClientState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Exhausted => "exhausted",
            Self::Offline => "offline",
            Self::Unknown => "unknown",
        }
    }
}

/// 池内一个账号：凭证、会话句柄与调度所需的全部可变字段。
pub struct ClientWrapper {
    pub credentials: TokenCredentials,
    pub session: Arc<dyn Session>,
    pub enabled: bool,
    /// None=未检查，Some(true)=有效，Some(false)=已失效。
    pub session_valid: Option<bool>,
    pub rate_limits: Option<RateLimits>,
    pub last_check_at: Option<i64>,
    pub request_count: u64,
    pub fail_count: u64,
    /// now < backoff_until 时处于冷却，选择器跳过。
    pub backoff_until: i64,
    pub consecutive_failures: u32,
}

impl ClientWrapper {
    pub fn new(credentials: TokenCredentials, session: Arc<dyn Session>) -> Self {
        Self {
            credentials,
            session,
            enabled: true,
            session_valid: None,
            rate_limits: None,
            last_check_at: None,
            request_count: 0,
            fail_count: 0,
            backoff_until: 0,
            consecutive_failures: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.credentials.id
    }

    pub fn state(&self) -> ClientState {
        match self.session_valid {
            Some(false) => ClientState::Offline,
            None => ClientState::Unknown,
            Some(true) => {
                let exhausted = self
                    .rate_limits
                    .as_ref()
                    .and_then(|rl| rl.pro_remaining)
                    .is_some_and(|n| n == 0);
                if exhausted {
                    ClientState::Exhausted
                } else {
                    ClientState::Normal
                }
            }
        }
    }

    /// 指定模式是否还有配额。未知一律当作有。
    pub fn has_quota(&self, mode: SearchMode) -> bool {
        if self.session_valid == Some(false) {
            return false;
        }
        match mode {
            SearchMode::Auto => true,
            SearchMode::Pro | SearchMode::Reasoning => self
                .rate_limits
                .as_ref()
                .and_then(|rl| rl.pro_remaining)
                .map_or(true, |n| n > 0),
            SearchMode::DeepResearch => {
                let Some(research) = self.rate_limits.as_ref().and_then(|rl| rl.mode("research"))
                else {
                    return true;
                };
                if !research.available {
                    return false;
                }
                research.remaining.map_or(true, |n| n > 0)
            }
        }
    }

    pub fn is_available(&self, now: i64) -> bool {
        self.enabled && now >= self.backoff_until
    }

    pub fn record_success(&mut self) {
        self.request_count += 1;
        self.consecutive_failures = 0;
        self.backoff_until = 0;
    }

    pub fn record_failure(&mut self, now: i64) {
        self.fail_count += 1;
        self.consecutive_failures += 1;
        self.backoff_until = now + backoff_secs(self.consecutive_failures);
    }

    /// 清除冷却与连败计数（管理命令 reset）。
    pub fn reset_backoff(&mut self) {
        self.consecutive_failures = 0;
        self.backoff_until = 0;
    }

    /// 健康检查成功：原子地替换配额快照并确认会话有效。
    pub fn apply_rate_limits(&mut self, limits: RateLimits, now: i64) {
        self.rate_limits = Some(limits);
        self.session_valid = Some(true);
        self.last_check_at = Some(now);
    }

    pub fn mark_session_invalid(&mut self, now: i64) {
        self.session_valid = Some(false);
        self.last_check_at = Some(now);
    }

    /// 成功后的本地乐观扣减；下一次 monitor 拉取会覆盖为权威值。
    /// 返回是否有计数器刚好归零。
    pub fn decrement_quota(&mut self, mode: SearchMode) -> bool {
        let Some(limits) = self.rate_limits.as_mut() else {
            return false;
        };
        let mut hit_zero = false;

        match mode {
            SearchMode::Pro | SearchMode::Reasoning => {
                if let Some(n) = limits.pro_remaining
                    && n > 0
                {
                    limits.pro_remaining = Some(n - 1);
                    hit_zero |= n == 1;
                }
                // pro 与 reasoning 共享上游计数；pro_search 明细一并扣。
                if let Some(q) = limits.modes.get_mut("pro_search")
                    && let Some(n) = q.remaining
                    && n > 0
                {
                    q.remaining = Some(n - 1);
                    hit_zero |= n == 1;
                }
            }
            SearchMode::DeepResearch => {
                if let Some(q) = limits.modes.get_mut("research")
                    && let Some(n) = q.remaining
                    && n > 0
                {
                    q.remaining = Some(n - 1);
                    hit_zero |= n == 1;
                }
            }
            SearchMode::Auto => {}
        }
        hit_zero
    }

    /// 配额类失败：把对应剩余计数钉为 0，避免在 monitor 刷新前被重复选中。
    pub fn zero_quota(&mut self, mode: SearchMode) {
        let limits = self.rate_limits.get_or_insert_with(RateLimits::default);
        match mode {
            SearchMode::Pro | SearchMode::Reasoning => {
                limits.pro_remaining = Some(0);
            }
            SearchMode::DeepResearch => {
                let q = limits.mode_mut("research");
                q.remaining = Some(0);
            }
            SearchMode::Auto => {}
        }
    }
}

/// 指数退避：60s, 120s, 240s, …，封顶 3600s。
pub fn backoff_secs(consecutive_failures: u32) -> i64 {
    if consecutive_failures == 0 {
        return 0;
    }
    let shift = (consecutive_failures - 1).min(30);
    (INITIAL_BACKOFF_SECS << shift).min(MAX_BACKOFF_SECS)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::perplexity::client::{ApiError, Session};
    use crate::perplexity::types::{SearchRequest, SearchResponse, UserInfo};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// 测试会话：按脚本依次返回结果，并把被调用的 id 记到共享日志里。
    pub struct ScriptedSession {
        pub id: String,
        pub script: Mutex<VecDeque<Result<SearchResponse, ApiError>>>,
        pub call_log: Arc<Mutex<Vec<String>>>,
        pub rate_limits: Mutex<Option<RateLimits>>,
        pub logged_in: std::sync::atomic::AtomicBool,
    }

    impl ScriptedSession {
        pub fn new(id: &str, call_log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                id: id.to_string(),
                script: Mutex::new(VecDeque::new()),
                call_log,
                rate_limits: Mutex::new(None),
                logged_in: std::sync::atomic::AtomicBool::new(true),
            }
        }

        pub fn push(&self, result: Result<SearchResponse, ApiError>) {
            self.script.lock().unwrap().push_back(result);
        }

        pub fn set_logged_in(&self, value: bool) {
            self.logged_in
                .store(value, std::sync::atomic::Ordering::Relaxed);
        }
    }

    pub fn ok_response(answer: &str) -> SearchResponse {
        SearchResponse {
            answer: Some(answer.to_string()),
            chunks: Vec::new(),
            text: sonic_rs::from_str(&sonic_rs::to_string(&answer).unwrap()).unwrap(),
        }
    }

    pub fn research_response(answer: &str) -> SearchResponse {
        SearchResponse {
            answer: Some(answer.to_string()),
            chunks: Vec::new(),
            text: sonic_rs::from_str(r#"[{"step_type":"FINAL","content":{}}]"#).unwrap(),
        }
    }

    #[async_trait]
    impl Session for ScriptedSession {
        async fn search(&self, _req: &SearchRequest) -> Result<SearchResponse, ApiError> {
            self.call_log.lock().unwrap().push(self.id.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ok_response("default")))
        }

        async fn fetch_rate_limits(&self) -> Result<RateLimits, ApiError> {
            match self.rate_limits.lock().unwrap().clone() {
                Some(rl) => Ok(rl),
                None => Ok(RateLimits::default()),
            }
        }

        async fn fetch_user_info(&self) -> Result<UserInfo, ApiError> {
            if self.logged_in.load(std::sync::atomic::Ordering::Relaxed) {
                Ok(UserInfo {
                    user: Some(sonic_rs::from_str(r#"{"email":"t@example"}"#).unwrap()),
                })
            } else {
                Ok(UserInfo::default())
            }
        }
    }
}
