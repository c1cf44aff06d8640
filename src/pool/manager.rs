//! 客户端池：有序客户端列表 + 轮询游标，单把锁管全部可变状态。
//!
//! 锁内只做 O(1) 的选择与字段更新；任何会话网络调用都先在锁内克隆
//! `Arc<dyn Session>`，释放锁之后再 await。

use crate::perplexity::client::{CookieMap, Session};
use crate::perplexity::types::{RateLimits, SearchMode};
use crate::pool::persist::{
    self, ClientStateEntry, ConfigFile, FallbackConfig, MonitorConfig, StateFile,
};
use crate::pool::types::{ClientState, ClientWrapper, TokenCredentials};
use crate::query::FailureKind;
use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{RwLock, watch};

/// 会话构造器。生产环境构造 `SessionClient`，测试注入 mock。
pub type SessionFactory =
    Arc<dyn Fn(&CookieMap) -> anyhow::Result<Arc<dyn Session>> + Send + Sync>;

pub struct Pool {
    state: RwLock<PoolInner>,
    factory: SessionFactory,
    config_path: Option<PathBuf>,
    /// monitor 的重配置信号：任何 monitor 配置变更后 send 一次。
    monitor_wakeup: watch::Sender<()>,
}

struct PoolInner {
    clients: Vec<ClientWrapper>,
    cursor: usize,
    monitor: MonitorConfig,
    fallback: FallbackConfig,
    /// 配置文件里不认识的顶层字段，回写时原样保留。
    config_extra: HashMap<String, sonic_rs::Value>,
    config_mtime: Option<SystemTime>,
    state_mtime: Option<SystemTime>,
}

/// 池状态快照（管理接口输出）。
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
    pub clients: Vec<ClientStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub id: String,
    pub enabled: bool,
    pub available: bool,
    pub state: String,
    pub session_valid: Option<bool>,
    pub request_count: u64,
    pub fail_count: u64,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_available_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limits: Option<RateLimits>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub added: Vec<String>,
    pub skipped: Vec<String>,
    pub errors: Vec<String>,
}

/// monitor 配置的部分更新。tg 字段为双层 Option：
/// 外层缺省 = 不改，内层 null = 清除。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonitorConfigUpdate {
    #[serde(default)]
    pub enable: Option<bool>,
    #[serde(default)]
    pub interval: Option<f64>,
    #[serde(default, deserialize_with = "double_option")]
    pub tg_bot_token: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub tg_chat_id: Option<Option<String>>,
}

fn double_option<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Some(Option::<String>::deserialize(de)?))
}

impl Pool {
    pub fn new(factory: SessionFactory, config_path: Option<PathBuf>) -> Self {
        let (monitor_wakeup, _) = watch::channel(());
        Self {
            state: RwLock::new(PoolInner {
                clients: Vec::new(),
                cursor: 0,
                monitor: MonitorConfig::default(),
                fallback: FallbackConfig::default(),
                config_extra: HashMap::new(),
                config_mtime: None,
                state_mtime: None,
            }),
            factory,
            config_path,
            monitor_wakeup,
        }
    }

    pub fn session_factory(&self) -> &SessionFactory {
        &self.factory
    }

    pub fn monitor_wakeup_rx(&self) -> watch::Receiver<()> {
        self.monitor_wakeup.subscribe()
    }

    fn state_file_path(&self) -> Option<PathBuf> {
        self.config_path.as_deref().map(persist::state_file_path)
    }

    /// 按凭证构造会话；空凭证走匿名会话（空 cookie 集）。
    fn build_session(&self, creds: &TokenCredentials) -> anyhow::Result<Arc<dyn Session>> {
        if creds.csrf_token.is_empty() && creds.session_token.is_empty() {
            (self.factory)(&CookieMap::new())
        } else {
            (self.factory)(&creds.cookie_map())
        }
    }

    /// 初始化：按优先级加载配置文件 → 环境变量单 token → 匿名会话。
    pub async fn load(&self, env_token: Option<TokenCredentials>) -> anyhow::Result<()> {
        if let Some(path) = &self.config_path
            && let Some(cfg) = persist::load_config(path).await?
        {
            let mut wrappers = Vec::with_capacity(cfg.tokens.len());
            for creds in cfg.tokens {
                if creds.id.trim().is_empty()
                    || creds.csrf_token.is_empty()
                    || creds.session_token.is_empty()
                {
                    tracing::warn!(id = %creds.id, "配置里存在缺字段的 token，已跳过");
                    continue;
                }
                let session = self
                    .build_session(&creds)
                    .with_context(|| format!("构造客户端 '{}' 的会话失败", creds.id))?;
                wrappers.push(ClientWrapper::new(creds, session));
            }
            if wrappers.is_empty() {
                return Err(anyhow!("配置文件里没有可用的 token"));
            }

            let mtime = persist::modified(path).await;
            let mut inner = self.state.write().await;
            inner.clients = wrappers;
            inner.cursor = 0;
            inner.monitor = cfg.monitor;
            inner.fallback = cfg.fallback;
            inner.config_extra = cfg.extra;
            inner.config_mtime = mtime;
            drop(inner);

            // 带上一个进程留下的运行时状态
            if let Err(e) = self.load_state_if_changed().await {
                tracing::warn!("加载 pool_state.json 失败：{e:#}");
            }
            return Ok(());
        }

        // 无配置文件：环境变量单 token，或最后退化为匿名会话
        let creds = env_token
            .unwrap_or_else(|| TokenCredentials::new("anonymous", "", ""));
        let session = self.build_session(&creds)?;
        let mut inner = self.state.write().await;
        inner.clients = vec![ClientWrapper::new(creds, session)];
        inner.cursor = 0;
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.clients.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 轮询选择：从游标起返回第一个 启用 ∧ 不在冷却 ∧ 配额允许 的客户端，
    /// 并把游标推过它。没有合格者时返回 None。
    pub async fn acquire(&self, mode: SearchMode) -> Option<(String, Arc<dyn Session>)> {
        let now = Utc::now().timestamp();
        let mut inner = self.state.write().await;
        let len = inner.clients.len();
        if len == 0 {
            return None;
        }
        for _ in 0..len {
            let idx = inner.cursor % len;
            inner.cursor = (idx + 1) % len;
            let w = &inner.clients[idx];
            if w.is_available(now) && w.has_quota(mode) {
                return Some((w.id().to_string(), w.session.clone()));
            }
        }
        None
    }

    /// 所有客户端都在冷却时，返回最早的解冻时刻；有可用客户端则为 None。
    pub async fn earliest_backoff_until(&self) -> Option<i64> {
        let now = Utc::now().timestamp();
        let inner = self.state.read().await;
        if inner.clients.is_empty() || inner.clients.iter().any(|w| w.is_available(now)) {
            return None;
        }
        inner.clients.iter().map(|w| w.backoff_until).min()
    }

    pub async fn record_success(&self, id: &str, mode: SearchMode) {
        {
            let mut inner = self.state.write().await;
            if let Some(w) = inner.clients.iter_mut().find(|w| w.id() == id) {
                w.record_success();
                if mode.is_pro_tier() && w.decrement_quota(mode) {
                    tracing::info!(
                        client_id = id,
                        mode = %mode,
                        "本地配额计数归零，等待 monitor 下个周期校验"
                    );
                }
            }
        }
        self.save_state("query").await;
    }

    pub async fn record_failure(&self, id: &str, mode: SearchMode, kind: FailureKind) {
        let now = Utc::now().timestamp();
        {
            let mut inner = self.state.write().await;
            if let Some(w) = inner.clients.iter_mut().find(|w| w.id() == id) {
                w.record_failure(now);
                match kind {
                    FailureKind::SessionInvalid => w.mark_session_invalid(now),
                    FailureKind::QuotaExhausted => w.zero_quota(mode),
                    FailureKind::SilentDowngrade => w.zero_quota(SearchMode::DeepResearch),
                    _ => {}
                }
            }
        }
        self.save_state("query").await;
    }

    // ======================= 管理命令 =======================

    pub async fn has_token(&self, id: &str) -> bool {
        self.state
            .read()
            .await
            .clients
            .iter()
            .any(|w| w.id() == id)
    }

    pub async fn add_token(&self, creds: TokenCredentials) -> anyhow::Result<()> {
        if creds.id.trim().is_empty() {
            return Err(anyhow!("token id 不能为空"));
        }
        let session = self.build_session(&creds)?;
        {
            let mut inner = self.state.write().await;
            if inner.clients.iter().any(|w| w.id() == creds.id) {
                return Err(anyhow!("客户端 '{}' 已存在", creds.id));
            }
            inner.clients.push(ClientWrapper::new(creds, session));
        }
        self.save_config().await;
        Ok(())
    }

    pub async fn remove_token(&self, id: &str) -> anyhow::Result<()> {
        {
            let mut inner = self.state.write().await;
            let Some(pos) = inner.clients.iter().position(|w| w.id() == id) else {
                return Err(anyhow!("客户端 '{id}' 不存在"));
            };
            if inner.clients.len() <= 1 {
                return Err(anyhow!("无法移除最后一个客户端"));
            }
            inner.clients.remove(pos);
            if inner.cursor >= inner.clients.len() {
                inner.cursor = 0;
            }
        }
        self.save_config().await;
        Ok(())
    }

    pub async fn enable_token(&self, id: &str) -> anyhow::Result<()> {
        {
            let mut inner = self.state.write().await;
            let Some(w) = inner.clients.iter_mut().find(|w| w.id() == id) else {
                return Err(anyhow!("客户端 '{id}' 不存在"));
            };
            w.enabled = true;
        }
        self.save_config().await;
        self.save_state("admin").await;
        Ok(())
    }

    pub async fn disable_token(&self, id: &str) -> anyhow::Result<()> {
        {
            let mut inner = self.state.write().await;
            let enabled_count = inner.clients.iter().filter(|w| w.enabled).count();
            let Some(w) = inner.clients.iter_mut().find(|w| w.id() == id) else {
                return Err(anyhow!("客户端 '{id}' 不存在"));
            };
            if w.enabled && enabled_count <= 1 {
                return Err(anyhow!("无法禁用最后一个启用的客户端"));
            }
            w.enabled = false;
        }
        self.save_config().await;
        self.save_state("admin").await;
        Ok(())
    }

    /// 清除冷却状态。重复调用无副作用。
    pub async fn reset_token(&self, id: &str) -> anyhow::Result<()> {
        {
            let mut inner = self.state.write().await;
            let Some(w) = inner.clients.iter_mut().find(|w| w.id() == id) else {
                return Err(anyhow!("客户端 '{id}' 不存在"));
            };
            w.reset_backoff();
        }
        self.save_state("admin").await;
        Ok(())
    }

    pub async fn export_config(&self) -> ConfigFile {
        let inner = self.state.read().await;
        ConfigFile {
            monitor: inner.monitor.clone(),
            fallback: inner.fallback.clone(),
            tokens: inner
                .clients
                .iter()
                .map(|w| w.credentials.clone())
                .collect(),
            extra: inner.config_extra.clone(),
        }
    }

    pub async fn export_token(&self, id: &str) -> Option<TokenCredentials> {
        let inner = self.state.read().await;
        inner
            .clients
            .iter()
            .find(|w| w.id() == id)
            .map(|w| w.credentials.clone())
    }

    pub async fn import_tokens(&self, tokens: Vec<TokenCredentials>) -> ImportReport {
        let mut report = ImportReport::default();
        for creds in tokens {
            if creds.id.trim().is_empty()
                || creds.csrf_token.is_empty()
                || creds.session_token.is_empty()
            {
                report
                    .errors
                    .push(format!("'{}': 缺少必填字段", creds.id));
                continue;
            }
            if self.has_token(&creds.id).await {
                report.skipped.push(creds.id);
                continue;
            }
            let id = creds.id.clone();
            match self.add_token(creds).await {
                Ok(()) => report.added.push(id),
                Err(e) => report.errors.push(format!("'{id}': {e}")),
            }
        }
        report
    }

    // ======================= 配置读写 =======================

    pub async fn monitor_config(&self) -> MonitorConfig {
        self.state.read().await.monitor.clone()
    }

    pub async fn set_monitor_config(&self, update: MonitorConfigUpdate) -> MonitorConfig {
        let new_cfg = {
            let mut inner = self.state.write().await;
            if let Some(enable) = update.enable {
                inner.monitor.enable = enable;
            }
            if let Some(interval) = update.interval {
                inner.monitor.interval = interval;
            }
            if let Some(token) = update.tg_bot_token {
                inner.monitor.tg_bot_token = token;
            }
            if let Some(chat) = update.tg_chat_id {
                inner.monitor.tg_chat_id = chat;
            }
            inner.monitor.clone()
        };
        self.save_config().await;
        // 唤醒 monitor 循环，让它用新配置重算睡眠
        let _ = self.monitor_wakeup.send(());
        new_cfg
    }

    pub async fn fallback_config(&self) -> FallbackConfig {
        self.state.read().await.fallback.clone()
    }

    pub async fn set_fallback_config(&self, fallback_to_auto: bool) -> FallbackConfig {
        let cfg = {
            let mut inner = self.state.write().await;
            inner.fallback.fallback_to_auto = fallback_to_auto;
            inner.fallback.clone()
        };
        self.save_config().await;
        cfg
    }

    pub async fn fallback_to_auto_enabled(&self) -> bool {
        self.state.read().await.fallback.fallback_to_auto
    }

    // ======================= 状态快照 =======================

    pub async fn status(&self) -> PoolStatus {
        let now = Utc::now().timestamp();
        let inner = self.state.read().await;
        let clients: Vec<ClientStatus> = inner
            .clients
            .iter()
            .map(|w| {
                let available = w.is_available(now);
                ClientStatus {
                    id: w.id().to_string(),
                    enabled: w.enabled,
                    available,
                    state: w.state().as_str().to_string(),
                    session_valid: w.session_valid,
                    request_count: w.request_count,
                    fail_count: w.fail_count,
                    consecutive_failures: w.consecutive_failures,
                    next_available_at: if available {
                        None
                    } else {
                        iso_timestamp(w.backoff_until)
                    },
                    last_check_at: w.last_check_at.and_then(iso_timestamp),
                    rate_limits: w.rate_limits.clone(),
                }
            })
            .collect();
        PoolStatus {
            total: clients.len(),
            available: clients.iter().filter(|c| c.available).count(),
            clients,
        }
    }

    /// monitor/健康检查用的会话快照。id 过滤为 None 时返回所有启用客户端。
    pub async fn session_snapshot(
        &self,
        only_id: Option<&str>,
    ) -> Vec<(String, Arc<dyn Session>, ClientState)> {
        let inner = self.state.read().await;
        inner
            .clients
            .iter()
            .filter(|w| match only_id {
                Some(id) => w.id() == id,
                None => w.enabled,
            })
            .map(|w| (w.id().to_string(), w.session.clone(), w.state()))
            .collect()
    }

    /// 健康检查成功。返回 (旧状态, 新状态)；客户端已被移除则为 None。
    pub async fn apply_rate_limits(
        &self,
        id: &str,
        limits: RateLimits,
    ) -> Option<(ClientState, ClientState)> {
        let now = Utc::now().timestamp();
        let mut inner = self.state.write().await;
        let w = inner.clients.iter_mut().find(|w| w.id() == id)?;
        let prev = w.state();
        w.apply_rate_limits(limits, now);
        Some((prev, w.state()))
    }

    /// 健康检查判定会话失效。返回 (旧状态, 新状态)。
    pub async fn mark_session_invalid(&self, id: &str) -> Option<(ClientState, ClientState)> {
        let now = Utc::now().timestamp();
        let mut inner = self.state.write().await;
        let w = inner.clients.iter_mut().find(|w| w.id() == id)?;
        let prev = w.state();
        w.mark_session_invalid(now);
        Some((prev, w.state()))
    }

    /// 拉取账号会话信息。HTTP 在锁外执行。
    pub async fn user_info(&self, only_id: Option<&str>) -> HashMap<String, sonic_rs::Value> {
        let sessions = self.session_snapshot(only_id).await;
        let mut out = HashMap::new();
        for (id, session, _) in sessions {
            let value = match session.fetch_user_info().await {
                Ok(info) => info.user.unwrap_or_default(),
                Err(e) => {
                    let mut obj = sonic_rs::Object::new();
                    obj.insert("error", e.to_string().as_str());
                    obj.into_value()
                }
            };
            out.insert(id, value);
        }
        out
    }

    // ======================= 落盘与跨进程同步 =======================

    /// 保存主配置。失败只记日志，不影响调用方流程。
    pub async fn save_config(&self) {
        let Some(path) = self.config_path.clone() else {
            return;
        };
        let cfg = self.export_config().await;
        if let Err(e) = persist::save_config(&path, &cfg).await {
            tracing::error!("保存 token_pool_config.json 失败：{e:#}");
            return;
        }
        let mtime = persist::modified(&path).await;
        self.state.write().await.config_mtime = mtime;
    }

    /// 保存跨进程状态文件。
    pub async fn save_state(&self, writer: &str) {
        let Some(path) = self.state_file_path() else {
            return;
        };
        let file = {
            let inner = self.state.read().await;
            let mut clients = HashMap::with_capacity(inner.clients.len());
            for w in &inner.clients {
                clients.insert(
                    w.id().to_string(),
                    ClientStateEntry {
                        enabled: w.enabled,
                        session_valid: w.session_valid,
                        rate_limits: w.rate_limits.clone(),
                        last_check_at: w.last_check_at.and_then(iso_timestamp),
                        request_count: w.request_count,
                        fail_count: w.fail_count,
                        backoff_until: w.backoff_until,
                        consecutive_failures: w.consecutive_failures,
                        state: w.state().as_str().to_string(),
                    },
                );
            }
            StateFile {
                version: persist::STATE_FILE_VERSION,
                updated_at: Utc::now().timestamp(),
                writer: writer.to_string(),
                clients,
            }
        };
        if let Err(e) = persist::save_state(&path, &file).await {
            tracing::error!("保存 pool_state.json 失败：{e:#}");
            return;
        }
        let mtime = persist::modified(&path).await;
        self.state.write().await.state_mtime = mtime;
    }

    /// mtime 变化时合并兄弟进程写入的运行时状态。
    /// 只吸收 enabled / session_valid / rate_limits / last_check_at；
    /// 冷却与计数器保持各进程独立。
    pub async fn load_state_if_changed(&self) -> anyhow::Result<bool> {
        let Some(path) = self.state_file_path() else {
            return Ok(false);
        };
        let current = persist::modified(&path).await;
        {
            let inner = self.state.read().await;
            if current.is_none() || current == inner.state_mtime {
                return Ok(false);
            }
        }
        let Some(file) = persist::load_state(&path).await? else {
            return Ok(false);
        };
        if file.version > persist::STATE_FILE_VERSION {
            tracing::warn!(version = file.version, "pool_state.json 版本过新，忽略");
            return Ok(false);
        }

        let mut inner = self.state.write().await;
        for (id, entry) in &file.clients {
            let Some(w) = inner.clients.iter_mut().find(|w| w.id() == id.as_str()) else {
                continue;
            };
            w.enabled = entry.enabled;
            if let Some(sv) = entry.effective_session_valid() {
                w.session_valid = Some(sv);
            }
            if let Some(rl) = &entry.rate_limits {
                w.rate_limits = Some(rl.clone());
            }
            if let Some(ts) = entry
                .last_check_at
                .as_deref()
                .and_then(parse_iso_timestamp)
            {
                w.last_check_at = Some(ts);
            }
        }
        inner.state_mtime = current;
        Ok(true)
    }

    /// mtime 变化时按配置文件增删 token，并同步 fallback 配置。
    pub async fn reload_config_if_changed(&self) -> anyhow::Result<bool> {
        let Some(path) = self.config_path.clone() else {
            return Ok(false);
        };
        let current = persist::modified(&path).await;
        {
            let inner = self.state.read().await;
            if current.is_none() || current == inner.config_mtime {
                return Ok(false);
            }
        }
        let Some(cfg) = persist::load_config(&path).await? else {
            return Ok(false);
        };

        let mut config_ids: HashSet<String> = HashSet::new();
        let mut additions: Vec<ClientWrapper> = Vec::new();
        {
            let inner = self.state.read().await;
            for creds in &cfg.tokens {
                if creds.id.trim().is_empty()
                    || creds.csrf_token.is_empty()
                    || creds.session_token.is_empty()
                {
                    continue;
                }
                config_ids.insert(creds.id.clone());
                if inner.clients.iter().any(|w| w.id() == creds.id) {
                    continue;
                }
                match self.build_session(creds) {
                    Ok(session) => additions.push(ClientWrapper::new(creds.clone(), session)),
                    Err(e) => {
                        tracing::warn!(id = %creds.id, "热加载 token 失败：{e:#}");
                    }
                }
            }
        }

        let mut inner = self.state.write().await;
        for w in additions {
            // 写锁窗口之间可能有并发 add，去重后再插入
            if !inner.clients.iter().any(|c| c.id() == w.id()) {
                tracing::info!(id = w.id(), "从配置文件热加载新客户端");
                inner.clients.push(w);
            }
        }
        inner.clients.retain(|w| {
            let keep = config_ids.contains(w.id());
            if !keep {
                tracing::info!(id = w.id(), "客户端已从配置文件移除");
            }
            keep
        });
        if inner.clients.is_empty() {
            tracing::warn!("配置热加载后池为空");
        }
        if inner.cursor >= inner.clients.len() {
            inner.cursor = 0;
        }
        inner.fallback = cfg.fallback;
        inner.config_extra = cfg.extra;
        inner.config_mtime = current;
        Ok(true)
    }

    /// run_query 入口处的跨进程同步。失败降级为使用内存副本。
    pub async fn sync_from_disk(&self) {
        if let Err(e) = self.reload_config_if_changed().await {
            tracing::warn!("配置热加载失败：{e:#}");
        }
        if let Err(e) = self.load_state_if_changed().await {
            tracing::warn!("状态文件同步失败：{e:#}");
        }
    }
}

fn iso_timestamp(ts: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(ts, 0).map(|dt| dt.to_rfc3339())
}

fn parse_iso_timestamp(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perplexity::types::ModeQuota;
    use crate::pool::types::test_support::ScriptedSession;
    use std::sync::Mutex;

    fn scripted_factory(
        call_log: Arc<Mutex<Vec<String>>>,
    ) -> (SessionFactory, Arc<Mutex<HashMap<String, Arc<ScriptedSession>>>>) {
        let registry: Arc<Mutex<HashMap<String, Arc<ScriptedSession>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let reg = registry.clone();
        let factory: SessionFactory = Arc::new(move |cookies: &CookieMap| {
            // 测试里用 csrf cookie 当作客户端 id
            let id = cookies
                .get("next-auth.csrf-token")
                .cloned()
                .unwrap_or_else(|| "anonymous".to_string());
            let session = Arc::new(ScriptedSession::new(&id, call_log.clone()));
            reg.lock().unwrap().insert(id, session.clone());
            Ok(session as Arc<dyn Session>)
        });
        (factory, registry)
    }

    async fn pool_with_clients(ids: &[&str]) -> (Arc<Pool>, Arc<Mutex<HashMap<String, Arc<ScriptedSession>>>>) {
        let call_log = Arc::new(Mutex::new(Vec::new()));
        let (factory, registry) = scripted_factory(call_log);
        let pool = Arc::new(Pool::new(factory, None));
        for id in ids {
            pool.add_token(TokenCredentials::new(*id, *id, "sess"))
                .await
                .unwrap();
        }
        (pool, registry)
    }

    fn limits(pro: Option<i64>, research: Option<i64>) -> RateLimits {
        let mut rl = RateLimits {
            pro_remaining: pro,
            ..Default::default()
        };
        rl.modes.insert(
            "research".to_string(),
            ModeQuota {
                available: true,
                remaining: research,
                kind: Some("exact".to_string()),
            },
        );
        rl
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let (pool, _) = pool_with_clients(&["a"]).await;
        let err = pool
            .add_token(TokenCredentials::new("a", "a", "sess"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("已存在"));
        assert_eq!(pool.len().await, 1);

        // 移除后允许重新加入同名 token
        pool.add_token(TokenCredentials::new("b", "b", "sess"))
            .await
            .unwrap();
        pool.remove_token("a").await.unwrap();
        pool.add_token(TokenCredentials::new("a", "a", "sess"))
            .await
            .unwrap();
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn fair_rotation_visits_all_distinct_then_repeats() {
        let (pool, _) = pool_with_clients(&["a", "b", "c"]).await;

        let mut picked = Vec::new();
        for _ in 0..3 {
            let (id, _) = pool.acquire(SearchMode::Pro).await.unwrap();
            picked.push(id);
        }
        let distinct: HashSet<&String> = picked.iter().collect();
        assert_eq!(distinct.len(), 3, "前 N 次选择覆盖全部客户端: {picked:?}");

        let (fourth, _) = pool.acquire(SearchMode::Pro).await.unwrap();
        assert_eq!(fourth, picked[0], "第 N+1 次回到第一个");
    }

    #[tokio::test]
    async fn acquire_respects_quota_filter() {
        let (pool, _) = pool_with_clients(&["a", "b"]).await;
        pool.apply_rate_limits("a", limits(Some(0), Some(1))).await;
        pool.apply_rate_limits("b", limits(Some(3), Some(0))).await;

        // pro：a 配额耗尽，只会选中 b
        for _ in 0..4 {
            let (id, _) = pool.acquire(SearchMode::Pro).await.unwrap();
            assert_eq!(id, "b");
        }
        // deep research：b 的 research 耗尽，只会选中 a
        for _ in 0..4 {
            let (id, _) = pool.acquire(SearchMode::DeepResearch).await.unwrap();
            assert_eq!(id, "a");
        }
        // auto：两者都可选
        let mut seen = HashSet::new();
        for _ in 0..2 {
            let (id, _) = pool.acquire(SearchMode::Auto).await.unwrap();
            seen.insert(id);
        }
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn acquire_respects_backoff_and_disable() {
        let (pool, _) = pool_with_clients(&["a", "b"]).await;

        pool.record_failure("a", SearchMode::Pro, FailureKind::Transient)
            .await;
        for _ in 0..3 {
            let (id, _) = pool.acquire(SearchMode::Pro).await.unwrap();
            assert_eq!(id, "b", "冷却中的客户端不被选中");
        }
        assert!(pool.earliest_backoff_until().await.is_none());

        pool.record_failure("b", SearchMode::Pro, FailureKind::Transient)
            .await;
        assert!(pool.acquire(SearchMode::Pro).await.is_none());
        let earliest = pool.earliest_backoff_until().await.unwrap();
        assert!(earliest > Utc::now().timestamp());

        pool.reset_token("a").await.unwrap();
        let (id, _) = pool.acquire(SearchMode::Pro).await.unwrap();
        assert_eq!(id, "a");
    }

    #[tokio::test]
    async fn last_enabled_client_cannot_be_disabled() {
        let (pool, _) = pool_with_clients(&["a", "b"]).await;
        pool.disable_token("a").await.unwrap();
        let err = pool.disable_token("b").await.unwrap_err();
        assert!(err.to_string().contains("最后一个"));

        // 重新启用后配额与计数保持不变（enable/disable 只翻转开关）
        pool.enable_token("a").await.unwrap();
        let status = pool.status().await;
        assert!(status.clients.iter().all(|c| c.enabled));
    }

    #[tokio::test]
    async fn session_invalid_failure_marks_offline() {
        let (pool, _) = pool_with_clients(&["a", "b"]).await;
        pool.record_failure("a", SearchMode::Pro, FailureKind::SessionInvalid)
            .await;

        let status = pool.status().await;
        let a = status.clients.iter().find(|c| c.id == "a").unwrap();
        assert_eq!(a.state, "offline");
        assert_eq!(a.session_valid, Some(false));
        assert_eq!(a.fail_count, 1);

        // 即使冷却结束，session 失效的客户端也不会拿到配额
        pool.reset_token("a").await.unwrap();
        for _ in 0..3 {
            let (id, _) = pool.acquire(SearchMode::Auto).await.unwrap();
            assert_eq!(id, "b");
        }
    }

    #[tokio::test]
    async fn quota_failure_pins_remaining_to_zero() {
        let (pool, _) = pool_with_clients(&["a"]).await;
        pool.apply_rate_limits("a", limits(Some(5), Some(2))).await;
        pool.record_failure("a", SearchMode::Pro, FailureKind::QuotaExhausted)
            .await;

        let status = pool.status().await;
        let a = &status.clients[0];
        assert_eq!(a.rate_limits.as_ref().unwrap().pro_remaining, Some(0));
        assert_eq!(a.state, "exhausted");
    }

    #[tokio::test]
    async fn success_decrements_local_quota() {
        let (pool, _) = pool_with_clients(&["a"]).await;
        pool.apply_rate_limits("a", limits(Some(2), Some(1))).await;

        pool.record_success("a", SearchMode::Pro).await;
        let status = pool.status().await;
        assert_eq!(
            status.clients[0].rate_limits.as_ref().unwrap().pro_remaining,
            Some(1)
        );
        assert_eq!(status.clients[0].request_count, 1);

        pool.record_success("a", SearchMode::DeepResearch).await;
        let status = pool.status().await;
        let rl = status.clients[0].rate_limits.as_ref().unwrap();
        assert_eq!(rl.modes.get("research").unwrap().remaining, Some(0));
    }

    #[tokio::test]
    async fn remove_keeps_cursor_in_bounds() {
        let (pool, _) = pool_with_clients(&["a", "b", "c"]).await;
        // 游标推到末尾
        pool.acquire(SearchMode::Auto).await.unwrap();
        pool.acquire(SearchMode::Auto).await.unwrap();
        pool.remove_token("c").await.unwrap();
        // 游标越界时归零，后续选择不 panic 且仍轮询
        let (id1, _) = pool.acquire(SearchMode::Auto).await.unwrap();
        let (id2, _) = pool.acquire(SearchMode::Auto).await.unwrap();
        assert_ne!(id1, id2);
    }

    #[tokio::test]
    async fn persistence_round_trip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("token_pool_config.json");

        let call_log = Arc::new(Mutex::new(Vec::new()));
        let (factory, _) = scripted_factory(call_log.clone());
        let pool = Pool::new(factory, Some(config_path.clone()));
        pool.add_token(TokenCredentials::new("a", "a", "s1"))
            .await
            .unwrap();
        pool.add_token(TokenCredentials::new("b", "b", "s2"))
            .await
            .unwrap();
        pool.apply_rate_limits("a", limits(Some(7), Some(3))).await;
        pool.save_state("test").await;

        // 第二个池实例（模拟 stdio 进程）从同一批文件加载
        let (factory2, _) = scripted_factory(Arc::new(Mutex::new(Vec::new())));
        let pool2 = Pool::new(factory2, Some(config_path));
        pool2.load(None).await.unwrap();
        assert_eq!(pool2.len().await, 2);

        let status = pool2.status().await;
        let a = status.clients.iter().find(|c| c.id == "a").unwrap();
        assert_eq!(a.session_valid, Some(true));
        assert_eq!(a.rate_limits.as_ref().unwrap().pro_remaining, Some(7));
    }

    #[tokio::test]
    async fn state_sync_picks_up_sibling_writes() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("token_pool_config.json");

        let (factory, _) = scripted_factory(Arc::new(Mutex::new(Vec::new())));
        let admin = Pool::new(factory, Some(config_path.clone()));
        admin
            .add_token(TokenCredentials::new("a", "a", "s1"))
            .await
            .unwrap();

        let (factory2, _) = scripted_factory(Arc::new(Mutex::new(Vec::new())));
        let sibling = Pool::new(factory2, Some(config_path));
        sibling.load(None).await.unwrap();

        // admin 进程把 a 标记为失效并落盘；sibling 同步后看到
        admin.mark_session_invalid("a").await;
        admin.save_state("monitor").await;
        // mtime 粒度可能是秒，退避比较的是 SystemTime，仍然可辨别
        assert!(sibling.load_state_if_changed().await.unwrap());
        let status = sibling.status().await;
        assert_eq!(status.clients[0].state, "offline");
    }

    #[tokio::test]
    async fn config_reload_adds_and_removes_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("token_pool_config.json");

        let (factory, _) = scripted_factory(Arc::new(Mutex::new(Vec::new())));
        let admin = Pool::new(factory, Some(config_path.clone()));
        admin
            .add_token(TokenCredentials::new("a", "a", "s1"))
            .await
            .unwrap();

        let (factory2, _) = scripted_factory(Arc::new(Mutex::new(Vec::new())));
        let sibling = Pool::new(factory2, Some(config_path));
        sibling.load(None).await.unwrap();
        assert_eq!(sibling.len().await, 1);

        admin
            .add_token(TokenCredentials::new("b", "b", "s2"))
            .await
            .unwrap();
        assert!(sibling.reload_config_if_changed().await.unwrap());
        assert_eq!(sibling.len().await, 2);
    }

    #[tokio::test]
    async fn monitor_config_update_pings_wakeup_channel() {
        let (pool, _) = pool_with_clients(&["a"]).await;
        let mut rx = pool.monitor_wakeup_rx();

        let cfg = pool
            .set_monitor_config(MonitorConfigUpdate {
                enable: Some(true),
                interval: Some(0.01),
                ..Default::default()
            })
            .await;
        assert!(cfg.enable);
        assert_eq!(cfg.interval_hours(), 0.1, "间隔被钳制到下限");
        assert!(rx.has_changed().unwrap());
    }
}
