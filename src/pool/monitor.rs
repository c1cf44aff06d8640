//! 后台健康检查：按配置周期对所有启用客户端做零消耗探活。
//!
//! 探活只走 auth/session 与 rate-limit 两个只读端点，不消耗任何查询配额。
//! 睡眠通过 `select!` 与重配置信号竞争，停用或改周期都能立即打断。

use crate::pool::Pool;
use crate::pool::persist::MonitorConfig;
use crate::pool::types::ClientState;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// 单个客户端的检查结果（管理接口 /monitor/test 的输出单元）。
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub status: &'static str,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub type MonitorReport = HashMap<String, CheckResult>;

/// 启动 monitor 后台任务。返回的句柄随进程存活，无需显式 join。
pub fn spawn(pool: Arc<Pool>) -> JoinHandle<()> {
    let mut wakeup = pool.monitor_wakeup_rx();
    tokio::spawn(async move {
        tracing::info!("monitor 任务已启动");
        loop {
            let cfg = pool.monitor_config().await;
            if !cfg.enable {
                // 停用状态：挂在重配置信号上等待
                if wakeup.changed().await.is_err() {
                    return;
                }
                continue;
            }

            let interval = Duration::from_secs_f64(cfg.interval_hours() * 3600.0);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    tracing::info!(interval_hours = cfg.interval_hours(), "开始全量健康检查");
                    let report = run_cycle(&pool, None).await;
                    let ok = report.values().filter(|r| r.status == "ok").count();
                    tracing::info!(
                        total = report.len(),
                        ok,
                        failed = report.len() - ok,
                        "健康检查完成"
                    );
                }
                changed = wakeup.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    tracing::info!("monitor 配置变更，重置睡眠周期");
                }
            }
        }
    })
}

/// 立即执行一轮检查。`only_id` 为 None 时检查所有启用客户端；
/// 指定 id 时无视启用开关（管理员手动测试、新增 token 的首检）。
pub async fn run_cycle(pool: &Pool, only_id: Option<&str>) -> MonitorReport {
    let cfg = pool.monitor_config().await;
    let sessions = pool.session_snapshot(only_id).await;
    let mut report = MonitorReport::with_capacity(sessions.len());

    for (idx, (id, session, _prev_state)) in sessions.iter().enumerate() {
        if idx > 0 {
            // 客户端之间留空隙，避免对上游造成突发
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        // 第一步：会话有效性。锁外 I/O，结果只在客户端仍存在时生效。
        let logged_in = match session.fetch_user_info().await {
            Ok(info) => info.is_logged_in(),
            Err(e) => {
                tracing::warn!(client_id = %id, "探活请求失败：{e:#}");
                false
            }
        };
        if !logged_in {
            let transition = pool.mark_session_invalid(id).await;
            if let Some((prev, new)) = transition
                && prev != new
            {
                notify(
                    &cfg,
                    &format!("⚠️ pplx2api: <b>{id}</b> 会话已失效。"),
                )
                .await;
            }
            report.insert(
                id.clone(),
                CheckResult {
                    status: "error",
                    state: ClientState::Offline.as_str().to_string(),
                    error: Some("Session invalid (not logged in)".to_string()),
                },
            );
            continue;
        }

        // 第二步：配额快照。不消耗用户配额。
        match session.fetch_rate_limits().await {
            Ok(limits) => {
                let Some((prev, new)) = pool.apply_rate_limits(id, limits).await else {
                    // 客户端在检查期间被移除，丢弃结果
                    continue;
                };
                if prev != new {
                    match new {
                        ClientState::Exhausted => {
                            notify(
                                &cfg,
                                &format!("⚠️ pplx2api: <b>{id}</b> pro 配额已耗尽。"),
                            )
                            .await;
                        }
                        ClientState::Normal if prev == ClientState::Exhausted => {
                            notify(
                                &cfg,
                                &format!("✅ pplx2api: <b>{id}</b> 已恢复（pro 配额可用）。"),
                            )
                            .await;
                        }
                        _ => {
                            tracing::info!(
                                client_id = %id,
                                from = prev.as_str(),
                                to = new.as_str(),
                                "客户端状态变化"
                            );
                        }
                    }
                }
                report.insert(
                    id.clone(),
                    CheckResult {
                        status: "ok",
                        state: new.as_str().to_string(),
                        error: None,
                    },
                );
            }
            Err(e) => {
                let transition = pool.mark_session_invalid(id).await;
                if let Some((prev, new)) = transition
                    && prev != new
                {
                    notify(&cfg, &format!("⚠️ pplx2api: <b>{id}</b> 健康检查失败。")).await;
                }
                report.insert(
                    id.clone(),
                    CheckResult {
                        status: "error",
                        state: ClientState::Offline.as_str().to_string(),
                        error: Some(e.to_string()),
                    },
                );
            }
        }
    }

    pool.save_state("monitor").await;
    report
}

/// 状态变化通知：配置了 Telegram 就推送，否则仅记日志。
async fn notify(cfg: &MonitorConfig, message: &str) {
    let Some((bot_token, chat_id)) = cfg.telegram_target() else {
        tracing::info!(notification = message, "状态通知（未配置 Telegram，仅记录）");
        return;
    };

    let url = format!("https://api.telegram.org/bot{bot_token}/sendMessage");
    let payload = TelegramPayload {
        chat_id,
        text: message,
        parse_mode: "HTML",
    };
    let client = telegram_client();
    match client.post(&url).json(&payload).send().await {
        Ok(resp) if resp.status().is_success() => {
            tracing::info!(notification = message, "Telegram 通知已发送");
        }
        Ok(resp) => {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            tracing::error!(%status, body, "Telegram 通知发送失败");
        }
        Err(e) => {
            tracing::error!("Telegram 通知发送失败：{e}");
        }
    }
}

#[derive(Serialize)]
struct TelegramPayload<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

fn telegram_client() -> &'static reqwest::Client {
    static CLIENT: std::sync::OnceLock<reqwest::Client> = std::sync::OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perplexity::client::{CookieMap, Session};
    use crate::perplexity::types::{ModeQuota, RateLimits};
    use crate::pool::manager::{MonitorConfigUpdate, SessionFactory};
    use crate::pool::types::TokenCredentials;
    use crate::pool::types::test_support::ScriptedSession;
    use std::sync::Mutex;

    fn factory_with_registry() -> (
        SessionFactory,
        Arc<Mutex<HashMap<String, Arc<ScriptedSession>>>>,
    ) {
        let registry: Arc<Mutex<HashMap<String, Arc<ScriptedSession>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let reg = registry.clone();
        let log = Arc::new(Mutex::new(Vec::new()));
        let factory: SessionFactory = Arc::new(move |cookies: &CookieMap| {
            let id = cookies
                .get("next-auth.csrf-token")
                .cloned()
                .unwrap_or_else(|| "anonymous".to_string());
            let session = Arc::new(ScriptedSession::new(&id, log.clone()));
            reg.lock().unwrap().insert(id, session.clone());
            Ok(session as Arc<dyn Session>)
        });
        (factory, registry)
    }

    fn limits(pro: i64) -> RateLimits {
        let mut rl = RateLimits {
            pro_remaining: Some(pro),
            ..Default::default()
        };
        rl.modes.insert(
            "research".to_string(),
            ModeQuota {
                available: true,
                remaining: Some(1),
                kind: None,
            },
        );
        rl
    }

    #[tokio::test]
    async fn cycle_populates_session_valid_and_limits() {
        let (factory, registry) = factory_with_registry();
        let pool = Arc::new(Pool::new(factory, None));
        pool.add_token(TokenCredentials::new("a", "a", "s"))
            .await
            .unwrap();
        registry.lock().unwrap()["a"]
            .rate_limits
            .lock()
            .unwrap()
            .replace(limits(42));

        let report = run_cycle(&pool, None).await;
        assert_eq!(report["a"].status, "ok");
        assert_eq!(report["a"].state, "normal");

        let status = pool.status().await;
        assert_eq!(status.clients[0].session_valid, Some(true));
        assert_eq!(
            status.clients[0].rate_limits.as_ref().unwrap().pro_remaining,
            Some(42)
        );
        assert!(status.clients[0].last_check_at.is_some());
    }

    #[tokio::test]
    async fn cycle_marks_logged_out_sessions_offline() {
        let (factory, registry) = factory_with_registry();
        let pool = Arc::new(Pool::new(factory, None));
        pool.add_token(TokenCredentials::new("a", "a", "s"))
            .await
            .unwrap();
        registry.lock().unwrap()["a"].set_logged_in(false);

        let report = run_cycle(&pool, None).await;
        assert_eq!(report["a"].status, "error");
        assert_eq!(report["a"].state, "offline");

        let status = pool.status().await;
        assert_eq!(status.clients[0].session_valid, Some(false));
        assert_eq!(status.clients[0].state, "offline");

        // 会话恢复后，下一轮检查把状态拉回 normal
        registry.lock().unwrap()["a"].set_logged_in(true);
        registry.lock().unwrap()["a"]
            .rate_limits
            .lock()
            .unwrap()
            .replace(limits(3));
        let report = run_cycle(&pool, None).await;
        assert_eq!(report["a"].status, "ok");
        assert_eq!(report["a"].state, "normal");
    }

    #[tokio::test]
    async fn single_id_check_ignores_enable_flag() {
        let (factory, registry) = factory_with_registry();
        let pool = Arc::new(Pool::new(factory, None));
        pool.add_token(TokenCredentials::new("a", "a", "s"))
            .await
            .unwrap();
        pool.add_token(TokenCredentials::new("b", "b", "s"))
            .await
            .unwrap();
        pool.disable_token("a").await.unwrap();
        registry.lock().unwrap()["a"]
            .rate_limits
            .lock()
            .unwrap()
            .replace(limits(1));

        // 全量检查跳过停用的 a
        let report = run_cycle(&pool, None).await;
        assert!(!report.contains_key("a"));
        assert!(report.contains_key("b"));

        // 指定 id 时无视停用开关
        let report = run_cycle(&pool, Some("a")).await;
        assert_eq!(report["a"].status, "ok");
    }

    #[tokio::test]
    async fn disabled_monitor_parks_until_config_change() {
        let (factory, _) = factory_with_registry();
        let pool = Arc::new(Pool::new(factory, None));
        pool.add_token(TokenCredentials::new("a", "a", "s"))
            .await
            .unwrap();

        let handle = spawn(pool.clone());
        // 默认 enable=false：任务应停在等待上，不做任何检查
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        // 配置变更把它唤醒（仍为停用，回到等待）
        pool.set_monitor_config(MonitorConfigUpdate {
            enable: Some(false),
            ..Default::default()
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }
}
