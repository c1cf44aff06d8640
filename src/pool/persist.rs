//! 池的两份落盘文件：主配置 `token_pool_config.json` 与跨进程状态
//! `pool_state.json`。写入一律走同目录临时文件 + rename，保证读端
//! 永远只会看到完整的 JSON（或文件不存在）。

use crate::perplexity::types::RateLimits;
use crate::pool::types::TokenCredentials;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

pub const STATE_FILE_VERSION: u32 = 2;
pub const STATE_FILE_NAME: &str = "pool_state.json";

/// monitor 配置。interval 单位为小时。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_interval")]
    pub interval: f64,
    #[serde(default)]
    pub tg_bot_token: Option<String>,
    #[serde(default)]
    pub tg_chat_id: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enable: false,
            interval: default_interval(),
            tg_bot_token: None,
            tg_chat_id: None,
        }
    }
}

impl MonitorConfig {
    /// 下限 0.1 小时，防止配置成热循环。
    pub fn interval_hours(&self) -> f64 {
        if self.interval.is_finite() {
            self.interval.max(0.1)
        } else {
            default_interval()
        }
    }

    pub fn telegram_target(&self) -> Option<(&str, &str)> {
        match (self.tg_bot_token.as_deref(), self.tg_chat_id.as_deref()) {
            (Some(token), Some(chat)) if !token.is_empty() && !chat.is_empty() => {
                Some((token, chat))
            }
            _ => None,
        }
    }
}

fn default_interval() -> f64 {
    6.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_true")]
    pub fallback_to_auto: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            fallback_to_auto: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// 主配置文件。tokens 的顺序即轮询顺序；未知顶层字段原样保留。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub tokens: Vec<TokenCredentials>,
    #[serde(flatten)]
    pub extra: HashMap<String, sonic_rs::Value>,
}

/// 跨进程状态文件。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub writer: String,
    #[serde(default)]
    pub clients: HashMap<String, ClientStateEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStateEntry {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub session_valid: Option<bool>,
    #[serde(default)]
    pub rate_limits: Option<RateLimits>,
    #[serde(default)]
    pub last_check_at: Option<String>,
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub fail_count: u64,
    #[serde(default)]
    pub backoff_until: i64,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// 写端冗余输出的派生状态，供旧读端与人工排查使用。
    #[serde(default)]
    pub state: String,
}

impl ClientStateEntry {
    /// session_valid 缺失时按旧版 state 字段推导。
    pub fn effective_session_valid(&self) -> Option<bool> {
        if self.session_valid.is_some() {
            return self.session_valid;
        }
        match self.state.as_str() {
            "offline" => Some(false),
            "normal" | "downgrade" | "exhausted" => Some(true),
            _ => None,
        }
    }
}

/// 状态文件固定放在配置文件旁边。
pub fn state_file_path(config_path: &Path) -> PathBuf {
    config_path.with_file_name(STATE_FILE_NAME)
}

pub async fn modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

pub async fn load_config(path: &Path) -> anyhow::Result<Option<ConfigFile>> {
    let data = match tokio::fs::read(path).await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context("读取 token_pool_config.json 失败"),
    };
    let cfg = sonic_rs::from_slice(&data).context("解析 token_pool_config.json 失败")?;
    Ok(Some(cfg))
}

pub async fn save_config(path: &Path, cfg: &ConfigFile) -> anyhow::Result<()> {
    let data = sonic_rs::to_vec_pretty(cfg).context("序列化 token_pool_config.json 失败")?;
    write_atomic(path, &data).await
}

pub async fn load_state(path: &Path) -> anyhow::Result<Option<StateFile>> {
    let data = match tokio::fs::read(path).await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context("读取 pool_state.json 失败"),
    };
    let state = sonic_rs::from_slice(&data).context("解析 pool_state.json 失败")?;
    Ok(Some(state))
}

pub async fn save_state(path: &Path, state: &StateFile) -> anyhow::Result<()> {
    let data = sonic_rs::to_vec_pretty(state).context("序列化 pool_state.json 失败")?;
    write_atomic(path, &data).await
}

/// 同目录临时文件 + rename。失败时清掉临时文件并把错误抛给调用方。
pub async fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(dir)
            .await
            .context("创建数据目录失败")?;
    }

    let tmp = temp_sibling(path);
    if let Err(e) = tokio::fs::write(&tmp, data).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(anyhow::Error::new(e)).context("写入临时文件失败");
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(anyhow::Error::new(e)).context("原子替换失败");
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("state");
    path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4().simple()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perplexity::types::ModeQuota;

    fn sample_config_json() -> &'static str {
        r#"{
  "monitor": {"enable": true, "interval": 2.5, "tg_bot_token": null, "tg_chat_id": null},
  "fallback": {"fallback_to_auto": false},
  "tokens": [
    {"id": "user1", "csrf_token": "c1", "session_token": "s1", "note": "first"},
    {"id": "user2", "csrf_token": "c2", "session_token": "s2"}
  ],
  "custom_section": {"anything": [1, 2, 3]}
}"#
    }

    #[tokio::test]
    async fn config_round_trip_preserves_order_and_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token_pool_config.json");
        tokio::fs::write(&path, sample_config_json()).await.unwrap();

        let cfg = load_config(&path).await.unwrap().unwrap();
        assert!(cfg.monitor.enable);
        assert_eq!(cfg.monitor.interval, 2.5);
        assert!(!cfg.fallback.fallback_to_auto);
        assert_eq!(cfg.tokens.len(), 2);
        assert_eq!(cfg.tokens[0].id, "user1");
        assert_eq!(cfg.tokens[1].id, "user2");
        assert!(cfg.extra.contains_key("custom_section"));
        assert!(cfg.tokens[0].extra.contains_key("note"));

        save_config(&path, &cfg).await.unwrap();
        let again = load_config(&path).await.unwrap().unwrap();
        assert_eq!(again.tokens[0].id, "user1");
        assert_eq!(again.tokens[1].id, "user2");
        assert!(again.extra.contains_key("custom_section"));
        assert!(again.tokens[0].extra.contains_key("note"));
    }

    #[tokio::test]
    async fn absent_files_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(&dir.path().join("missing.json")).await.unwrap().is_none());
        assert!(load_state(&dir.path().join("missing.json")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupted_state_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool_state.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();
        assert!(load_state(&path).await.is_err());
    }

    #[tokio::test]
    async fn interrupted_save_leaves_original_intact() {
        // 在临时文件写入与 rename 之间崩溃：原文件必须完好可读。重复 100 次。
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token_pool_config.json");
        tokio::fs::write(&path, sample_config_json()).await.unwrap();
        let original = load_config(&path).await.unwrap().unwrap();

        for i in 0..100 {
            let tmp = path.with_file_name(format!(".crash.{i}.tmp"));
            tokio::fs::write(&tmp, format!("{{\"half\": {i}"))
                .await
                .unwrap();
            // 不 rename，模拟进程在此处消失

            let loaded = load_config(&path).await.unwrap().unwrap();
            assert_eq!(loaded.tokens.len(), original.tokens.len());
            assert_eq!(loaded.tokens[0].id, "user1");
        }
    }

    #[tokio::test]
    async fn concurrent_reads_see_old_or_new_never_torn() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool_state.json");

        let make_state = |n: i64| {
            let mut s = StateFile {
                version: STATE_FILE_VERSION,
                updated_at: n,
                writer: "test".to_string(),
                ..Default::default()
            };
            s.clients.insert(
                "a".to_string(),
                ClientStateEntry {
                    enabled: true,
                    session_valid: Some(true),
                    rate_limits: Some(RateLimits {
                        pro_remaining: Some(n),
                        modes: [(
                            "research".to_string(),
                            ModeQuota {
                                available: true,
                                remaining: Some(n),
                                kind: None,
                            },
                        )]
                        .into_iter()
                        .collect(),
                        fetched_at: n,
                    }),
                    last_check_at: None,
                    request_count: 0,
                    fail_count: 0,
                    backoff_until: 0,
                    consecutive_failures: 0,
                    state: "normal".to_string(),
                },
            );
            s
        };

        save_state(&path, &make_state(0)).await.unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            for n in 1..=50i64 {
                save_state(&writer_path, &make_state(n)).await.unwrap();
            }
        });

        for _ in 0..200 {
            let loaded = load_state(&path).await.unwrap().unwrap();
            // 任何时刻读到的都是某个完整版本
            let n = loaded.updated_at;
            assert!((0..=50).contains(&n));
            let entry = loaded.clients.get("a").unwrap();
            assert_eq!(entry.rate_limits.as_ref().unwrap().pro_remaining, Some(n));
            tokio::task::yield_now().await;
        }

        writer.await.unwrap();
    }

    #[test]
    fn session_valid_derivation_from_legacy_state() {
        let entry = |sv: Option<bool>, state: &str| ClientStateEntry {
            enabled: true,
            session_valid: sv,
            rate_limits: None,
            last_check_at: None,
            request_count: 0,
            fail_count: 0,
            backoff_until: 0,
            consecutive_failures: 0,
            state: state.to_string(),
        };

        assert_eq!(entry(Some(false), "normal").effective_session_valid(), Some(false));
        assert_eq!(entry(None, "offline").effective_session_valid(), Some(false));
        assert_eq!(entry(None, "normal").effective_session_valid(), Some(true));
        assert_eq!(entry(None, "downgrade").effective_session_valid(), Some(true));
        assert_eq!(entry(None, "exhausted").effective_session_valid(), Some(true));
        assert_eq!(entry(None, "unknown").effective_session_valid(), None);
        assert_eq!(entry(None, "").effective_session_valid(), None);
    }

    #[test]
    fn interval_clamp() {
        let mut cfg = MonitorConfig::default();
        assert_eq!(cfg.interval_hours(), 6.0);
        cfg.interval = 0.0;
        assert_eq!(cfg.interval_hours(), 0.1);
        cfg.interval = -5.0;
        assert_eq!(cfg.interval_hours(), 0.1);
        cfg.interval = f64::NAN;
        assert_eq!(cfg.interval_hours(), 6.0);
    }
}
