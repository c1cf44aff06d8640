//! Perplexity 上游的模式/模型/来源常量与请求响应类型。

use crate::perplexity::client::ApiError;
use serde::{Deserialize, Serialize};
use sonic_rs::{JsonContainerTrait, JsonValueTrait};
use std::collections::{BTreeMap, HashMap};

/// 上游接受的查询语言（ISO 639）。
pub const SEARCH_LANGUAGES: [&str; 7] = [
    "en-US", "en-GB", "pt-BR", "es-ES", "fr-FR", "de-DE", "zh-CN",
];

/// 单条查询最大长度（字符数）。
pub const MAX_QUERY_CHARS: usize = 10_000;

/// 搜索模式。pro/reasoning/deep research 消耗账号配额，auto 不消耗。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchMode {
    Auto,
    Pro,
    Reasoning,
    DeepResearch,
}

impl SearchMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "auto" => Some(Self::Auto),
            "pro" => Some(Self::Pro),
            "reasoning" => Some(Self::Reasoning),
            "deep research" => Some(Self::DeepResearch),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Pro => "pro",
            Self::Reasoning => "reasoning",
            Self::DeepResearch => "deep research",
        }
    }

    /// 是否为付费档位（走 pro 配额或 research 配额）。
    pub fn is_pro_tier(self) -> bool {
        !matches!(self, Self::Auto)
    }

    /// 上游载荷里的 mode 字段：auto 走 concise，其余走 copilot。
    pub fn wire_mode(self) -> &'static str {
        match self {
            Self::Auto => "concise",
            _ => "copilot",
        }
    }
}

impl std::fmt::Display for SearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 信息来源。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Web,
    Scholar,
    Social,
}

impl Source {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "web" => Some(Self::Web),
            "scholar" => Some(Self::Scholar),
            "social" => Some(Self::Social),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Scholar => "scholar",
            Self::Social => "social",
        }
    }
}

/// 各模式可选模型到后端 model_preference 的映射。None 表示默认模型。
fn model_table(mode: SearchMode) -> &'static [(Option<&'static str>, &'static str)] {
    match mode {
        SearchMode::Auto => &[(None, "turbo")],
        SearchMode::Pro => &[
            (None, "pplx_pro"),
            (Some("sonar"), "experimental"),
            (Some("gpt-5.2"), "gpt52"),
            (Some("claude-4.5-sonnet"), "claude45sonnet"),
            (Some("grok-4.1"), "grok41nonreasoning"),
        ],
        SearchMode::Reasoning => &[
            (None, "pplx_reasoning"),
            (Some("gpt-5.2-thinking"), "gpt52_thinking"),
            (Some("claude-4.5-sonnet-thinking"), "claude45sonnetthinking"),
            (Some("gemini-3.0-pro"), "gemini30pro"),
            (Some("kimi-k2-thinking"), "kimik2thinking"),
            (Some("grok-4.1-reasoning"), "grok41reasoning"),
        ],
        SearchMode::DeepResearch => &[(None, "pplx_alpha")],
    }
}

/// 校验模型并返回后端 model_preference。
pub fn model_preference(mode: SearchMode, model: Option<&str>) -> Result<&'static str, ApiError> {
    let table = model_table(mode);
    for (name, pref) in table {
        if *name == model {
            return Ok(pref);
        }
    }
    let valid: Vec<&str> = table.iter().map(|(n, _)| n.unwrap_or("None")).collect();
    Err(ApiError::Validation(format!(
        "Invalid model '{}' for mode '{}'. Valid models: {}",
        model.unwrap_or("None"),
        mode.as_str(),
        valid.join(", ")
    )))
}

/// 某个模式的配额明细。remaining 为 None 表示上游未披露精确数值。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeQuota {
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub remaining: Option<i64>,
    #[serde(default)]
    pub kind: Option<String>,
}

/// 某一时刻的上游配额快照。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimits {
    #[serde(default)]
    pub pro_remaining: Option<i64>,
    #[serde(default)]
    pub modes: HashMap<String, ModeQuota>,
    #[serde(default)]
    pub fetched_at: i64,
}

impl RateLimits {
    pub fn mode(&self, key: &str) -> Option<&ModeQuota> {
        self.modes.get(key)
    }

    pub fn mode_mut(&mut self, key: &str) -> &mut ModeQuota {
        self.modes.entry(key.to_string()).or_default()
    }
}

/// auth/session 的返回。登录会话带 user 字段，匿名会话为空对象。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub user: Option<sonic_rs::Value>,
}

impl UserInfo {
    pub fn is_logged_in(&self) -> bool {
        self.user.as_ref().is_some_and(|u| !u.is_null())
    }
}

/// 一次搜索请求。files 为文件名 → 内容。
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub mode: SearchMode,
    pub model: Option<String>,
    pub sources: Vec<Source>,
    pub files: BTreeMap<String, Vec<u8>>,
    pub language: String,
    pub incognito: bool,
}

impl SearchRequest {
    /// 派发前的无状态校验。全部走显式 ValidationError，不依赖 debug 断言。
    pub fn validate(&self) -> Result<(), ApiError> {
        let query = self.query.trim();
        if query.is_empty() {
            return Err(ApiError::Validation("Query cannot be empty".to_string()));
        }
        if query.chars().count() > MAX_QUERY_CHARS {
            return Err(ApiError::Validation(format!(
                "Query is too long (max {MAX_QUERY_CHARS} characters)"
            )));
        }
        if self.sources.is_empty() {
            return Err(ApiError::Validation(
                "At least one source must be specified".to_string(),
            ));
        }
        if !SEARCH_LANGUAGES.contains(&self.language.as_str()) {
            return Err(ApiError::Validation(format!(
                "Invalid language '{}'. Choose from: {}",
                self.language,
                SEARCH_LANGUAGES.join(", ")
            )));
        }
        model_preference(self.mode, self.model.as_deref())?;
        for name in self.files.keys() {
            if name.trim().is_empty() {
                return Err(ApiError::Validation("Filename cannot be empty".to_string()));
            }
        }
        Ok(())
    }
}

/// 搜索的结构化结果：流终止时的最后一条 message。
#[derive(Debug, Clone, Default)]
pub struct SearchResponse {
    /// 最终回答文本（FINAL step 或顶层 answer 字段）。
    pub answer: Option<String>,
    /// 回答引用的 chunk 列表（含 URL 的对象）。
    pub chunks: Vec<sonic_rs::Value>,
    /// text 载荷：deep research 为 step 对象数组，普通回答为字符串。
    pub text: sonic_rs::Value,
}

impl SearchResponse {
    pub fn is_empty(&self) -> bool {
        self.answer.as_deref().map(str::trim).unwrap_or("").is_empty()
            && self.text.is_null()
            && self.chunks.is_empty()
    }

    /// deep research 的结构特征：text 是 step 对象数组而非纯字符串。
    pub fn is_research_shaped(&self) -> bool {
        self.text.is_array()
    }
}

/// 返回给调用方的精简结果。
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub sources: Vec<SourceLink>,
    #[serde(flatten)]
    pub fallback: Option<FallbackInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceLink {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// 降级兜底信息：标记结果来自哪一级 fallback。
#[derive(Debug, Clone, Serialize)]
pub struct FallbackInfo {
    pub fallback: bool,
    pub fallback_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_model: Option<String>,
}

/// 从响应中抽取最终回答与来源链接。
///
/// 来源优先取 text 里 SEARCH_RESULTS step 的 web_results，
/// 缺失时退回 chunks 字段里带 URL 的对象。
pub fn extract_clean_result(resp: &SearchResponse) -> CleanResult {
    let mut sources: Vec<SourceLink> = Vec::new();

    if let Some(steps) = resp.text.as_array() {
        for step in steps.iter() {
            let is_search = step
                .get("step_type")
                .and_then(|v| v.as_str())
                .is_some_and(|t| t == "SEARCH_RESULTS");
            if !is_search {
                continue;
            }
            let Some(results) = step
                .get("content")
                .and_then(|c| c.get("web_results"))
                .and_then(|v| v.as_array())
            else {
                continue;
            };
            for r in results.iter() {
                let Some(url) = r.get("url").and_then(|v| v.as_str()) else {
                    continue;
                };
                sources.push(SourceLink {
                    url: url.to_string(),
                    title: r.get("name").and_then(|v| v.as_str()).map(str::to_string),
                });
            }
        }
    }

    if sources.is_empty() {
        for chunk in &resp.chunks {
            let Some(url) = chunk.get("url").and_then(|v| v.as_str()) else {
                continue;
            };
            let title = chunk
                .get("title")
                .and_then(|v| v.as_str())
                .or_else(|| chunk.get("name").and_then(|v| v.as_str()))
                .map(str::to_string);
            sources.push(SourceLink {
                url: url.to_string(),
                title,
            });
        }
    }

    CleanResult {
        answer: resp.answer.clone(),
        sources,
        fallback: None,
    }
}
