//! stdio 工具服务进程（`pplx2api -stdio`）。
//!
//! stdin 每行一个 JSON 请求，stdout 每行一个 JSON 响应。四个工具映射到
//! 四种搜索模式，全部经由 run_query 走同一套池调度；池状态通过
//! pool_state.json 与管理服务进程保持最终一致。

use crate::pool::Pool;
use crate::query::{QueryError, QueryRequest, run_query};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

struct ToolSpec {
    name: &'static str,
    mode: &'static str,
    default_sources: &'static [&'static str],
    description: &'static str,
}

const TOOLS: [ToolSpec; 4] = [
    ToolSpec {
        name: "perplexity_search",
        mode: "auto",
        default_sources: &["web"],
        description: "快速事实查询，返回简短回答与引用。",
    },
    ToolSpec {
        name: "perplexity_ask",
        mode: "pro",
        default_sources: &["web"],
        description: "技术问答与文档检索，返回带引用的综合回答。",
    },
    ToolSpec {
        name: "perplexity_reason",
        mode: "reasoning",
        default_sources: &["web"],
        description: "逐步推理型分析，适合比较与取舍决策。",
    },
    ToolSpec {
        name: "perplexity_research",
        mode: "deep research",
        default_sources: &["web", "scholar"],
        description: "深度研究，耗时更长，返回带大量引用的报告。",
    },
];

#[derive(Debug, Default, Deserialize)]
struct StdioRequest {
    #[serde(default)]
    id: Option<sonic_rs::Value>,
    #[serde(default)]
    tool: String,
    #[serde(default)]
    params: StdioParams,
}

#[derive(Debug, Default, Deserialize)]
struct StdioParams {
    #[serde(default)]
    query: String,
    #[serde(default)]
    sources: Option<Vec<String>>,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Serialize)]
struct StdioResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<sonic_rs::Value>,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<StdioError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDescriptor>>,
}

#[derive(Debug, Serialize)]
struct StdioError {
    kind: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct ToolDescriptor {
    name: &'static str,
    description: &'static str,
}

pub async fn run(pool: Arc<Pool>) -> anyhow::Result<()> {
    tracing::info!("stdio 工具服务已启动");
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = handle_line(&pool, line).await;
        let mut data = sonic_rs::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());
        data.push(b'\n');
        stdout.write_all(&data).await?;
        stdout.flush().await?;
    }

    tracing::info!("stdin 已关闭，stdio 服务退出");
    Ok(())
}

async fn handle_line(pool: &Pool, line: &str) -> StdioResponse {
    let request: StdioRequest = match sonic_rs::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            return error_response(None, "invalid_request", &format!("请求 JSON 解析失败: {e}"));
        }
    };

    if request.tool == "list_tools" {
        return StdioResponse {
            id: request.id,
            status: "ok",
            text: None,
            error: None,
            tools: Some(
                TOOLS
                    .iter()
                    .map(|t| ToolDescriptor {
                        name: t.name,
                        description: t.description,
                    })
                    .collect(),
            ),
        };
    }

    let Some(tool) = TOOLS.iter().find(|t| t.name == request.tool) else {
        let known: Vec<&str> = TOOLS.iter().map(|t| t.name).collect();
        return error_response(
            request.id,
            "unknown_tool",
            &format!("未知工具 '{}'，可用: {}", request.tool, known.join(", ")),
        );
    };

    let sources = request.params.sources.clone().unwrap_or_else(|| {
        tool.default_sources.iter().map(|s| s.to_string()).collect()
    });

    let query = QueryRequest {
        query: request.params.query.clone(),
        mode: tool.mode.to_string(),
        model: None,
        sources: Some(sources),
        files: None,
        language: request.params.language.clone(),
        incognito: false,
    };

    match run_query(pool, query).await {
        Ok(clean) => StdioResponse {
            id: request.id,
            status: "ok",
            text: Some(format_answer(&clean)),
            error: None,
            tools: None,
        },
        Err(e) => {
            let kind = match &e {
                QueryError::Validation(_) => "validation".to_string(),
                QueryError::AllUnavailable { .. } => "all_unavailable".to_string(),
                QueryError::Exhausted { kind, .. } => kind.as_str().to_string(),
            };
            error_response(request.id, &kind, &e.to_string())
        }
    }
}

fn error_response(id: Option<sonic_rs::Value>, kind: &str, message: &str) -> StdioResponse {
    StdioResponse {
        id,
        status: "error",
        text: None,
        error: Some(StdioError {
            kind: kind.to_string(),
            message: message.to_string(),
        }),
        tools: None,
    }
}

/// 回答 + 引用列表，Markdown 格式。引用最多列 10 条。
fn format_answer(clean: &crate::perplexity::types::CleanResult) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(answer) = &clean.answer
        && !answer.trim().is_empty()
    {
        parts.push(answer.clone());
    }

    if !clean.sources.is_empty() {
        let mut section = String::from("## Sources");
        for (i, s) in clean.sources.iter().take(10).enumerate() {
            let title = s.title.as_deref().unwrap_or(&s.url);
            section.push_str(&format!("\n{}. [{}]({})", i + 1, title, s.url));
        }
        parts.push(section);
    }

    if parts.is_empty() {
        return "No response received.".to_string();
    }
    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perplexity::client::Session;
    use crate::pool::manager::SessionFactory;
    use crate::pool::types::TokenCredentials;
    use crate::pool::types::test_support::{ScriptedSession, ok_response};
    use crate::perplexity::types::{CleanResult, SourceLink};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    async fn test_pool() -> (Arc<Pool>, Arc<Mutex<HashMap<String, Arc<ScriptedSession>>>>) {
        let registry: Arc<Mutex<HashMap<String, Arc<ScriptedSession>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let reg = registry.clone();
        let log = Arc::new(Mutex::new(Vec::new()));
        let factory: SessionFactory = Arc::new(move |cookies| {
            let id = cookies
                .get("next-auth.csrf-token")
                .cloned()
                .unwrap_or_else(|| "anonymous".to_string());
            let session = Arc::new(ScriptedSession::new(&id, log.clone()));
            reg.lock().unwrap().insert(id, session.clone());
            Ok(session as Arc<dyn Session>)
        });
        let pool = Arc::new(Pool::new(factory, None));
        pool.add_token(TokenCredentials::new("a", "a", "s"))
            .await
            .unwrap();
        (pool, registry)
    }

    #[tokio::test]
    async fn dispatches_tool_to_expected_mode() {
        let (pool, registry) = test_pool().await;
        registry.lock().unwrap()["a"].push(Ok(ok_response("the answer")));

        let resp = handle_line(
            &pool,
            r#"{"id": 1, "tool": "perplexity_ask", "params": {"query": "what is rust"}}"#,
        )
        .await;
        assert_eq!(resp.status, "ok");
        assert!(resp.text.unwrap().contains("the answer"));
    }

    #[tokio::test]
    async fn unknown_tool_and_bad_json_are_errors() {
        let (pool, _) = test_pool().await;

        let resp = handle_line(&pool, r#"{"tool": "perplexity_teleport"}"#).await;
        assert_eq!(resp.status, "error");
        assert_eq!(resp.error.unwrap().kind, "unknown_tool");

        let resp = handle_line(&pool, "not json").await;
        assert_eq!(resp.status, "error");
        assert_eq!(resp.error.unwrap().kind, "invalid_request");
    }

    #[tokio::test]
    async fn list_tools_returns_all_four() {
        let (pool, _) = test_pool().await;
        let resp = handle_line(&pool, r#"{"tool": "list_tools"}"#).await;
        assert_eq!(resp.status, "ok");
        assert_eq!(resp.tools.unwrap().len(), 4);
    }

    #[test]
    fn answer_formatting_limits_sources() {
        let clean = CleanResult {
            answer: Some("body".to_string()),
            sources: (0..15)
                .map(|i| SourceLink {
                    url: format!("https://e{i}.example"),
                    title: if i % 2 == 0 {
                        Some(format!("Title {i}"))
                    } else {
                        None
                    },
                })
                .collect(),
            fallback: None,
        };
        let text = format_answer(&clean);
        assert!(text.starts_with("body"));
        assert!(text.contains("## Sources"));
        assert!(text.contains("10. "));
        assert!(!text.contains("11. "));

        let empty = CleanResult::default();
        assert_eq!(format_answer(&empty), "No response received.");
    }
}
