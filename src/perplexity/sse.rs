//! SSE 流消费：按 `\r\n\r\n` 切帧，跟踪最后一条 message，
//! 只有收到 `event: end_of_stream` 才算成功结束。

use crate::perplexity::client::ApiError;
use crate::perplexity::types::SearchResponse;
use sonic_rs::{JsonContainerTrait, JsonValueTrait};
use tokio_stream::StreamExt;

const FRAME_DELIMITER: &[u8] = b"\r\n\r\n";
const MESSAGE_PREFIX: &str = "event: message\r\ndata: ";
const END_PREFIX: &str = "event: end_of_stream";

/// 消费整个 SSE 响应，返回流终止时的最终消息。
///
/// 流在没有 end_of_stream 的情况下关闭（包括传输中断）一律判定为
/// `EmptyResponse`，调用方据此换下一个客户端而不是崩溃。
pub async fn collect_final(resp: reqwest::Response) -> Result<SearchResponse, ApiError> {
    let mut splitter = FrameSplitter::default();
    let mut last_message: Option<sonic_rs::Value> = None;

    let mut stream = resp.bytes_stream();
    while let Some(item) = stream.next().await {
        let chunk = match item {
            Ok(c) => c,
            // 读流中途断开：视同未收到结束标记。
            Err(_) => return Err(ApiError::EmptyResponse),
        };
        for frame in splitter.push(chunk.as_ref()) {
            match frame {
                Frame::Message(value) => last_message = Some(value),
                Frame::EndOfStream => {
                    let Some(message) = last_message else {
                        return Err(ApiError::EmptyResponse);
                    };
                    return Ok(finalize_message(message));
                }
            }
        }
    }

    Err(ApiError::EmptyResponse)
}

enum Frame {
    Message(sonic_rs::Value),
    EndOfStream,
}

/// 跨 chunk 的帧切分器。尾部不完整的帧留在缓冲里等下一个 chunk。
#[derive(Default)]
struct FrameSplitter {
    buf: Vec<u8>,
}

impl FrameSplitter {
    fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0usize;
        while let Some(pos) = find_delimiter(&self.buf[start..]) {
            let frame = &self.buf[start..start + pos];
            if let Some(parsed) = parse_frame(frame) {
                frames.push(parsed);
            }
            start += pos + FRAME_DELIMITER.len();
        }
        if start > 0 {
            self.buf.drain(..start);
        }
        frames
    }
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_DELIMITER.len())
        .position(|w| w == FRAME_DELIMITER)
}

fn parse_frame(frame: &[u8]) -> Option<Frame> {
    let content = std::str::from_utf8(frame).ok()?;
    if content.starts_with(END_PREFIX) {
        return Some(Frame::EndOfStream);
    }
    let json = content.strip_prefix(MESSAGE_PREFIX)?;
    let value: sonic_rs::Value = sonic_rs::from_str(json).ok()?;
    Some(Frame::Message(value))
}

/// 把最后一条 message 规整为结构化响应。
///
/// text 字段是嵌套的 JSON 字符串；deep research 下解析为 step 数组，
/// FINAL step 的 content.answer 又是一层 JSON 字符串，内含 answer/chunks。
fn finalize_message(message: sonic_rs::Value) -> SearchResponse {
    let mut out = SearchResponse::default();

    let text = message.get("text").cloned().unwrap_or_default();
    let parsed_text = match text
        .as_str()
        .map(sonic_rs::from_str::<sonic_rs::Value>)
    {
        Some(Ok(parsed)) => parsed,
        // 非字符串载荷或解析失败：按原值处理
        Some(Err(_)) | None => text,
    };

    if let Some(steps) = parsed_text.as_array() {
        for step in steps.iter() {
            let is_final = step
                .get("step_type")
                .and_then(|v| v.as_str())
                .is_some_and(|t| t == "FINAL");
            if !is_final {
                continue;
            }
            let Some(answer_raw) = step
                .get("content")
                .and_then(|c| c.get("answer"))
                .and_then(|v| v.as_str())
            else {
                continue;
            };
            if let Ok(answer_data) = sonic_rs::from_str::<sonic_rs::Value>(answer_raw) {
                out.answer = answer_data
                    .get("answer")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                if let Some(chunks) = answer_data.get("chunks").and_then(|v| v.as_array()) {
                    out.chunks = chunks.iter().map(|c| c.to_owned()).collect();
                }
            }
            break;
        }
    }

    // 普通回答：answer 直接在顶层。
    if out.answer.is_none() {
        out.answer = message
            .get("answer")
            .and_then(|v| v.as_str())
            .map(str::to_string);
    }
    if out.chunks.is_empty()
        && let Some(chunks) = message.get("chunks").and_then(|v| v.as_array())
    {
        out.chunks = chunks.iter().map(|c| c.to_owned()).collect();
    }

    out.text = parsed_text;
    out
}
