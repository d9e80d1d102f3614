use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::{stream, StreamExt};
use genbi_types::LlmRequest;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{LlmEngine, LlmError, LlmToken, TokenStream};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChatChoiceDelta>,
}

#[derive(Deserialize)]
struct ChatChoiceDelta {
    delta: Delta,
}

#[derive(Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Ignore,
    Done,
    Content(String),
}

/// Interpret one line of an OpenAI-style SSE body.
fn parse_sse_line(line: &str) -> Result<SseLine, LlmError> {
    let Some(data) = line.strip_prefix("data:") else {
        // Blank separators, `event:` and `: keep-alive` comments.
        return Ok(SseLine::Ignore);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(SseLine::Ignore);
    }
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    let chunk: ChatCompletionChunk =
        serde_json::from_str(data).map_err(|e| LlmError::Parse(e.to_string()))?;
    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();
    if text.is_empty() {
        Ok(SseLine::Ignore)
    } else {
        Ok(SseLine::Content(text))
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>;

struct SseState {
    body: ByteStream,
    buf: Vec<u8>,
    pending: VecDeque<Result<LlmToken, LlmError>>,
    next_id: u32,
    done: bool,
}

impl SseState {
    /// Move every complete line out of the buffer. Chunks can split lines anywhere.
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            match parse_sse_line(line.trim()) {
                Ok(SseLine::Ignore) => {}
                Ok(SseLine::Done) => {
                    self.done = true;
                    self.buf.clear();
                    return;
                }
                Ok(SseLine::Content(text)) => {
                    self.pending.push_back(Ok(LlmToken {
                        token_id: self.next_id,
                        text,
                    }));
                    self.next_id += 1;
                }
                Err(e) => self.pending.push_back(Err(e)),
            }
        }
    }
}

/// LLM engine for any OpenAI-compatible `/chat/completions` endpoint.
pub struct HttpChatEngine {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpChatEngine {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
        }
    }

    async fn send(&self, req: LlmRequest, stream: bool) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user".into(),
                content: req.prompt,
            }],
            max_tokens: req.max_tokens as u32,
            temperature: req.temperature,
            stream,
        };

        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(LlmError::Status(resp.status().to_string()));
        }
        Ok(resp)
    }
}

#[async_trait]
impl LlmEngine for HttpChatEngine {
    async fn generate(&self, req: LlmRequest) -> Result<TokenStream, LlmError> {
        let resp = self.send(req, true).await?;
        debug!(model = %self.model, "streaming chat completion");

        let body: ByteStream = Box::pin(resp.bytes_stream().map(|r| r.map(|b| b.to_vec())));
        let state = SseState {
            body,
            buf: Vec::new(),
            pending: VecDeque::new(),
            next_id: 0,
            done: false,
        };

        let tokens = stream::unfold(state, |mut st| async move {
            loop {
                if let Some(item) = st.pending.pop_front() {
                    return Some((item, st));
                }
                if st.done {
                    return None;
                }
                match st.body.next().await {
                    Some(Ok(bytes)) => {
                        st.buf.extend_from_slice(&bytes);
                        st.drain_lines();
                    }
                    Some(Err(e)) => {
                        st.done = true;
                        return Some((Err(LlmError::Transport(format!("stream error: {e}"))), st));
                    }
                    None => {
                        // Flush a final line without a trailing newline.
                        st.buf.push(b'\n');
                        st.drain_lines();
                        st.done = true;
                    }
                }
            }
        });

        Ok(Box::pin(tokens) as TokenStream)
    }

    async fn complete(&self, req: LlmRequest) -> Result<String, LlmError> {
        let resp = self.send(req, false).await?;
        let completion: ChatCompletion = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::Parse("response has no choices".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_lines_are_classified() {
        assert_eq!(parse_sse_line("").unwrap(), SseLine::Ignore);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseLine::Ignore);
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), SseLine::Done);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"SEL"}}]}"#).unwrap(),
            SseLine::Content("SEL".into())
        );
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            SseLine::Ignore
        );
        assert!(parse_sse_line("data: {not json").is_err());
    }

    #[tokio::test]
    async fn lines_split_across_chunks_are_reassembled() {
        let chunks: Vec<Result<Vec<u8>, reqwest::Error>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"con".to_vec()),
            Ok(b"tent\":\"SELECT \"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"1;\"}}]}\n".to_vec()),
            Ok(b"data: [DONE]\n\n".to_vec()),
        ];
        let mut st = SseState {
            body: Box::pin(stream::iter(chunks)),
            buf: Vec::new(),
            pending: VecDeque::new(),
            next_id: 0,
            done: false,
        };
        while let Some(Ok(bytes)) = st.body.next().await {
            st.buf.extend_from_slice(&bytes);
            st.drain_lines();
        }
        let text: String = st
            .pending
            .into_iter()
            .map(|t| t.unwrap().text)
            .collect();
        assert_eq!(text, "SELECT 1;");
        assert!(st.done);
    }
}
