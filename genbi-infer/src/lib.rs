use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::StreamExt;
use genbi_types::LlmRequest;
use thiserror::Error;

pub mod deadline;
pub mod http_chat;
pub mod scripted;

pub use deadline::DeadlineEngine;
pub use http_chat::HttpChatEngine;
pub use scripted::ScriptedLlmEngine;

#[derive(Clone, Debug)]
pub struct LlmToken {
    pub token_id: u32,
    pub text: String,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<LlmToken, LlmError>> + Send>>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Transport(String),
    #[error("HTTP status: {0}")]
    Status(String),
    #[error("unreadable provider response: {0}")]
    Parse(String),
    #[error("LLM call exceeded deadline of {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait LlmEngine: Send + Sync {
    /// Stream completion fragments for `req`. The stream is finite and single-use.
    async fn generate(&self, req: LlmRequest) -> Result<TokenStream, LlmError>;

    /// Whole completion as one string.
    async fn complete(&self, req: LlmRequest) -> Result<String, LlmError> {
        let mut stream = self.generate(req).await?;
        let mut out = String::new();
        while let Some(token) = stream.next().await {
            out.push_str(&token?.text);
        }
        Ok(out)
    }
}

/// Dummy implementation that yields no tokens.
pub struct NullLlmEngine;

#[async_trait]
impl LlmEngine for NullLlmEngine {
    async fn generate(&self, _req: LlmRequest) -> Result<TokenStream, LlmError> {
        use futures_util::stream;

        Ok(Box::pin(stream::empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(prompt: &str) -> LlmRequest {
        LlmRequest {
            prompt: prompt.into(),
            max_tokens: 16,
            temperature: 0.0,
        }
    }

    #[tokio::test]
    async fn null_engine_completes_empty() {
        assert_eq!(NullLlmEngine.complete(req("hi")).await.unwrap(), "");
    }

    #[tokio::test]
    async fn default_complete_concatenates_stream() {
        let engine = ScriptedLlmEngine::new(["SELECT id FROM orders WHERE total > 10;"]);
        let out = engine.complete(req("q")).await.unwrap();
        assert_eq!(out, "SELECT id FROM orders WHERE total > 10;");
    }
}
