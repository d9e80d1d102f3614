use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::stream;
use genbi_types::LlmRequest;
use tokio::sync::Mutex;

use crate::{LlmEngine, LlmError, LlmToken, TokenStream};

type Responder = Box<dyn Fn(&str) -> Result<String, LlmError> + Send + Sync>;

enum Script {
    Queue(Mutex<VecDeque<Result<String, LlmError>>>),
    Responder(Responder),
}

/// Offline engine that answers from a script and records every prompt it receives.
///
/// Replies are streamed word by word so streaming callers see several fragments.
pub struct ScriptedLlmEngine {
    script: Script,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlmEngine {
    /// Reply with `replies` in order; calls past the end fail with a transport error.
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_results(replies.into_iter().map(|r| Ok(r.into())))
    }

    pub fn with_results(replies: impl IntoIterator<Item = Result<String, LlmError>>) -> Self {
        Self {
            script: Script::Queue(Mutex::new(replies.into_iter().collect())),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Compute each reply from the prompt.
    pub fn from_fn(f: impl Fn(&str) -> Result<String, LlmError> + Send + Sync + 'static) -> Self {
        Self {
            script: Script::Responder(Box::new(f)),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub async fn prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }

    pub async fn calls(&self) -> usize {
        self.prompts.lock().await.len()
    }

    async fn reply(&self, prompt: &str) -> Result<String, LlmError> {
        self.prompts.lock().await.push(prompt.to_string());
        match &self.script {
            Script::Queue(queue) => queue
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Transport("script exhausted".into()))),
            Script::Responder(f) => f(prompt),
        }
    }
}

#[async_trait]
impl LlmEngine for ScriptedLlmEngine {
    async fn generate(&self, req: LlmRequest) -> Result<TokenStream, LlmError> {
        let text = self.reply(&req.prompt).await?;
        let tokens: Vec<Result<LlmToken, LlmError>> = text
            .split_inclusive(' ')
            .enumerate()
            .map(|(i, piece)| {
                Ok(LlmToken {
                    token_id: i as u32,
                    text: piece.to_string(),
                })
            })
            .collect();
        Ok(Box::pin(stream::iter(tokens)))
    }

    async fn complete(&self, req: LlmRequest) -> Result<String, LlmError> {
        self.reply(&req.prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn req(prompt: &str) -> LlmRequest {
        LlmRequest {
            prompt: prompt.into(),
            max_tokens: 8,
            temperature: 0.0,
        }
    }

    #[tokio::test]
    async fn replies_in_order_then_fails() {
        let engine = ScriptedLlmEngine::new(["one", "two"]);
        assert_eq!(engine.complete(req("a")).await.unwrap(), "one");
        assert_eq!(engine.complete(req("b")).await.unwrap(), "two");
        assert!(engine.complete(req("c")).await.is_err());
        assert_eq!(engine.prompts().await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn streams_word_fragments() {
        let engine = ScriptedLlmEngine::from_fn(|p| Ok(format!("echo of {p}")));
        let pieces: Vec<String> = engine
            .generate(req("x y"))
            .await
            .unwrap()
            .map(|t| t.unwrap().text)
            .collect()
            .await;
        assert_eq!(pieces, vec!["echo ", "of ", "x ", "y"]);
    }
}
