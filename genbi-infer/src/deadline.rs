use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use genbi_types::LlmRequest;
use tokio::time::{timeout, timeout_at, Instant};

use crate::{LlmEngine, LlmError, TokenStream};

/// Bounds every call on the wrapped engine by `limit`.
///
/// For streams the deadline covers the whole stream, not each fragment; once it passes the
/// stream yields a single [`LlmError::Timeout`] and ends.
pub struct DeadlineEngine {
    inner: Arc<dyn LlmEngine>,
    limit: Duration,
}

impl DeadlineEngine {
    pub fn new(inner: Arc<dyn LlmEngine>, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl LlmEngine for DeadlineEngine {
    async fn generate(&self, req: LlmRequest) -> Result<TokenStream, LlmError> {
        let deadline = Instant::now() + self.limit;
        let limit = self.limit;
        let inner = timeout_at(deadline, self.inner.generate(req))
            .await
            .map_err(|_| LlmError::Timeout(limit))??;

        let bounded = stream::unfold(Some(inner), move |state| async move {
            let mut inner = state?;
            match timeout_at(deadline, inner.next()).await {
                Ok(Some(item)) => Some((item, Some(inner))),
                Ok(None) => None,
                Err(_) => Some((Err(LlmError::Timeout(limit)), None)),
            }
        });
        Ok(Box::pin(bounded))
    }

    async fn complete(&self, req: LlmRequest) -> Result<String, LlmError> {
        timeout(self.limit, self.inner.complete(req))
            .await
            .map_err(|_| LlmError::Timeout(self.limit))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LlmToken, ScriptedLlmEngine};

    struct Stalled;

    #[async_trait]
    impl LlmEngine for Stalled {
        async fn generate(&self, _req: LlmRequest) -> Result<TokenStream, LlmError> {
            let first = stream::iter(vec![Ok(LlmToken {
                token_id: 0,
                text: "partial".into(),
            })]);
            Ok(Box::pin(first.chain(stream::pending())))
        }
    }

    fn req() -> LlmRequest {
        LlmRequest {
            prompt: "p".into(),
            max_tokens: 8,
            temperature: 0.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_times_out() {
        let engine = DeadlineEngine::new(Arc::new(Stalled), Duration::from_secs(5));
        let err = engine.complete(req()).await.unwrap_err();
        assert!(matches!(err, LlmError::Timeout(_)));

        let mut s = engine.generate(req()).await.unwrap();
        assert_eq!(s.next().await.unwrap().unwrap().text, "partial");
        assert!(matches!(s.next().await, Some(Err(LlmError::Timeout(_)))));
        assert!(s.next().await.is_none());
    }

    #[tokio::test]
    async fn fast_engine_passes_through() {
        let engine = DeadlineEngine::new(
            Arc::new(ScriptedLlmEngine::new(["fine"])),
            Duration::from_secs(5),
        );
        assert_eq!(engine.complete(req()).await.unwrap(), "fine");
    }
}
