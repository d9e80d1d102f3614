use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding transport error: {0}")]
    Transport(String),
    #[error("embedding provider status: {0}")]
    Status(String),
    #[error("embedding parse error: {0}")]
    Parse(String),
    #[error("embedding count mismatch: sent {sent}, got {got}")]
    CountMismatch { sent: usize, got: usize },
}

/// Text → fixed-dimension vector provider.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut out = self.embed(&[text.to_string()]).await?;
        out.pop().ok_or(EmbedError::CountMismatch { sent: 1, got: 0 })
    }
}

/// Deterministic lexical embedding: signed hashed bag of lowercase tokens, L2-normalised.
pub fn embed(text: &str, dim: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dim];
    if dim == 0 {
        return v;
    }
    for token in text
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
    {
        let mut hasher = Sha256::new();
        hasher.update(token.to_ascii_lowercase().as_bytes());
        let digest = hasher.finalize();
        let idx = (u16::from_le_bytes([digest[0], digest[2]]) as usize) % dim;
        let sign = if digest[1] % 2 == 0 { 1.0 } else { -1.0 };
        v[idx] += sign;
    }
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

/// Offline embedder backed by [`embed`]. Used when no embedding endpoint is configured.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|t| embed(t, self.dim)).collect())
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// Inputs per request unless configured otherwise. Providers cap the input array
/// (OpenAI at 2048).
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// OpenAI-compatible `/embeddings` client (OpenAI, Ollama, LocalAI, vLLM).
///
/// Large inputs are sent as consecutive batches of at most `batch_size` texts; the
/// results come back in input order.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    batch_size: usize,
}

impl HttpEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    async fn embed_batch(&self, url: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut req = self.client.post(url).json(&EmbeddingRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| EmbedError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EmbedError::Status(resp.status().to_string()));
        }
        let mut parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| EmbedError::Parse(e.to_string()))?;
        if parsed.data.len() != texts.len() {
            return Err(EmbedError::CountMismatch {
                sent: texts.len(),
                got: parsed.data.len(),
            });
        }
        parsed.data.sort_by_key(|item| item.index);
        Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.embed_batch(&url, batch).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    type Seen = Arc<Mutex<Vec<usize>>>;

    /// Embeds "t<i>" as `[i]`, listing the items in reverse to exercise the index sort.
    async fn fake_embeddings(State(seen): State<Seen>, Json(body): Json<Value>) -> Json<Value> {
        let inputs = body["input"].as_array().cloned().unwrap_or_default();
        seen.lock().unwrap().push(inputs.len());
        let data: Vec<Value> = inputs
            .iter()
            .enumerate()
            .rev()
            .map(|(i, text)| {
                let n: f32 = text.as_str().unwrap_or("t0")[1..].parse().unwrap_or(-1.0);
                json!({ "index": i, "embedding": [n] })
            })
            .collect();
        Json(json!({ "data": data }))
    }

    async fn serve_fake_provider() -> (String, Seen) {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route("/embeddings", post(fake_embeddings))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/"), seen)
    }

    #[tokio::test]
    async fn http_embedder_sends_inputs_in_batches() {
        let (url, seen) = serve_fake_provider().await;
        let embedder = HttpEmbedder::new(url, "text-embedding-3-small", None).with_batch_size(4);
        let texts: Vec<String> = (0..10).map(|i| format!("t{i}")).collect();

        let out = embedder.embed(&texts).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![4, 4, 2]);
        let flat: Vec<f32> = out.into_iter().flatten().collect();
        assert_eq!(flat, (0..10).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn http_embedder_skips_the_request_for_no_input() {
        let (url, seen) = serve_fake_provider().await;
        let out = HttpEmbedder::new(url, "m", None).embed(&[]).await.unwrap();
        assert!(out.is_empty());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn deterministic_embedding() {
        let a = embed("hello world", 16);
        let b = embed("hello world", 16);
        assert_eq!(a, b);
    }

    #[test]
    fn punctuation_does_not_split_identity() {
        assert_eq!(embed("orders.customer_id", 64), embed("Orders customer_id", 64));
    }

    #[tokio::test]
    async fn hash_embedder_batches() {
        let e = HashEmbedder::new(32);
        let out = e
            .embed(&["a b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|v| v.len() == 32));
        let one = e.embed_one("a b").await.unwrap();
        assert_eq!(one, out[0]);
    }
}
