use crate::error::CapabilityError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 768;

/// Implementations must be safe to call concurrently.
#[async_trait]
pub trait LlmCapability: Send + Sync {
    async fn complete(&self, prompt: &str, deadline: Duration) -> Result<String, CapabilityError>;

    /// One vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError>;

    fn embedding_dimensions(&self) -> usize;
}

/// Deterministic local character-trigram embedder; `complete` is
/// unsupported, which drives the metadata stage into its degraded path.
#[derive(Debug, Clone, Copy)]
pub struct NgramEmbedder {
    pub dimensions: usize,
}

impl Default for NgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl NgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl LlmCapability for NgramEmbedder {
    async fn complete(&self, _prompt: &str, _deadline: Duration) -> Result<String, CapabilityError> {
        Err(CapabilityError::Unsupported(
            "local embedder has no completion model".to_string(),
        ))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }

    fn embedding_dimensions(&self) -> usize {
        self.dimensions
    }
}

#[derive(Debug, Serialize)]
struct CompleteRequest<'a> {
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompleteResponse {
    text: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Option<Vec<Vec<f32>>>,
}

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Every request carries a deadline so a stalled endpoint surfaces as a
/// retryable timeout instead of wedging the pipeline.
pub struct HttpLlm {
    endpoint: String,
    api_key: Option<String>,
    dimensions: usize,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpLlm {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, dimensions: usize) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
            dimensions,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(format!("{}/{path}", self.endpoint.trim_end_matches('/')));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request
    }

    fn map_status(status: reqwest::StatusCode) -> Option<CapabilityError> {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Some(CapabilityError::RateLimited(status.to_string()))
        } else if !status.is_success() {
            Some(CapabilityError::Malformed(format!(
                "model service returned {status}"
            )))
        } else {
            None
        }
    }
}

#[async_trait]
impl LlmCapability for HttpLlm {
    async fn complete(&self, prompt: &str, deadline: Duration) -> Result<String, CapabilityError> {
        let response = self
            .request("v1/complete")
            .timeout(deadline)
            .json(&CompleteRequest { prompt })
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    CapabilityError::Timeout(deadline)
                } else {
                    CapabilityError::Http(error)
                }
            })?;

        if let Some(error) = Self::map_status(response.status()) {
            return Err(error);
        }

        let payload: CompleteResponse = response.json().await?;
        payload
            .text
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| CapabilityError::Malformed("completion response has no text".to_string()))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        let response = self
            .request("v1/embeddings")
            .timeout(self.timeout)
            .json(&EmbedRequest { input: texts })
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    CapabilityError::Timeout(self.timeout)
                } else {
                    CapabilityError::Http(error)
                }
            })?;

        if let Some(error) = Self::map_status(response.status()) {
            return Err(error);
        }

        let payload: EmbedResponse = response.json().await?;
        let embeddings = payload.embeddings.ok_or_else(|| {
            CapabilityError::Malformed("embedding response has no vectors".to_string())
        })?;

        if embeddings.len() != texts.len() {
            return Err(CapabilityError::Malformed(format!(
                "requested {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }

        Ok(embeddings)
    }

    fn embedding_dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn embedder_is_deterministic() {
        let embedder = NgramEmbedder::new(64);
        let first = embedder
            .embed(&["Hydraulic pressure and flow".to_string()])
            .await
            .unwrap();
        let second = embedder
            .embed(&["Hydraulic pressure and flow".to_string()])
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].len(), 64);
    }

    #[tokio::test]
    async fn embedder_outputs_one_vector_per_input() {
        let embedder = NgramEmbedder::new(32);
        let vectors = embedder
            .embed(&["alpha".to_string(), "beta".to_string(), "gamma".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 3);
        assert!(vectors.iter().all(|v| v.len() == 32));
    }

    #[tokio::test]
    async fn local_embedder_has_no_completion() {
        let embedder = NgramEmbedder::default();
        let error = embedder
            .complete("anything", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(error, CapabilityError::Unsupported(_)));
        assert!(!error.is_transient());
    }

    #[tokio::test]
    async fn stalled_embedding_endpoint_times_out() {
        // Accepts the connection, then never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(socket);
        });

        let llm = HttpLlm::new(format!("http://{addr}"), None, 8)
            .with_timeout(Duration::from_millis(100));
        let error = llm.embed(&["stuck".to_string()]).await.unwrap_err();
        assert!(matches!(error, CapabilityError::Timeout(_)), "got: {error}");
        assert!(error.is_transient());
        server.abort();
    }

    #[tokio::test]
    async fn similar_texts_score_closer_than_unrelated() {
        let embedder = NgramEmbedder::new(128);
        let pump = embedder.embed_one("hydraulic pump maintenance");
        let pumps = embedder.embed_one("hydraulic pump maintenance schedule");
        let lunch = embedder.embed_one("quarterly catering invoice totals");

        let cos = |a: &[f32], b: &[f32]| -> f32 { a.iter().zip(b).map(|(x, y)| x * y).sum() };
        assert!(cos(&pump, &pumps) > cos(&pump, &lunch));
    }
}
