use crate::error::IndexError;
use crate::models::{Chunk, IndexHit, SourceLocator};
use crate::traits::VectorIndex;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct QdrantStore {
    endpoint: String,
    collection: String,
    client: Client,
    vector_size: usize,
    timeout: Duration,
}

impl QdrantStore {
    pub fn new(
        endpoint: impl Into<String>,
        collection: impl Into<String>,
        vector_size: usize,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            collection: collection.into(),
            client: Client::new(),
            vector_size,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn ensure_collection(&self) -> Result<(), IndexError> {
        let response = self
            .client
            .put(format!("{}/collections/{}", self.endpoint, self.collection))
            .timeout(self.timeout)
            .json(&json!({
                "vectors": {"size": self.vector_size, "distance": "Cosine"}
            }))
            .send()
            .await?;

        // 409 means the collection already exists.
        if !response.status().is_success() && response.status().as_u16() != 409 {
            return Err(IndexError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }
        Ok(())
    }

    fn guard_tenant(tenant_id: &str) -> Result<(), IndexError> {
        if tenant_id.trim().is_empty() {
            return Err(IndexError::IsolationViolation);
        }
        Ok(())
    }

    fn point_id(tenant_id: &str, chunk_id: &str) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(tenant_id.as_bytes());
        hasher.update(b":");
        hasher.update(chunk_id.as_bytes());
        let digest = hasher.finalize();
        u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ])
    }

    fn tenant_filter(tenant_id: &str) -> Value {
        json!({
            "must": [{"key": "tenant_id", "match": {"value": tenant_id}}]
        })
    }
}

#[async_trait]
impl VectorIndex for QdrantStore {
    async fn upsert_vectors(
        &self,
        tenant_id: &str,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
    ) -> Result<(), IndexError> {
        Self::guard_tenant(tenant_id)?;

        if chunks.len() != vectors.len() {
            return Err(IndexError::Request(format!(
                "vector count {} does not match chunk count {}",
                vectors.len(),
                chunks.len()
            )));
        }

        let points = chunks
            .iter()
            .zip(vectors.iter())
            .map(|(chunk, vector)| {
                if vector.len() != self.vector_size {
                    return Err(IndexError::DimensionMismatch {
                        expected: self.vector_size,
                        actual: vector.len(),
                    });
                }
                Ok(json!({
                    "id": Self::point_id(tenant_id, &chunk.id),
                    "vector": vector,
                    "payload": {
                        "tenant_id": tenant_id,
                        "material_id": chunk.material_id,
                        "chunk_id": chunk.id,
                        "sequence_index": chunk.sequence_index,
                        "text": chunk.text,
                        "locators": chunk.locators,
                    },
                }))
            })
            .collect::<Result<Vec<_>, IndexError>>()?;

        if points.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .put(format!(
                "{}/collections/{}/points?wait=true",
                self.endpoint, self.collection
            ))
            .timeout(self.timeout)
            .json(&json!({ "points": points }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(IndexError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        Ok(())
    }

    async fn search_vector(
        &self,
        tenant_id: &str,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<IndexHit>, IndexError> {
        Self::guard_tenant(tenant_id)?;

        if query_vector.len() != self.vector_size {
            return Err(IndexError::DimensionMismatch {
                expected: self.vector_size,
                actual: query_vector.len(),
            });
        }

        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points/search",
                self.endpoint, self.collection
            ))
            .timeout(self.timeout)
            .json(&json!({
                "vector": query_vector,
                "limit": limit,
                "filter": Self::tenant_filter(tenant_id),
                "with_payload": true,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(IndexError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        let parsed: Value = response.json().await?;
        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut result = Vec::new();
        for hit in hits {
            let locators: Vec<SourceLocator> = hit
                .pointer("/payload/locators")
                .cloned()
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default();

            result.push(IndexHit {
                chunk_id: hit
                    .pointer("/payload/chunk_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                material_id: hit
                    .pointer("/payload/material_id")
                    .and_then(Value::as_str)
                    .and_then(|id| Uuid::parse_str(id).ok())
                    .unwrap_or(Uuid::nil()),
                sequence_index: hit
                    .pointer("/payload/sequence_index")
                    .and_then(Value::as_u64)
                    .unwrap_or_default(),
                score: hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0),
                text: hit
                    .pointer("/payload/text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                locators,
            });
        }

        Ok(result)
    }

    async fn delete_material(&self, tenant_id: &str, material_id: Uuid) -> Result<(), IndexError> {
        Self::guard_tenant(tenant_id)?;

        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points/delete?wait=true",
                self.endpoint, self.collection
            ))
            .timeout(self.timeout)
            .json(&json!({
                "filter": {
                    "must": [
                        {"key": "tenant_id", "match": {"value": tenant_id}},
                        {"key": "material_id", "match": {"value": material_id.to_string()}}
                    ]
                }
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(IndexError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ids_are_deterministic_and_tenant_scoped() {
        let a = QdrantStore::point_id("tenant-a", "chunk-1");
        let b = QdrantStore::point_id("tenant-a", "chunk-1");
        let c = QdrantStore::point_id("tenant-b", "chunk-1");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn stalled_backend_times_out_as_transient() {
        // Accepts the connection, then never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(socket);
        });

        let store = QdrantStore::new(format!("http://{addr}"), "chunks", 4)
            .with_timeout(Duration::from_millis(100));
        let error = store
            .search_vector("tenant-a", &[0.0; 4], 5)
            .await
            .unwrap_err();
        assert!(
            matches!(&error, IndexError::Http(e) if e.is_timeout()),
            "got: {error}"
        );
        assert!(error.is_transient());
        server.abort();
    }
}
