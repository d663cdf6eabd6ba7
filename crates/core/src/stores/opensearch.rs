use crate::error::IndexError;
use crate::models::{Chunk, IndexHit, SourceLocator};
use crate::traits::KeywordIndex;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct OpenSearchStore {
    client: Arc<Client>,
    endpoint: String,
    index_name: String,
    timeout: Duration,
}

impl OpenSearchStore {
    pub fn new(endpoint: impl Into<String>, index_name: impl Into<String>) -> Self {
        Self {
            client: Arc::new(Client::new()),
            endpoint: endpoint.into(),
            index_name: index_name.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn ensure_index(&self) -> Result<(), IndexError> {
        let response = self
            .client
            .head(format!("{}/{}", self.endpoint, self.index_name))
            .timeout(self.timeout)
            .send()
            .await?;

        if response.status() == StatusCode::OK {
            return Ok(());
        }

        if !response.status().is_client_error() {
            return Err(IndexError::BackendResponse {
                backend: "opensearch".to_string(),
                details: response.status().to_string(),
            });
        }

        let response = self
            .client
            .put(format!("{}/{}", self.endpoint, self.index_name))
            .timeout(self.timeout)
            .json(&json!({
                "settings": {
                    "number_of_shards": 1,
                    "number_of_replicas": 0
                },
                "mappings": {
                    "properties": {
                        "tenant_id": {"type": "keyword"},
                        "material_id": {"type": "keyword"},
                        "chunk_id": {"type": "keyword"},
                        "sequence_index": {"type": "long"},
                        "text": {"type": "text"},
                        "token_count": {"type": "integer"},
                        "locators": {"type": "object", "enabled": false}
                    }
                }
            }))
            .send()
            .await?;

        if response.status().is_server_error() || response.status().is_client_error() {
            return Err(IndexError::Request(format!(
                "opensearch index setup failed with {}",
                response.status()
            )));
        }

        Ok(())
    }

    fn guard_tenant(tenant_id: &str) -> Result<(), IndexError> {
        if tenant_id.trim().is_empty() {
            return Err(IndexError::IsolationViolation);
        }
        Ok(())
    }
}

#[async_trait]
impl KeywordIndex for OpenSearchStore {
    async fn upsert_chunks(&self, tenant_id: &str, chunks: &[Chunk]) -> Result<(), IndexError> {
        Self::guard_tenant(tenant_id)?;

        let mut operations = Vec::new();
        for chunk in chunks {
            operations.push(json!({
                "index": {
                    "_index": self.index_name,
                    "_id": format!("{tenant_id}:{}", chunk.id),
                }
            }));
            operations.push(json!({
                "tenant_id": tenant_id,
                "material_id": chunk.material_id,
                "chunk_id": chunk.id,
                "sequence_index": chunk.sequence_index,
                "text": chunk.text,
                "token_count": chunk.token_count,
                "locators": chunk.locators,
            }));
        }

        if operations.is_empty() {
            return Ok(());
        }

        let body = operations
            .iter()
            .map(|op| op.to_string())
            .collect::<Vec<_>>()
            .join("\n")
            + "\n";

        let response = self
            .client
            .post(format!("{}/_bulk", self.endpoint))
            .timeout(self.timeout)
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(IndexError::BackendResponse {
                backend: "opensearch".to_string(),
                details: response.status().to_string(),
            });
        }

        let parsed: Value = response.json().await?;
        if parsed.pointer("/errors").and_then(Value::as_bool) == Some(true) {
            return Err(IndexError::BackendResponse {
                backend: "opensearch".to_string(),
                details: "bulk upsert reported item errors".to_string(),
            });
        }

        Ok(())
    }

    async fn search_keyword(
        &self,
        tenant_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<IndexHit>, IndexError> {
        Self::guard_tenant(tenant_id)?;

        let response = self
            .client
            .post(format!("{}/{}/_search", self.endpoint, self.index_name))
            .timeout(self.timeout)
            .json(&json!({
                "size": limit,
                "query": {
                    "bool": {
                        "must": [{"match": {"text": query}}],
                        "filter": [{"term": {"tenant_id": tenant_id}}]
                    }
                }
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(IndexError::BackendResponse {
                backend: "opensearch".to_string(),
                details: response.status().to_string(),
            });
        }

        let parsed: Value = response.json().await?;
        let hits = parsed
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut result = Vec::new();
        for hit in hits {
            let source = hit.pointer("/_source").cloned().unwrap_or(Value::Null);
            let locators: Vec<SourceLocator> = source
                .pointer("/locators")
                .cloned()
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default();

            result.push(IndexHit {
                chunk_id: source
                    .pointer("/chunk_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                material_id: source
                    .pointer("/material_id")
                    .and_then(Value::as_str)
                    .and_then(|id| Uuid::parse_str(id).ok())
                    .unwrap_or(Uuid::nil()),
                sequence_index: source
                    .pointer("/sequence_index")
                    .and_then(Value::as_u64)
                    .unwrap_or_default(),
                score: hit.pointer("/_score").and_then(Value::as_f64).unwrap_or(0.0),
                text: source
                    .pointer("/text")
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
                "{}/{}/_delete_by_query",
                self.endpoint, self.index_name
            ))
            .timeout(self.timeout)
            .json(&json!({
                "query": {
                    "bool": {
                        "filter": [
                            {"term": {"tenant_id": tenant_id}},
                            {"term": {"material_id": material_id.to_string()}}
                        ]
                    }
                }
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(IndexError::BackendResponse {
                backend: "opensearch".to_string(),
                details: response.status().to_string(),
            });
        }

        Ok(())
    }
}
