use crate::embeddings::LlmCapability;
use crate::error::IndexError;
use crate::models::{Chunk, IndexHit, ScoredChunk};
use crate::traits::{KeywordIndex, VectorIndex};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Candidate pool multiplier: fetch more than `top_k` from each side so
/// fusion has something to work with.
const CANDIDATE_FACTOR: usize = 4;

pub struct IndexManager {
    keyword: Arc<dyn KeywordIndex>,
    vector: Arc<dyn VectorIndex>,
    llm: Arc<dyn LlmCapability>,
}

impl IndexManager {
    pub fn new(
        keyword: Arc<dyn KeywordIndex>,
        vector: Arc<dyn VectorIndex>,
        llm: Arc<dyn LlmCapability>,
    ) -> Self {
        Self {
            keyword,
            vector,
            llm,
        }
    }

    /// Security invariant, not an optimization: every operation must carry a
    /// tenant scope. Violations are logged and never retried.
    fn guard_tenant(tenant_id: &str) -> Result<(), IndexError> {
        if tenant_id.trim().is_empty() {
            error!("index operation attempted without tenant scope");
            return Err(IndexError::IsolationViolation);
        }
        Ok(())
    }

    fn doc_id(tenant_id: &str, chunk_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(tenant_id.as_bytes());
        hasher.update(b":");
        hasher.update(chunk_id.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Idempotent on `(tenant_id, chunk_id)`; chunks without a vector are
    /// skipped. Returns the number of chunks indexed.
    pub async fn index(
        &self,
        tenant_id: &str,
        chunks: &mut [Chunk],
        vectors: &[Option<Vec<f32>>],
    ) -> Result<usize, IndexError> {
        Self::guard_tenant(tenant_id)?;

        let dimensions = self.llm.embedding_dimensions();
        let mut indexed_chunks = Vec::new();
        let mut indexed_vectors = Vec::new();
        let mut indexed_positions = Vec::new();

        for (position, (chunk, vector)) in chunks.iter().zip(vectors.iter()).enumerate() {
            let Some(vector) = vector else { continue };
            if vector.len() != dimensions {
                return Err(IndexError::DimensionMismatch {
                    expected: dimensions,
                    actual: vector.len(),
                });
            }
            indexed_chunks.push(chunk.clone());
            indexed_vectors.push(vector.clone());
            indexed_positions.push(position);
        }

        if indexed_chunks.is_empty() {
            return Ok(0);
        }

        tokio::try_join!(
            self.keyword.upsert_chunks(tenant_id, &indexed_chunks),
            self.vector
                .upsert_vectors(tenant_id, &indexed_chunks, &indexed_vectors),
        )?;

        for position in &indexed_positions {
            let chunk = &mut chunks[*position];
            chunk.embedding_ref = Some(Self::doc_id(tenant_id, &chunk.id));
        }

        debug!(
            tenant = tenant_id,
            indexed = indexed_positions.len(),
            "chunks indexed"
        );
        Ok(indexed_positions.len())
    }

    pub async fn delete_material(
        &self,
        tenant_id: &str,
        material_id: Uuid,
    ) -> Result<(), IndexError> {
        Self::guard_tenant(tenant_id)?;
        tokio::try_join!(
            self.keyword.delete_material(tenant_id, material_id),
            self.vector.delete_material(tenant_id, material_id),
        )?;
        Ok(())
    }

    /// Scores are min-max normalized per side, combined as
    /// `vector_weight * vec + (1 - vector_weight) * kw`, with ties broken
    /// by `sequence_index` ascending.
    pub async fn hybrid_search(
        &self,
        tenant_id: &str,
        query_text: &str,
        top_k: usize,
        vector_weight: f64,
    ) -> Result<Vec<ScoredChunk>, IndexError> {
        Self::guard_tenant(tenant_id)?;

        if query_text.trim().is_empty() {
            return Err(IndexError::Request("query is empty".to_string()));
        }

        let query_vector = self
            .llm
            .embed(std::slice::from_ref(&query_text.to_string()))
            .await
            .map_err(|error| IndexError::QueryEmbedding(error.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| IndexError::QueryEmbedding("no vector returned".to_string()))?;

        let pool = top_k.max(1) * CANDIDATE_FACTOR;
        let (mut keyword_hits, mut vector_hits) = tokio::try_join!(
            self.keyword.search_keyword(tenant_id, query_text, pool),
            self.vector.search_vector(tenant_id, &query_vector, pool),
        )?;

        normalize_scores(&mut keyword_hits);
        normalize_scores(&mut vector_hits);

        let weight = vector_weight.clamp(0.0, 1.0);
        let mut fused: HashMap<String, Fused> = HashMap::new();
        for hit in vector_hits {
            let entry = fused.entry(hit.chunk_id.clone()).or_insert_with(|| Fused {
                hit: hit.clone(),
                vector_score: 0.0,
                keyword_score: 0.0,
            });
            entry.vector_score = hit.score;
        }
        for hit in keyword_hits {
            let entry = fused.entry(hit.chunk_id.clone()).or_insert_with(|| Fused {
                hit: hit.clone(),
                vector_score: 0.0,
                keyword_score: 0.0,
            });
            entry.keyword_score = hit.score;
        }

        let mut results: Vec<ScoredChunk> = fused
            .into_values()
            .map(|fused| {
                let score =
                    weight * fused.vector_score + (1.0 - weight) * fused.keyword_score;
                ScoredChunk {
                    chunk_id: fused.hit.chunk_id,
                    material_id: fused.hit.material_id,
                    sequence_index: fused.hit.sequence_index,
                    text: fused.hit.text,
                    locators: fused.hit.locators,
                    score,
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.sequence_index.cmp(&b.sequence_index))
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        results.truncate(top_k);
        Ok(results)
    }
}

struct Fused {
    hit: IndexHit,
    vector_score: f64,
    keyword_score: f64,
}

/// Min-max normalization within the candidate set. A degenerate set (all
/// scores equal) normalizes to 1.0 so a lone candidate is not zeroed out.
fn normalize_scores(hits: &mut [IndexHit]) {
    let Some(first) = hits.first() else { return };
    let mut min = first.score;
    let mut max = first.score;
    for hit in hits.iter() {
        min = min.min(hit.score);
        max = max.max(hit.score);
    }
    let range = max - min;
    for hit in hits.iter_mut() {
        hit.score = if range < f64::EPSILON {
            1.0
        } else {
            (hit.score - min) / range
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::NgramEmbedder;
    use crate::models::{PipelineOptions, SourceLocator};
    use crate::stores::MemoryIndex;
    use chrono::Utc;

    fn chunk(tenant: &str, material: Uuid, sequence: u64, text: &str) -> Chunk {
        Chunk {
            id: format!("{material}-{sequence}"),
            material_id: material,
            tenant_id: tenant.to_string(),
            sequence_index: sequence,
            text: text.to_string(),
            token_count: crate::chunking::approx_token_count(text),
            locators: vec![SourceLocator::Page {
                number: sequence as u32 + 1,
            }],
            hard_split: false,
            embedding_ref: None,
            created_at: Utc::now(),
        }
    }

    async fn manager_with_dims(dimensions: usize) -> (IndexManager, Arc<NgramEmbedder>) {
        let store = Arc::new(MemoryIndex::new());
        let llm = Arc::new(NgramEmbedder::new(dimensions));
        (
            IndexManager::new(store.clone(), store, llm.clone()),
            llm,
        )
    }

    async fn index_texts(
        manager: &IndexManager,
        llm: &NgramEmbedder,
        tenant: &str,
        material: Uuid,
        texts: &[&str],
    ) -> Vec<Chunk> {
        let mut chunks: Vec<Chunk> = texts
            .iter()
            .enumerate()
            .map(|(i, text)| chunk(tenant, material, i as u64, text))
            .collect();
        let vectors: Vec<Option<Vec<f32>>> = texts
            .iter()
            .map(|text| Some(llm.embed_one(text)))
            .collect();
        manager.index(tenant, &mut chunks, &vectors).await.unwrap();
        chunks
    }

    #[tokio::test]
    async fn round_trip_indexing_ranks_exact_text_first() {
        let (manager, llm) = manager_with_dims(128).await;
        let material = Uuid::new_v4();
        index_texts(
            &manager,
            &llm,
            "tenant-a",
            material,
            &[
                "the hydraulic pump requires monthly inspection",
                "office seating arrangements for the third floor",
                "catering invoices are due at month end",
            ],
        )
        .await;

        let options = PipelineOptions::default();
        let hits = manager
            .hybrid_search(
                "tenant-a",
                "the hydraulic pump requires monthly inspection",
                3,
                options.vector_weight,
            )
            .await
            .unwrap();

        assert_eq!(hits[0].sequence_index, 0);
        assert!(hits[0].score >= 0.99, "top hit score was {}", hits[0].score);
    }

    #[tokio::test]
    async fn search_never_returns_another_tenants_chunks() {
        let (manager, llm) = manager_with_dims(64).await;
        let material_a = Uuid::new_v4();
        let material_b = Uuid::new_v4();
        index_texts(&manager, &llm, "tenant-a", material_a, &["shared secret topic"]).await;
        index_texts(&manager, &llm, "tenant-b", material_b, &["shared secret topic"]).await;

        let hits = manager
            .hybrid_search("tenant-a", "shared secret topic", 10, 0.7)
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|hit| hit.material_id == material_a));
    }

    #[tokio::test]
    async fn missing_tenant_scope_is_an_isolation_violation() {
        let (manager, _) = manager_with_dims(64).await;
        let error = manager
            .hybrid_search("", "anything", 5, 0.7)
            .await
            .unwrap_err();
        assert!(matches!(error, IndexError::IsolationViolation));

        let error = manager
            .delete_material("   ", Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(error, IndexError::IsolationViolation));
    }

    #[tokio::test]
    async fn indexing_populates_embedding_refs() {
        let (manager, llm) = manager_with_dims(64).await;
        let material = Uuid::new_v4();
        let chunks = index_texts(&manager, &llm, "tenant-a", material, &["alpha", "beta"]).await;
        assert!(chunks.iter().all(|c| c.embedding_ref.is_some()));
        assert_ne!(chunks[0].embedding_ref, chunks[1].embedding_ref);
    }

    #[tokio::test]
    async fn chunks_without_vectors_are_skipped() {
        let (manager, llm) = manager_with_dims(64).await;
        let material = Uuid::new_v4();
        let mut chunks = vec![
            chunk("tenant-a", material, 0, "embedded fine"),
            chunk("tenant-a", material, 1, "embedding failed"),
        ];
        let vectors = vec![Some(llm.embed_one("embedded fine")), None];
        let indexed = manager
            .index("tenant-a", &mut chunks, &vectors)
            .await
            .unwrap();
        assert_eq!(indexed, 1);
        assert!(chunks[0].embedding_ref.is_some());
        assert!(chunks[1].embedding_ref.is_none());
    }

    #[tokio::test]
    async fn delete_material_empties_retrieval() {
        let (manager, llm) = manager_with_dims(64).await;
        let material = Uuid::new_v4();
        index_texts(&manager, &llm, "tenant-a", material, &["temporary content"]).await;

        manager.delete_material("tenant-a", material).await.unwrap();
        let hits = manager
            .hybrid_search("tenant-a", "temporary content", 10, 0.7)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn degenerate_score_sets_normalize_to_one() {
        let mut hits = vec![IndexHit {
            chunk_id: "c".to_string(),
            material_id: Uuid::nil(),
            sequence_index: 0,
            score: 0.42,
            text: String::new(),
            locators: Vec::new(),
        }];
        normalize_scores(&mut hits);
        assert_eq!(hits[0].score, 1.0);
    }
}
