use crate::error::IndexError;
use crate::models::{Chunk, IndexHit, SourceLocator};
use crate::traits::{KeywordIndex, VectorIndex};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Entry {
    chunk_id: String,
    material_id: Uuid,
    sequence_index: u64,
    text: String,
    locators: Vec<SourceLocator>,
    vector: Option<Vec<f32>>,
}

#[derive(Default)]
struct TenantSegment {
    entries: HashMap<String, Entry>,
}

#[derive(Default)]
pub struct MemoryIndex {
    segments: RwLock<HashMap<String, TenantSegment>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard_tenant(tenant_id: &str) -> Result<(), IndexError> {
        if tenant_id.trim().is_empty() {
            return Err(IndexError::IsolationViolation);
        }
        Ok(())
    }

    fn upsert<F>(&self, tenant_id: &str, chunks: &[Chunk], mut apply: F) -> Result<(), IndexError>
    where
        F: FnMut(&mut Entry, usize),
    {
        Self::guard_tenant(tenant_id)?;
        let mut segments = self
            .segments
            .write()
            .map_err(|_| IndexError::Request("memory index poisoned".to_string()))?;
        let segment = segments.entry(tenant_id.to_string()).or_default();

        for (position, chunk) in chunks.iter().enumerate() {
            let entry = segment
                .entries
                .entry(chunk.id.clone())
                .or_insert_with(|| Entry {
                    chunk_id: chunk.id.clone(),
                    material_id: chunk.material_id,
                    sequence_index: chunk.sequence_index,
                    text: chunk.text.clone(),
                    locators: chunk.locators.clone(),
                    vector: None,
                });
            entry.text = chunk.text.clone();
            entry.sequence_index = chunk.sequence_index;
            entry.locators = chunk.locators.clone();
            apply(entry, position);
        }
        Ok(())
    }
}

fn terms_of(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|token| {
            token
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|token| token.len() > 2)
        .collect()
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        (dot / (mag_a * mag_b)) as f64
    }
}

fn into_hit(entry: &Entry, score: f64) -> IndexHit {
    IndexHit {
        chunk_id: entry.chunk_id.clone(),
        material_id: entry.material_id,
        sequence_index: entry.sequence_index,
        score,
        text: entry.text.clone(),
        locators: entry.locators.clone(),
    }
}

#[async_trait]
impl KeywordIndex for MemoryIndex {
    async fn upsert_chunks(&self, tenant_id: &str, chunks: &[Chunk]) -> Result<(), IndexError> {
        self.upsert(tenant_id, chunks, |_, _| {})
    }

    async fn search_keyword(
        &self,
        tenant_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<IndexHit>, IndexError> {
        Self::guard_tenant(tenant_id)?;
        let query_terms = terms_of(query);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let segments = self
            .segments
            .read()
            .map_err(|_| IndexError::Request("memory index poisoned".to_string()))?;
        let Some(segment) = segments.get(tenant_id) else {
            return Ok(Vec::new());
        };

        let corpus_size = segment.entries.len().max(1) as f64;
        let mut document_frequency: HashMap<&str, usize> = HashMap::new();
        for term in &query_terms {
            let df = segment
                .entries
                .values()
                .filter(|entry| terms_of(&entry.text).iter().any(|t| t == term))
                .count();
            document_frequency.insert(term.as_str(), df);
        }

        let mut hits: Vec<IndexHit> = segment
            .entries
            .values()
            .filter_map(|entry| {
                let doc_terms = terms_of(&entry.text);
                if doc_terms.is_empty() {
                    return None;
                }
                let mut score = 0.0f64;
                for term in &query_terms {
                    let tf = doc_terms.iter().filter(|t| *t == term).count() as f64
                        / doc_terms.len() as f64;
                    if tf == 0.0 {
                        continue;
                    }
                    let df = document_frequency.get(term.as_str()).copied().unwrap_or(0);
                    let idf = (corpus_size / (1.0 + df as f64)).ln() + 1.0;
                    score += tf * idf;
                }
                if score > 0.0 {
                    Some(into_hit(entry, score))
                } else {
                    None
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.sequence_index.cmp(&b.sequence_index))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete_material(&self, tenant_id: &str, material_id: Uuid) -> Result<(), IndexError> {
        Self::guard_tenant(tenant_id)?;
        let mut segments = self
            .segments
            .write()
            .map_err(|_| IndexError::Request("memory index poisoned".to_string()))?;
        if let Some(segment) = segments.get_mut(tenant_id) {
            segment
                .entries
                .retain(|_, entry| entry.material_id != material_id);
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn upsert_vectors(
        &self,
        tenant_id: &str,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
    ) -> Result<(), IndexError> {
        if chunks.len() != vectors.len() {
            return Err(IndexError::Request(format!(
                "vector count {} does not match chunk count {}",
                vectors.len(),
                chunks.len()
            )));
        }
        self.upsert(tenant_id, chunks, |entry, position| {
            entry.vector = Some(vectors[position].clone());
        })
    }

    async fn search_vector(
        &self,
        tenant_id: &str,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<IndexHit>, IndexError> {
        Self::guard_tenant(tenant_id)?;
        let segments = self
            .segments
            .read()
            .map_err(|_| IndexError::Request("memory index poisoned".to_string()))?;
        let Some(segment) = segments.get(tenant_id) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<IndexHit> = segment
            .entries
            .values()
            .filter_map(|entry| {
                entry
                    .vector
                    .as_ref()
                    .map(|vector| into_hit(entry, cosine(query_vector, vector)))
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.sequence_index.cmp(&b.sequence_index))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete_material(&self, tenant_id: &str, material_id: Uuid) -> Result<(), IndexError> {
        KeywordIndex::delete_material(self, tenant_id, material_id).await
    }
}
