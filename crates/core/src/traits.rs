use crate::error::IndexError;
use crate::models::{Chunk, IndexHit};
use async_trait::async_trait;
use uuid::Uuid;

/// Every method is tenant-scoped; implementations must not expose any
/// unfiltered path.
#[async_trait]
pub trait KeywordIndex: Send + Sync {
    async fn upsert_chunks(&self, tenant_id: &str, chunks: &[Chunk]) -> Result<(), IndexError>;

    async fn search_keyword(
        &self,
        tenant_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<IndexHit>, IndexError>;

    async fn delete_material(&self, tenant_id: &str, material_id: Uuid) -> Result<(), IndexError>;
}

/// Same tenancy rules as [`KeywordIndex`].
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert_vectors(
        &self,
        tenant_id: &str,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
    ) -> Result<(), IndexError>;

    async fn search_vector(
        &self,
        tenant_id: &str,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<IndexHit>, IndexError>;

    async fn delete_material(&self, tenant_id: &str, material_id: Uuid) -> Result<(), IndexError>;
}
