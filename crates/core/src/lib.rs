pub mod batching;
pub mod blob;
pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod index;
pub mod metadata;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod stores;
pub mod traits;

pub use batching::{embed_chunks, ChunkFailure, EmbeddingReport};
pub use blob::{sha256_hex, BlobStore, FsBlobStore, MemoryBlobStore};
pub use chunking::{approx_token_count, build_chunks};
pub use embeddings::{HttpLlm, LlmCapability, NgramEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{CapabilityError, ExtractionError, IndexError, PipelineError};
pub use extractor::{extract_units, TextUnit};
pub use index::IndexManager;
pub use metadata::extract_metadata;
pub use models::{
    Chunk, Format, IndexHit, JobState, Material, MaterialMetadata, MaterialStatus,
    PipelineOptions, ProcessingJob, ScoredChunk, SourceLocator, Stage, StatusReport,
};
pub use orchestrator::{PipelineOrchestrator, StagedMaterial};
pub use registry::{InMemoryRegistry, MaterialRegistry};
pub use retry::{with_retry, RetryPolicy, Retryable};
pub use stores::{MemoryIndex, OpenSearchStore, QdrantStore};
pub use traits::{KeywordIndex, VectorIndex};
