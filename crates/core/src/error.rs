use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Failure modes of the text extraction stage. Both variants are fatal for
/// the owning job; a parseable document with no text is not an error.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("document is corrupt: {0}")]
    Corrupt(String),

    #[error("document content is unsupported: {0}")]
    Unsupported(String),
}

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("capability call timed out after {0:?}")]
    Timeout(Duration),

    #[error("capability rate limited: {0}")]
    RateLimited(String),

    #[error("malformed capability response: {0}")]
    Malformed(String),

    #[error("capability not supported by this backend: {0}")]
    Unsupported(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl CapabilityError {
    /// Timeouts, throttling, and transport errors are worth another attempt;
    /// a malformed or unsupported response never improves on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            CapabilityError::Timeout(_) | CapabilityError::RateLimited(_) => true,
            CapabilityError::Http(error) => !error.is_builder(),
            CapabilityError::Malformed(_) | CapabilityError::Unsupported(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    /// A call reached the index layer without a tenant scope. Security
    /// invariant, never retried.
    #[error("index operation is missing a tenant scope")]
    IsolationViolation,

    #[error("embedding dimension {actual} does not match configured {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("query embedding failed: {0}")]
    QueryEmbedding(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("index request failed: {0}")]
    Request(String),
}

impl IndexError {
    pub fn is_transient(&self) -> bool {
        match self {
            IndexError::IsolationViolation
            | IndexError::DimensionMismatch { .. }
            | IndexError::Serialization(_)
            | IndexError::QueryEmbedding(_) => false,
            IndexError::BackendResponse { .. } | IndexError::Request(_) => true,
            IndexError::Http(error) => !error.is_builder(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("capability call failed: {0}")]
    Capability(#[from] CapabilityError),

    #[error("index operation failed: {0}")]
    Index(#[from] IndexError),

    #[error("every embedding batch failed: {0}")]
    EmbeddingFailed(String),

    #[error("material not found: {0}")]
    UnknownMaterial(Uuid),

    #[error("material {material_id} already has active job {job_id}")]
    AlreadyProcessing { material_id: Uuid, job_id: Uuid },

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("invalid blob uri: {0}")]
    InvalidUri(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("job cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether the job orchestrator may retry the failed stage in place.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Capability(error) => error.is_transient(),
            PipelineError::Index(error) => error.is_transient(),
            // Remote blob reads fail transiently; treat io as retryable.
            PipelineError::Io(_) => true,
            _ => false,
        }
    }

    /// Human-readable message for status queries. Internal taxonomy and
    /// transport details stay out of user-visible state.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::Extraction(ExtractionError::Corrupt(_)) => {
                "The document could not be read. It may be corrupt or password protected.".to_string()
            }
            PipelineError::Extraction(ExtractionError::Unsupported(_)) => {
                "The document format is not supported.".to_string()
            }
            PipelineError::Capability(_) | PipelineError::EmbeddingFailed(_) => {
                "Processing failed while contacting the model service. Please try again later.".to_string()
            }
            PipelineError::Index(IndexError::DimensionMismatch { .. }) => {
                "Processing failed due to a configuration problem. Contact support.".to_string()
            }
            PipelineError::Index(_) => {
                "The search index could not be updated. Please try again later.".to_string()
            }
            PipelineError::Cancelled => "Processing was cancelled.".to_string(),
            _ => "Processing failed unexpectedly.".to_string(),
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
