use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Pdf,
    Docx,
    Xlsx,
    Csv,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Pdf => "pdf",
            Format::Docx => "docx",
            Format::Xlsx => "xlsx",
            Format::Csv => "csv",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pdf" => Ok(Format::Pdf),
            "docx" | "doc" => Ok(Format::Docx),
            "xlsx" | "xls" => Ok(Format::Xlsx),
            "csv" => Ok(Format::Csv),
            other => Err(format!("unknown format: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceLocator {
    Page { number: u32 },
    Sheet { name: String, row: u32 },
    Row { number: u32 },
    Section { ordinal: u32 },
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocator::Page { number } => write!(f, "page {number}"),
            SourceLocator::Sheet { name, row } => write!(f, "sheet {name} row {row}"),
            SourceLocator::Row { number } => write!(f, "row {number}"),
            SourceLocator::Section { ordinal } => write!(f, "section {ordinal}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MaterialStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaterialMetadata {
    pub doc_type: String,
    pub topics: Vec<String>,
    pub summary: String,
}

impl MaterialMetadata {
    pub fn degraded() -> Self {
        Self {
            doc_type: "unknown".to_string(),
            topics: Vec::new(),
            summary: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Material {
    pub id: Uuid,
    pub tenant_id: String,
    pub title: String,
    pub original_filename: String,
    pub blob_uri: String,
    pub format: Format,
    pub size_bytes: u64,
    pub checksum: String,
    pub status: MaterialStatus,
    pub progress_pct: u8,
    pub error_message: Option<String>,
    pub warning: Option<String>,
    pub chunk_count: usize,
    pub metadata: Option<MaterialMetadata>,
    pub indexed: bool,
    pub created_at: DateTime<Utc>,
}

impl Material {
    pub fn new(
        tenant_id: impl Into<String>,
        title: impl Into<String>,
        original_filename: impl Into<String>,
        blob_uri: impl Into<String>,
        format: Format,
        size_bytes: u64,
        checksum: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            title: title.into(),
            original_filename: original_filename.into(),
            blob_uri: blob_uri.into(),
            format,
            size_bytes,
            checksum: checksum.into(),
            status: MaterialStatus::Pending,
            progress_pct: 0,
            error_message: None,
            warning: None,
            chunk_count: 0,
            metadata: None,
            indexed: false,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub material_id: Uuid,
    /// Denormalized from the material so isolation checks never need a join.
    pub tenant_id: String,
    pub sequence_index: u64,
    pub text: String,
    pub token_count: usize,
    pub locators: Vec<SourceLocator>,
    /// Set when a unit larger than the target size had to be cut at a token
    /// boundary with no semantic break.
    pub hard_split: bool,
    pub embedding_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extract,
    Metadata,
    Chunk,
    Embed,
    Index,
}

impl Stage {
    pub const COUNT: usize = 5;

    pub fn index(&self) -> usize {
        match self {
            Stage::Extract => 0,
            Stage::Metadata => 1,
            Stage::Chunk => 2,
            Stage::Embed => 3,
            Stage::Index => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Metadata => "metadata",
            Stage::Chunk => "chunk",
            Stage::Embed => "embed",
            Stage::Index => "index",
        }
    }

    pub fn base_progress(&self) -> u8 {
        (self.index() * 100 / Self::COUNT) as u8
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

/// Orchestration record for one ingestion run. At most one non-terminal job
/// exists per material; terminal states are immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub id: Uuid,
    pub material_id: Uuid,
    pub tenant_id: String,
    pub state: JobState,
    pub current_stage: Option<Stage>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ProcessingJob {
    pub fn new(material_id: Uuid, tenant_id: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            material_id,
            tenant_id: tenant_id.into(),
            state: JobState::Queued,
            current_stage: None,
            attempt: 0,
            max_attempts,
            last_error: None,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: MaterialStatus,
    pub progress_pct: u8,
    pub current_step: Option<String>,
    pub error: Option<String>,
    pub warning: Option<String>,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexHit {
    pub chunk_id: String,
    pub material_id: Uuid,
    pub sequence_index: u64,
    pub score: f64,
    pub text: String,
    pub locators: Vec<SourceLocator>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub material_id: Uuid,
    pub sequence_index: u64,
    pub text: String,
    pub locators: Vec<SourceLocator>,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub target_tokens: usize,
    pub overlap_tokens: usize,
    pub embedding_batch_size: usize,
    pub max_in_flight_batches: usize,
    pub embedding_dimensions: usize,
    pub vector_weight: f64,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub metadata_token_budget: usize,
    pub capability_deadline: Duration,
    pub workers: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            target_tokens: 1_000,
            overlap_tokens: 50,
            embedding_batch_size: 100,
            max_in_flight_batches: 4,
            embedding_dimensions: 768,
            vector_weight: 0.7,
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
            metadata_token_budget: 6_000,
            capability_deadline: Duration::from_secs(30),
            workers: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parses_from_common_extensions() {
        assert_eq!("PDF".parse::<Format>().unwrap(), Format::Pdf);
        assert_eq!("doc".parse::<Format>().unwrap(), Format::Docx);
        assert_eq!("xls".parse::<Format>().unwrap(), Format::Xlsx);
        assert!("md".parse::<Format>().is_err());
    }

    #[test]
    fn stage_progress_steps_by_twenty() {
        assert_eq!(Stage::Extract.base_progress(), 0);
        assert_eq!(Stage::Metadata.base_progress(), 20);
        assert_eq!(Stage::Embed.base_progress(), 60);
        assert_eq!(Stage::Index.base_progress(), 80);
    }

    #[test]
    fn terminal_states_are_recognized() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }
}
