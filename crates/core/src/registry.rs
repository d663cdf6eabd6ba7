use crate::error::{PipelineError, Result};
use crate::models::{
    Chunk, JobState, Material, MaterialMetadata, MaterialStatus, ProcessingJob, Stage,
    StatusReport,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait MaterialRegistry: Send + Sync {
    async fn insert_material(&self, material: Material) -> Result<()>;
    async fn material(&self, material_id: Uuid) -> Result<Material>;
    /// Idempotency lookup: same tenant, same content bytes.
    async fn find_by_checksum(&self, tenant_id: &str, checksum: &str) -> Result<Option<Material>>;
    async fn set_material_status(
        &self,
        material_id: Uuid,
        status: MaterialStatus,
        progress_pct: u8,
    ) -> Result<()>;
    async fn set_material_progress(&self, material_id: Uuid, progress_pct: u8) -> Result<()>;
    async fn set_material_metadata(
        &self,
        material_id: Uuid,
        metadata: MaterialMetadata,
    ) -> Result<()>;
    async fn complete_material(
        &self,
        material_id: Uuid,
        chunk_count: usize,
        indexed: bool,
        warning: Option<String>,
    ) -> Result<()>;
    async fn fail_material(&self, material_id: Uuid, message: String) -> Result<()>;

    async fn replace_chunks(&self, material_id: Uuid, chunks: Vec<Chunk>) -> Result<()>;
    async fn chunks(&self, material_id: Uuid) -> Result<Vec<Chunk>>;
    async fn delete_chunks(&self, material_id: Uuid) -> Result<()>;

    async fn insert_job(&self, job: ProcessingJob) -> Result<()>;
    async fn job(&self, job_id: Uuid) -> Result<ProcessingJob>;
    async fn mark_job_running(&self, job_id: Uuid) -> Result<()>;
    async fn set_job_stage(&self, job_id: Uuid, stage: Stage) -> Result<()>;
    /// Moves a job into a terminal state. Terminal jobs are immutable, a
    /// second transition is rejected.
    async fn finish_job(
        &self,
        job_id: Uuid,
        state: JobState,
        last_error: Option<String>,
    ) -> Result<()>;
    /// The single non-terminal job of a material, if one exists.
    async fn active_job(&self, material_id: Uuid) -> Result<Option<ProcessingJob>>;

    async fn status(&self, material_id: Uuid) -> Result<StatusReport>;
}

#[derive(Default)]
pub struct InMemoryRegistry {
    materials: RwLock<HashMap<Uuid, Material>>,
    chunks: RwLock<HashMap<Uuid, Vec<Chunk>>>,
    jobs: RwLock<HashMap<Uuid, ProcessingJob>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_material<F>(&self, material_id: Uuid, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Material),
    {
        let mut materials = self
            .materials
            .write()
            .map_err(|_| PipelineError::Registry("lock poisoned".to_string()))?;
        let material = materials
            .get_mut(&material_id)
            .ok_or(PipelineError::UnknownMaterial(material_id))?;
        apply(material);
        Ok(())
    }

    fn with_job<F>(&self, job_id: Uuid, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ProcessingJob) -> Result<()>,
    {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| PipelineError::Registry("lock poisoned".to_string()))?;
        let job = jobs.get_mut(&job_id).ok_or_else(|| {
            PipelineError::InvalidTransition(format!("unknown job {job_id}"))
        })?;
        apply(job)
    }
}

#[async_trait]
impl MaterialRegistry for InMemoryRegistry {
    async fn insert_material(&self, material: Material) -> Result<()> {
        let mut materials = self
            .materials
            .write()
            .map_err(|_| PipelineError::Registry("lock poisoned".to_string()))?;
        materials.insert(material.id, material);
        Ok(())
    }

    async fn material(&self, material_id: Uuid) -> Result<Material> {
        let materials = self
            .materials
            .read()
            .map_err(|_| PipelineError::Registry("lock poisoned".to_string()))?;
        materials
            .get(&material_id)
            .cloned()
            .ok_or(PipelineError::UnknownMaterial(material_id))
    }

    async fn find_by_checksum(&self, tenant_id: &str, checksum: &str) -> Result<Option<Material>> {
        let materials = self
            .materials
            .read()
            .map_err(|_| PipelineError::Registry("lock poisoned".to_string()))?;
        Ok(materials
            .values()
            .find(|m| m.tenant_id == tenant_id && m.checksum == checksum)
            .cloned())
    }

    async fn set_material_status(
        &self,
        material_id: Uuid,
        status: MaterialStatus,
        progress_pct: u8,
    ) -> Result<()> {
        self.with_material(material_id, |material| {
            material.status = status;
            material.progress_pct = progress_pct;
        })
    }

    async fn set_material_progress(&self, material_id: Uuid, progress_pct: u8) -> Result<()> {
        self.with_material(material_id, |material| {
            material.progress_pct = progress_pct.min(100);
        })
    }

    async fn set_material_metadata(
        &self,
        material_id: Uuid,
        metadata: MaterialMetadata,
    ) -> Result<()> {
        self.with_material(material_id, |material| {
            material.metadata = Some(metadata);
        })
    }

    async fn complete_material(
        &self,
        material_id: Uuid,
        chunk_count: usize,
        indexed: bool,
        warning: Option<String>,
    ) -> Result<()> {
        self.with_material(material_id, |material| {
            material.status = MaterialStatus::Completed;
            material.progress_pct = 100;
            material.chunk_count = chunk_count;
            material.indexed = indexed;
            material.warning = warning;
            material.error_message = None;
        })
    }

    async fn fail_material(&self, material_id: Uuid, message: String) -> Result<()> {
        self.with_material(material_id, |material| {
            material.status = MaterialStatus::Failed;
            material.error_message = Some(message);
        })
    }

    async fn replace_chunks(&self, material_id: Uuid, chunks: Vec<Chunk>) -> Result<()> {
        let mut store = self
            .chunks
            .write()
            .map_err(|_| PipelineError::Registry("lock poisoned".to_string()))?;
        store.insert(material_id, chunks);
        Ok(())
    }

    async fn chunks(&self, material_id: Uuid) -> Result<Vec<Chunk>> {
        let store = self
            .chunks
            .read()
            .map_err(|_| PipelineError::Registry("lock poisoned".to_string()))?;
        Ok(store.get(&material_id).cloned().unwrap_or_default())
    }

    async fn delete_chunks(&self, material_id: Uuid) -> Result<()> {
        let mut store = self
            .chunks
            .write()
            .map_err(|_| PipelineError::Registry("lock poisoned".to_string()))?;
        store.remove(&material_id);
        Ok(())
    }

    async fn insert_job(&self, job: ProcessingJob) -> Result<()> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| PipelineError::Registry("lock poisoned".to_string()))?;
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn job(&self, job_id: Uuid) -> Result<ProcessingJob> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| PipelineError::Registry("lock poisoned".to_string()))?;
        jobs.get(&job_id)
            .cloned()
            .ok_or_else(|| PipelineError::InvalidTransition(format!("unknown job {job_id}")))
    }

    async fn mark_job_running(&self, job_id: Uuid) -> Result<()> {
        self.with_job(job_id, |job| {
            if job.state.is_terminal() {
                return Err(PipelineError::InvalidTransition(format!(
                    "job {job_id} is already {:?}",
                    job.state
                )));
            }
            job.state = JobState::Running;
            job.attempt += 1;
            job.started_at.get_or_insert_with(Utc::now);
            Ok(())
        })
    }

    async fn set_job_stage(&self, job_id: Uuid, stage: Stage) -> Result<()> {
        self.with_job(job_id, |job| {
            if job.state.is_terminal() {
                return Err(PipelineError::InvalidTransition(format!(
                    "job {job_id} is already {:?}",
                    job.state
                )));
            }
            job.current_stage = Some(stage);
            Ok(())
        })
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        state: JobState,
        last_error: Option<String>,
    ) -> Result<()> {
        if !state.is_terminal() {
            return Err(PipelineError::InvalidTransition(format!(
                "{state:?} is not a terminal state"
            )));
        }
        self.with_job(job_id, |job| {
            if job.state.is_terminal() {
                return Err(PipelineError::InvalidTransition(format!(
                    "job {job_id} is already {:?}",
                    job.state
                )));
            }
            job.state = state;
            job.last_error = last_error;
            job.finished_at = Some(Utc::now());
            Ok(())
        })
    }

    async fn active_job(&self, material_id: Uuid) -> Result<Option<ProcessingJob>> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| PipelineError::Registry("lock poisoned".to_string()))?;
        Ok(jobs
            .values()
            .find(|job| job.material_id == material_id && !job.state.is_terminal())
            .cloned())
    }

    async fn status(&self, material_id: Uuid) -> Result<StatusReport> {
        let material = self.material(material_id).await?;
        let current_step = self
            .active_job(material_id)
            .await?
            .and_then(|job| job.current_stage)
            .map(|stage| stage.as_str().to_string());
        Ok(StatusReport {
            status: material.status,
            progress_pct: material.progress_pct,
            current_step,
            error: material.error_message,
            warning: material.warning,
            chunk_count: material.chunk_count,
        })
    }
}
