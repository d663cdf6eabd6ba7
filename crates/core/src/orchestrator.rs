use crate::batching::embed_chunks;
use crate::blob::{sha256_hex, BlobStore};
use crate::chunking::build_chunks;
use crate::embeddings::LlmCapability;
use crate::error::{ExtractionError, PipelineError, Result};
use crate::extractor::extract_units;
use crate::index::IndexManager;
use crate::metadata::extract_metadata;
use crate::models::{
    Format, JobState, Material, MaterialStatus, PipelineOptions, ProcessingJob, ScoredChunk,
    Stage, StatusReport,
};
use crate::registry::MaterialRegistry;
use crate::retry::{with_retry, RetryPolicy};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct ActiveJob {
    job_id: Uuid,
    cancel: watch::Sender<bool>,
}

/// `duplicate` is set when the same bytes were already registered for
/// the tenant.
#[derive(Debug, Clone)]
pub struct StagedMaterial {
    pub material: Material,
    pub duplicate: bool,
}

pub struct PipelineOrchestrator {
    blob: Arc<dyn BlobStore>,
    registry: Arc<dyn MaterialRegistry>,
    index: Arc<IndexManager>,
    llm: Arc<dyn LlmCapability>,
    options: PipelineOptions,
    policy: RetryPolicy,
    queue: mpsc::UnboundedSender<Uuid>,
    active: Mutex<HashMap<Uuid, ActiveJob>>,
}

impl PipelineOrchestrator {
    pub fn new(
        blob: Arc<dyn BlobStore>,
        registry: Arc<dyn MaterialRegistry>,
        index: Arc<IndexManager>,
        llm: Arc<dyn LlmCapability>,
        options: PipelineOptions,
    ) -> Arc<Self> {
        let policy = RetryPolicy::new(
            options.max_attempts,
            options.backoff_base,
            options.backoff_cap,
        );
        let (queue, receiver) = mpsc::unbounded_channel::<Uuid>();
        let orchestrator = Arc::new(Self {
            blob,
            registry,
            index,
            llm,
            options,
            policy,
            queue,
            active: Mutex::new(HashMap::new()),
        });

        let receiver = Arc::new(Mutex::new(receiver));
        for worker in 0..orchestrator.options.workers.max(1) {
            let orchestrator = Arc::clone(&orchestrator);
            let receiver = Arc::clone(&receiver);
            tokio::spawn(async move {
                debug!(worker, "ingestion worker started");
                loop {
                    let job_id = { receiver.lock().await.recv().await };
                    let Some(job_id) = job_id else { break };
                    orchestrator.run_job(job_id).await;
                }
                debug!(worker, "ingestion worker stopped");
            });
        }

        orchestrator
    }

    /// Re-uploading identical bytes for the same tenant returns the
    /// existing material instead of creating a second one.
    pub async fn stage_material(
        &self,
        tenant_id: &str,
        title: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<StagedMaterial> {
        if tenant_id.trim().is_empty() {
            return Err(crate::error::IndexError::IsolationViolation.into());
        }
        let extension = filename.rsplit('.').next().unwrap_or_default();
        let format = Format::from_str(extension)
            .map_err(ExtractionError::Unsupported)
            .map_err(PipelineError::from)?;

        let checksum = sha256_hex(bytes);
        if let Some(existing) = self.registry.find_by_checksum(tenant_id, &checksum).await? {
            debug!(material = %existing.id, "duplicate upload, reusing material");
            return Ok(StagedMaterial {
                material: existing,
                duplicate: true,
            });
        }

        let mut material = Material::new(
            tenant_id,
            title,
            filename,
            String::new(),
            format,
            bytes.len() as u64,
            checksum,
        );
        material.blob_uri = format!("{tenant_id}/{}/{filename}", material.id);
        self.blob.put(&material.blob_uri, bytes).await?;
        self.registry.insert_material(material.clone()).await?;
        info!(material = %material.id, tenant = tenant_id, format = %format, "material staged");
        Ok(StagedMaterial {
            material,
            duplicate: false,
        })
    }

    /// Idempotent: when a queued or running job already exists its id is
    /// returned. The check and the insert share one lock acquisition so
    /// concurrent requests cannot both enqueue.
    pub async fn request_ingestion(&self, material_id: Uuid) -> Result<Uuid> {
        let material = self.registry.material(material_id).await?;
        let mut active = self.active.lock().await;
        if let Some(entry) = active.get(&material_id) {
            debug!(material = %material_id, job = %entry.job_id, "ingestion already in flight");
            return Ok(entry.job_id);
        }
        self.enqueue(&material, &mut active).await
    }

    /// Prior chunks and index entries are removed first; fails while a job
    /// is still active. The lock is held through cleanup and enqueue so no
    /// other request can slip a job in between.
    pub async fn reingest(&self, material_id: Uuid) -> Result<Uuid> {
        let material = self.registry.material(material_id).await?;
        let mut active = self.active.lock().await;
        if let Some(entry) = active.get(&material_id) {
            return Err(PipelineError::AlreadyProcessing {
                material_id,
                job_id: entry.job_id,
            });
        }

        self.index
            .delete_material(&material.tenant_id, material_id)
            .await?;
        self.registry.delete_chunks(material_id).await?;
        self.registry
            .set_material_status(material_id, MaterialStatus::Pending, 0)
            .await?;
        self.enqueue(&material, &mut active).await
    }

    async fn enqueue(
        &self,
        material: &Material,
        active: &mut HashMap<Uuid, ActiveJob>,
    ) -> Result<Uuid> {
        let job = ProcessingJob::new(material.id, &material.tenant_id, self.options.max_attempts);
        let job_id = job.id;
        self.registry.insert_job(job).await?;

        let (cancel, _) = watch::channel(false);
        active.insert(material.id, ActiveJob { job_id, cancel });

        self.queue
            .send(job_id)
            .map_err(|_| PipelineError::Registry("worker queue closed".to_string()))?;
        info!(material = %material.id, job = %job_id, "ingestion queued");
        Ok(job_id)
    }

    /// The flag is observed between stages and at embedding batch
    /// boundaries, so the job winds down shortly after rather than
    /// immediately.
    pub async fn cancel(&self, material_id: Uuid) -> Result<()> {
        let active = self.active.lock().await;
        let Some(entry) = active.get(&material_id) else {
            return Err(PipelineError::InvalidTransition(format!(
                "material {material_id} has no active job"
            )));
        };
        let _ = entry.cancel.send(true);
        info!(material = %material_id, job = %entry.job_id, "cancellation requested");
        Ok(())
    }

    pub async fn status(&self, material_id: Uuid) -> Result<StatusReport> {
        self.registry.status(material_id).await
    }

    pub async fn search(
        &self,
        tenant_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        Ok(self
            .index
            .hybrid_search(tenant_id, query, top_k, self.options.vector_weight)
            .await?)
    }

    async fn run_job(&self, job_id: Uuid) {
        let job = match self.registry.job(job_id).await {
            Ok(job) => job,
            Err(error) => {
                error!(job = %job_id, %error, "job lookup failed");
                return;
            }
        };
        let material_id = job.material_id;

        let cancel = {
            let active = self.active.lock().await;
            active
                .get(&material_id)
                .map(|entry| entry.cancel.subscribe())
                .unwrap_or_else(|| watch::channel(false).1)
        };

        let outcome = self.execute(&job, &cancel).await;
        match outcome {
            Ok(()) => {
                info!(job = %job_id, material = %material_id, "ingestion succeeded");
            }
            Err(PipelineError::Cancelled) => {
                info!(job = %job_id, material = %material_id, "ingestion cancelled");
                self.rollback(&job).await;
                if let Err(error) = self
                    .registry
                    .finish_job(job_id, JobState::Cancelled, None)
                    .await
                {
                    error!(job = %job_id, %error, "failed to record cancellation");
                }
                if let Err(error) = self
                    .registry
                    .set_material_status(material_id, MaterialStatus::Pending, 0)
                    .await
                {
                    error!(material = %material_id, %error, "failed to reset material");
                }
            }
            Err(error) => {
                warn!(job = %job_id, material = %material_id, %error, "ingestion failed");
                if let Err(record_error) = self
                    .registry
                    .finish_job(job_id, JobState::Failed, Some(error.to_string()))
                    .await
                {
                    error!(job = %job_id, %record_error, "failed to record job failure");
                }
                if let Err(record_error) = self
                    .registry
                    .fail_material(material_id, error.user_message())
                    .await
                {
                    error!(material = %material_id, %record_error, "failed to record material failure");
                }
            }
        }

        self.active.lock().await.remove(&material_id);
    }

    async fn execute(&self, job: &ProcessingJob, cancel: &watch::Receiver<bool>) -> Result<()> {
        ensure_live(cancel)?;
        let material = self.registry.material(job.material_id).await?;
        self.registry.mark_job_running(job.id).await?;
        self.registry
            .set_material_status(material.id, MaterialStatus::Processing, 0)
            .await?;

        // extract
        self.advance(job, &material, Stage::Extract).await?;
        let bytes = with_retry(&self.policy, "blob-fetch", || {
            self.blob.get(&material.blob_uri)
        })
        .await?;
        let units = extract_units(&bytes, material.format)?;
        ensure_live(cancel)?;

        // metadata
        self.advance(job, &material, Stage::Metadata).await?;
        if !units.is_empty() {
            let text: Vec<&str> = units.iter().map(|unit| unit.text.as_str()).collect();
            let metadata = extract_metadata(
                self.llm.as_ref(),
                &text.join("\n\n"),
                material.format,
                &self.policy,
                self.options.metadata_token_budget,
                self.options.capability_deadline,
            )
            .await;
            self.registry
                .set_material_metadata(material.id, metadata)
                .await?;
        }
        ensure_live(cancel)?;

        // chunk
        self.advance(job, &material, Stage::Chunk).await?;
        let mut chunks = build_chunks(material.id, &material.tenant_id, &units, &self.options);
        if chunks.is_empty() {
            // Parseable but empty documents succeed with nothing indexed.
            self.registry.replace_chunks(material.id, Vec::new()).await?;
            self.registry
                .complete_material(
                    material.id,
                    0,
                    false,
                    Some("The document contained no extractable text.".to_string()),
                )
                .await?;
            self.registry
                .finish_job(job.id, JobState::Succeeded, None)
                .await?;
            return Ok(());
        }
        ensure_live(cancel)?;

        // embed
        self.advance(job, &material, Stage::Embed).await?;
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<(usize, usize)>();
        let registry = Arc::clone(&self.registry);
        let material_id = material.id;
        let progress_task = tokio::spawn(async move {
            while let Some((done, total)) = progress_rx.recv().await {
                let pct = Stage::Embed.base_progress()
                    + (done * (100 / Stage::COUNT) / total.max(1)) as u8;
                if let Err(error) = registry.set_material_progress(material_id, pct).await {
                    warn!(material = %material_id, %error, "progress update failed");
                }
            }
        });
        let report = embed_chunks(
            Arc::clone(&self.llm),
            &chunks,
            &self.options,
            &self.policy,
            cancel,
            Some(progress_tx),
        )
        .await;
        let _ = progress_task.await;
        let report = report?;
        if report.succeeded() == 0 {
            return Err(PipelineError::EmbeddingFailed(
                "no chunk produced an embedding".to_string(),
            ));
        }
        ensure_live(cancel)?;

        // index
        self.advance(job, &material, Stage::Index).await?;
        let mut attempt = 0u32;
        let indexed = loop {
            attempt += 1;
            match self
                .index
                .index(&material.tenant_id, &mut chunks, &report.vectors)
                .await
            {
                Ok(count) => break count,
                Err(index_error) if index_error.is_transient() && attempt < self.policy.max_attempts => {
                    warn!(material = %material.id, attempt, error = %index_error, "index upsert retrying");
                    tokio::time::sleep(self.policy.delay_for(attempt)).await;
                }
                Err(index_error) => return Err(index_error.into()),
            }
        };

        let indexed_chunks: Vec<_> = chunks
            .iter()
            .filter(|chunk| chunk.embedding_ref.is_some())
            .cloned()
            .collect();
        self.registry
            .replace_chunks(material.id, indexed_chunks)
            .await?;

        let warning = if report.failures.is_empty() {
            None
        } else {
            for failure in &report.failures {
                warn!(material = %material.id, chunk = %failure.chunk_id, reason = %failure.reason, "chunk skipped");
            }
            Some(format!(
                "{} of {} chunks could not be embedded and were skipped.",
                report.failures.len(),
                chunks.len()
            ))
        };
        self.registry
            .complete_material(material.id, indexed, true, warning)
            .await?;
        self.registry
            .finish_job(job.id, JobState::Succeeded, None)
            .await?;
        Ok(())
    }

    async fn advance(
        &self,
        job: &ProcessingJob,
        material: &Material,
        stage: Stage,
    ) -> Result<()> {
        debug!(job = %job.id, material = %material.id, %stage, "stage started");
        self.registry.set_job_stage(job.id, stage).await?;
        self.registry
            .set_material_progress(material.id, stage.base_progress())
            .await
    }

    /// Partial index entries and chunk rows are removed so the material
    /// reads as never processed.
    async fn rollback(&self, job: &ProcessingJob) {
        if let Err(error) = self
            .index
            .delete_material(&job.tenant_id, job.material_id)
            .await
        {
            error!(material = %job.material_id, %error, "rollback index delete failed");
        }
        if let Err(error) = self.registry.delete_chunks(job.material_id).await {
            error!(material = %job.material_id, %error, "rollback chunk purge failed");
        }
    }
}

fn ensure_live(cancel: &watch::Receiver<bool>) -> Result<()> {
    if *cancel.borrow() {
        return Err(PipelineError::Cancelled);
    }
    Ok(())
}
