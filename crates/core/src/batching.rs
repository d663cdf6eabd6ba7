use crate::embeddings::LlmCapability;
use crate::error::{IndexError, PipelineError};
use crate::models::{Chunk, PipelineOptions};
use crate::retry::{with_retry, RetryPolicy};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ChunkFailure {
    pub chunk_id: String,
    pub reason: String,
}

/// `vectors` is aligned with input chunk order regardless of batch
/// completion order.
#[derive(Debug, Default)]
pub struct EmbeddingReport {
    pub vectors: Vec<Option<Vec<f32>>>,
    pub failures: Vec<ChunkFailure>,
}

impl EmbeddingReport {
    pub fn succeeded(&self) -> usize {
        self.vectors.iter().filter(|v| v.is_some()).count()
    }
}

enum BatchResult {
    Complete(Vec<Vec<f32>>),
    Partial {
        slots: Vec<Option<Vec<f32>>>,
        failures: Vec<(usize, String)>,
    },
    Fatal(PipelineError),
}

struct BatchOutcome {
    offset: usize,
    len: usize,
    result: BatchResult,
}

async fn embed_one_batch(
    llm: Arc<dyn LlmCapability>,
    texts: Vec<String>,
    policy: RetryPolicy,
    dimensions: usize,
) -> BatchResult {
    let batch = with_retry(&policy, "embed batch", || async { llm.embed(&texts).await }).await;

    match batch {
        Ok(vectors) if vectors.len() == texts.len() => {
            for vector in &vectors {
                if vector.len() != dimensions {
                    return BatchResult::Fatal(
                        IndexError::DimensionMismatch {
                            expected: dimensions,
                            actual: vector.len(),
                        }
                        .into(),
                    );
                }
            }
            BatchResult::Complete(vectors)
        }
        Ok(vectors) => {
            warn!(
                requested = texts.len(),
                received = vectors.len(),
                "embedding batch returned wrong cardinality, retrying per chunk"
            );
            embed_per_chunk(llm, &texts, &policy, dimensions).await
        }
        Err(error) => {
            warn!(%error, "embedding batch exhausted retries, retrying per chunk");
            embed_per_chunk(llm, &texts, &policy, dimensions).await
        }
    }
}

/// One call per chunk so a poisoned input fails alone.
async fn embed_per_chunk(
    llm: Arc<dyn LlmCapability>,
    texts: &[String],
    policy: &RetryPolicy,
    dimensions: usize,
) -> BatchResult {
    let mut slots: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
    let mut failures = Vec::new();

    for (index, text) in texts.iter().enumerate() {
        let single = with_retry(policy, "embed chunk", || async {
            llm.embed(std::slice::from_ref(text)).await
        })
        .await;

        match single {
            Ok(mut vectors) => {
                if let Some(vector) = vectors.pop().filter(|_| vectors.is_empty()) {
                    if vector.len() != dimensions {
                        return BatchResult::Fatal(
                            IndexError::DimensionMismatch {
                                expected: dimensions,
                                actual: vector.len(),
                            }
                            .into(),
                        );
                    }
                    slots.push(Some(vector));
                } else {
                    failures.push((index, "wrong embedding cardinality".to_string()));
                    slots.push(None);
                }
            }
            Err(error) => {
                failures.push((index, error.to_string()));
                slots.push(None);
            }
        }
    }

    BatchResult::Partial { slots, failures }
}

/// Cancellation is observed at batch boundaries; in-flight calls are
/// allowed to finish.
pub async fn embed_chunks(
    llm: Arc<dyn LlmCapability>,
    chunks: &[Chunk],
    options: &PipelineOptions,
    policy: &RetryPolicy,
    cancel: &watch::Receiver<bool>,
    progress: Option<mpsc::UnboundedSender<(usize, usize)>>,
) -> Result<EmbeddingReport, PipelineError> {
    if chunks.is_empty() {
        return Ok(EmbeddingReport::default());
    }
    if *cancel.borrow() {
        return Err(PipelineError::Cancelled);
    }

    let batch_size = options.embedding_batch_size.max(1);
    let max_in_flight = options.max_in_flight_batches.max(1);
    let dimensions = options.embedding_dimensions;

    let batches: Vec<(usize, Vec<String>)> = chunks
        .chunks(batch_size)
        .enumerate()
        .map(|(i, slice)| {
            (
                i * batch_size,
                slice.iter().map(|c| c.text.clone()).collect(),
            )
        })
        .collect();
    let total = batches.len();
    debug!(chunks = chunks.len(), batches = total, "embedding material");

    let mut report = EmbeddingReport {
        vectors: vec![None; chunks.len()],
        failures: Vec::new(),
    };

    let mut set: JoinSet<BatchOutcome> = JoinSet::new();
    let mut batches = batches.into_iter();
    let mut dispatched = 0usize;
    let mut completed = 0usize;
    let mut cancelled = false;
    let mut fatal: Option<PipelineError> = None;

    while dispatched < total.min(max_in_flight) {
        if let Some((offset, texts)) = batches.next() {
            let llm = Arc::clone(&llm);
            let policy = policy.clone();
            let len = texts.len();
            set.spawn(async move {
                let result = embed_one_batch(llm, texts, policy, dimensions).await;
                BatchOutcome {
                    offset,
                    len,
                    result,
                }
            });
            dispatched += 1;
        }
    }

    while let Some(joined) = set.join_next().await {
        let outcome = joined
            .map_err(|error| PipelineError::EmbeddingFailed(format!("worker panicked: {error}")))?;
        completed += 1;
        if let Some(tx) = &progress {
            let _ = tx.send((completed, total));
        }

        match outcome.result {
            BatchResult::Complete(vectors) => {
                for (i, vector) in vectors.into_iter().enumerate() {
                    report.vectors[outcome.offset + i] = Some(vector);
                }
            }
            BatchResult::Partial { slots, failures } => {
                for (i, reason) in failures {
                    report.failures.push(ChunkFailure {
                        chunk_id: chunks[outcome.offset + i].id.clone(),
                        reason,
                    });
                }
                for (i, slot) in slots.into_iter().enumerate().take(outcome.len) {
                    report.vectors[outcome.offset + i] = slot;
                }
            }
            BatchResult::Fatal(error) => {
                if fatal.is_none() {
                    fatal = Some(error);
                }
            }
        }

        if *cancel.borrow() {
            cancelled = true;
        }

        if fatal.is_none() && !cancelled {
            if let Some((offset, texts)) = batches.next() {
                let llm = Arc::clone(&llm);
                let policy = policy.clone();
                let len = texts.len();
                set.spawn(async move {
                    let result = embed_one_batch(llm, texts, policy, dimensions).await;
                    BatchOutcome {
                        offset,
                        len,
                        result,
                    }
                });
            }
        }
    }

    if let Some(error) = fatal {
        return Err(error);
    }
    if cancelled {
        return Err(PipelineError::Cancelled);
    }
    Ok(report)
}
