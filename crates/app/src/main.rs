use clap::{Parser, Subcommand};
use chrono::Utc;
use rag_pipeline_core::{
    BlobStore, FsBlobStore, HttpLlm, IndexManager, InMemoryRegistry, KeywordIndex,
    LlmCapability, MaterialStatus, MemoryBlobStore, MemoryIndex, NgramEmbedder,
    OpenSearchStore, PipelineOptions, PipelineOrchestrator, QdrantStore, VectorIndex,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "rag-pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// OpenSearch base URL. In-memory keyword index when omitted.
    #[arg(long)]
    opensearch_url: Option<String>,

    /// OpenSearch index name
    #[arg(long, default_value = "rag_chunks")]
    opensearch_index: String,

    /// Qdrant base URL. In-memory vector index when omitted.
    #[arg(long)]
    qdrant_url: Option<String>,

    /// Qdrant collection
    #[arg(long, default_value = "rag_chunks")]
    qdrant_collection: String,

    /// Embedding/completion endpoint. Local hash embedder when omitted.
    #[arg(long)]
    llm_endpoint: Option<String>,

    /// Bearer token for the LLM endpoint
    #[arg(long, env = "RAG_LLM_API_KEY")]
    llm_api_key: Option<String>,

    /// Embedding vector size
    #[arg(long, default_value = "768")]
    dimensions: usize,

    /// Directory for uploaded blobs. In-memory when omitted.
    #[arg(long)]
    blob_root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a document and process it to completion.
    Ingest {
        /// Path to a pdf, docx, xlsx, or csv file.
        #[arg(long)]
        file: PathBuf,
        /// Tenant that owns the document.
        #[arg(long)]
        tenant: String,
        /// Display title; defaults to the file stem.
        #[arg(long)]
        title: Option<String>,
    },
    /// Hybrid search over a tenant's indexed chunks.
    Search {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        query: String,
        /// Number of results to return.
        #[arg(long, default_value = "10")]
        top_k: usize,
    },
    /// Processing status of a material.
    Status {
        #[arg(long)]
        material: Uuid,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    let options = PipelineOptions {
        embedding_dimensions: cli.dimensions,
        ..PipelineOptions::default()
    };

    let llm: Arc<dyn LlmCapability> = match &cli.llm_endpoint {
        Some(endpoint) => Arc::new(
            HttpLlm::new(endpoint, cli.llm_api_key.clone(), cli.dimensions)
                .with_timeout(options.capability_deadline),
        ),
        None => Arc::new(NgramEmbedder::new(cli.dimensions)),
    };

    let memory = Arc::new(MemoryIndex::new());
    let keyword: Arc<dyn KeywordIndex> = match &cli.opensearch_url {
        Some(url) => {
            let store = OpenSearchStore::new(url, &cli.opensearch_index);
            store.ensure_index().await?;
            Arc::new(store)
        }
        None => memory.clone(),
    };
    let vector: Arc<dyn VectorIndex> = match &cli.qdrant_url {
        Some(url) => {
            let store = QdrantStore::new(url, &cli.qdrant_collection, cli.dimensions);
            store.ensure_collection().await?;
            Arc::new(store)
        }
        None => memory,
    };
    let blob: Arc<dyn BlobStore> = match &cli.blob_root {
        Some(root) => Arc::new(FsBlobStore::new(root.clone())),
        None => Arc::new(MemoryBlobStore::new()),
    };

    let index = Arc::new(IndexManager::new(keyword, vector, Arc::clone(&llm)));
    let orchestrator = PipelineOrchestrator::new(
        blob,
        Arc::new(InMemoryRegistry::new()),
        index,
        llm,
        options,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        "rag-pipeline boot"
    );

    match cli.command {
        Command::Ingest {
            file,
            tenant,
            title,
        } => {
            let bytes = tokio::fs::read(&file).await?;
            let filename = file
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| anyhow::anyhow!("file has no usable name"))?
                .to_string();
            let title = title.unwrap_or_else(|| {
                file.file_stem()
                    .and_then(|stem| stem.to_str())
                    .unwrap_or(&filename)
                    .to_string()
            });

            let staged = orchestrator
                .stage_material(&tenant, &title, &filename, &bytes)
                .await?;
            if staged.duplicate {
                println!(
                    "identical bytes already uploaded as material {}",
                    staged.material.id
                );
            }
            orchestrator.request_ingestion(staged.material.id).await?;
            println!("material {} queued", staged.material.id);

            let mut last_progress = u8::MAX;
            loop {
                let report = orchestrator.status(staged.material.id).await?;
                if report.progress_pct != last_progress {
                    last_progress = report.progress_pct;
                    let step = report.current_step.as_deref().unwrap_or("-");
                    println!("  {:>3}% {step}", report.progress_pct);
                }
                match report.status {
                    MaterialStatus::Completed => {
                        println!(
                            "done: {} chunks indexed at {}",
                            report.chunk_count,
                            Utc::now().to_rfc3339()
                        );
                        if let Some(warning) = report.warning {
                            println!("warning: {warning}");
                        }
                        break;
                    }
                    MaterialStatus::Failed => {
                        let message = report.error.unwrap_or_default();
                        anyhow::bail!("ingestion failed: {message}");
                    }
                    _ => tokio::time::sleep(Duration::from_millis(250)).await,
                }
            }
        }
        Command::Search {
            tenant,
            query,
            top_k,
        } => {
            let hits = orchestrator.search(&tenant, &query, top_k).await?;
            println!("query: {query}");
            if hits.is_empty() {
                println!("no results");
            }
            for (rank, hit) in hits.iter().enumerate() {
                let locators: Vec<String> =
                    hit.locators.iter().map(|l| l.to_string()).collect();
                println!(
                    "{:>2}. score={:.4} material={} seq={} [{}]",
                    rank + 1,
                    hit.score,
                    hit.material_id,
                    hit.sequence_index,
                    locators.join(", ")
                );
                println!("    {}", preview(&hit.text, 160));
            }
        }
        Command::Status { material } => {
            let report = orchestrator.status(material).await?;
            println!("status:   {:?}", report.status);
            println!("progress: {}%", report.progress_pct);
            if let Some(step) = report.current_step {
                println!("step:     {step}");
            }
            println!("chunks:   {}", report.chunk_count);
            if let Some(error) = report.error {
                println!("error:    {error}");
            }
            if let Some(warning) = report.warning {
                println!("warning:  {warning}");
            }
        }
    }

    Ok(())
}

fn preview(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(max_chars).collect();
    format!("{cut}...")
}
