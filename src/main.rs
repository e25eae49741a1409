use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio_util::sync::CancellationToken;

use rag_core::core::config::{AppPaths, ConfigService};
use rag_core::core::logging;
use rag_core::llm::OpenAiClient;
use rag_core::rag::{open_store, IngestOutcome, Metadata, RagPipeline};

const DEFAULT_DOCUMENT: &str = "sample.txt";
const DEFAULT_QUESTION: &str = "What are the benefits of RAG?";
const PREVIEW_CHARS: usize = 50;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let paths = Arc::new(AppPaths::new());
    paths.ensure_dirs();
    logging::init(&paths).context("Failed to initialise logging")?;

    let config_service = ConfigService::new(paths.clone());
    let config = config_service
        .load_config()
        .context("Failed to load config")?;
    if let Ok(redacted) = config_service.redacted_config() {
        tracing::debug!("Effective config: {}", redacted);
    }

    if config.api.api_key.is_empty() {
        bail!("OPENAI_API_KEY is not set");
    }

    let mut args = env::args().skip(1);
    let document = PathBuf::from(args.next().unwrap_or_else(|| DEFAULT_DOCUMENT.to_string()));
    let question = args.next().unwrap_or_else(|| DEFAULT_QUESTION.to_string());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let client = Arc::new(OpenAiClient::from_config(&config.api)?);
    let store = open_store(&config, &paths)
        .await
        .with_context(|| format!("Failed to open {} store", config.store.backend))?;
    let pipeline = RagPipeline::new(store, client, &config);

    match pipeline
        .ingest_file(&document, Metadata::new(), &cancel)
        .await
        .with_context(|| format!("Failed to ingest {}", document.display()))?
    {
        IngestOutcome::Stored { chunks } => {
            println!("Stored {} as {} chunks", document.display(), chunks)
        }
        IngestOutcome::Unchanged => println!("{} is already up to date", document.display()),
    }

    println!("\n--- Query: {} ---", question);
    let answer = pipeline
        .answer(&question, &cancel)
        .await
        .context("Failed to answer question")?;

    println!("\n--- Search Results ---");
    for result in &answer.results {
        let preview: String = result.text.chars().take(PREVIEW_CHARS).collect();
        println!("[Score: {:.4}] {}...", result.score, preview);
    }

    println!("\nAnswer:\n{}", answer.text);
    Ok(())
}
