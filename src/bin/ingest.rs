use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use glovebox::models::{DocumentType, IngestRequest};
use glovebox::{AppConfig, Services};

#[derive(Parser, Debug)]
#[command(name = "ingest")]
#[command(about = "Ingest vehicle PDFs into the local vector store")]
struct Cli {
    /// PDF files to ingest.
    #[arg(long = "pdf")]
    pdfs: Vec<PathBuf>,
    /// Ingest every PDF under this directory.
    #[arg(long)]
    dir: Option<PathBuf>,
    /// manual | quick_reference | receipt | other; guessed from the file name when omitted.
    #[arg(long)]
    document_type: Option<String>,
    #[arg(long, default_value_t = false)]
    rebuild: bool,
    /// Re-push degraded documents into the vector index and exit.
    #[arg(long, default_value_t = false)]
    reconcile: bool,
    /// Delete a document by name and exit.
    #[arg(long)]
    delete: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let services = Services::build(AppConfig::from_env()).await?;
    let ingestor = services.ingestor.clone();

    if let Some(name) = cli.delete {
        let deleted = ingestor.delete_document(&name).await?;
        println!("delete {}: {}", name, if deleted { "removed" } else { "not found" });
        return Ok(());
    }

    if cli.reconcile {
        let report = ingestor.reconcile().await?;
        println!(
            "Reconcile complete. repaired={} still_degraded={}",
            report.repaired.len(),
            report.still_degraded.len()
        );
        return Ok(());
    }

    let mut paths = cli.pdfs;
    if let Some(dir) = &cli.dir {
        paths.extend(
            WalkDir::new(dir)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|path| {
                    path.extension()
                        .and_then(|ext| ext.to_str())
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
                }),
        );
    }
    if paths.is_empty() {
        anyhow::bail!("nothing to ingest; pass --pdf <file> or --dir <directory>");
    }

    let document_type = cli.document_type.as_deref().map(DocumentType::from_db);
    let mut failed = 0usize;

    for path in paths {
        let request = IngestRequest {
            path: path.display().to_string(),
            document_name: None,
            document_type,
            rebuild: cli.rebuild,
        };

        let job_id = format!("cli-{}", uuid::Uuid::new_v4());
        let result = ingestor
            .ingest(&job_id, request, |status| {
                println!(
                    "[{}] {} {} chunks={} pages={} {}",
                    status.status,
                    status.document_name,
                    status.stage,
                    status.chunk_count,
                    status.page_count,
                    status.message.unwrap_or_default()
                );
            })
            .await;

        match result {
            Ok(result) => println!(
                "Ingest complete. document={} skipped={} chunks={} pages={} index_state={}",
                result.document_name,
                result.skipped,
                result.chunk_count,
                result.page_count,
                result.index_state.as_str()
            ),
            Err(err) => {
                failed += 1;
                eprintln!("Ingest failed for {}: {:#}", path.display(), err);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} document(s) failed to ingest");
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
