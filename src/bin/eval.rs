use std::fs::File;
use std::io::{BufRead, BufReader};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use glovebox::models::{AskRequest, SourceReference};
use glovebox::router::{ExpertKind, ExpertRouter, KeywordRouter};
use glovebox::synthesizer::APOLOGY_MESSAGE;
use glovebox::{AppConfig, Services};

#[derive(Parser, Debug)]
#[command(name = "eval")]
#[command(about = "Measure retrieval hit-rate and routing accuracy over a JSONL prompt set")]
struct Cli {
    #[arg(long, default_value = "eval/prompts.jsonl")]
    file: String,
    #[arg(long, default_value_t = 3)]
    k: usize,
    /// Also generate answers through the model server.
    #[arg(long, default_value_t = false)]
    answers: bool,
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

#[derive(Debug, Deserialize)]
struct EvalPrompt {
    id: String,
    question: String,
    #[serde(default)]
    expect_document: Option<String>,
    #[serde(default)]
    expect_pages: Vec<i64>,
    #[serde(default)]
    expect_expert: Option<ExpertKind>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let services = Services::build(AppConfig::from_env()).await?;
    let router = KeywordRouter::new();

    let prompts = load_prompts(&cli.file)?;
    if prompts.is_empty() {
        anyhow::bail!("no prompts found in {}", cli.file);
    }

    let mut total = 0usize;
    let mut retrieval_expectations = 0usize;
    let mut hits_at_k = 0usize;
    let mut reciprocal_rank_sum = 0.0f32;
    let mut routing_expectations = 0usize;
    let mut routing_correct = 0usize;
    let mut degraded = 0usize;
    let mut apologies = 0usize;

    for prompt in prompts {
        total += 1;

        let result = services
            .retriever
            .retrieve(&prompt.question, cli.k, None)
            .await
            .with_context(|| format!("failed eval prompt {}", prompt.id))?;
        if result.is_degraded() {
            degraded += 1;
        }
        let sources = result.sources();

        if prompt.expect_document.is_some() || !prompt.expect_pages.is_empty() {
            retrieval_expectations += 1;
            if let Some(rank) = first_match(&sources, &prompt) {
                hits_at_k += 1;
                reciprocal_rank_sum += 1.0 / (rank + 1) as f32;
            }
        }

        let routed = router.classify(&prompt.question).kind;
        if let Some(expected) = prompt.expect_expert {
            routing_expectations += 1;
            if routed == expected {
                routing_correct += 1;
            }
        }

        if cli.answers {
            let response = services
                .chat
                .ask(AskRequest {
                    question: prompt.question.clone(),
                    document_type: None,
                })
                .await
                .with_context(|| format!("failed answering prompt {}", prompt.id))?;
            if response.answer == APOLOGY_MESSAGE {
                apologies += 1;
            }
            if cli.verbose {
                println!("A: {}", response.answer.replace('\n', " "));
            }
        }

        if cli.verbose {
            println!("--- {} ---", prompt.id);
            println!("Q: {}", prompt.question);
            println!("Expert: {}", routed.as_str());
            for source in &sources {
                println!(
                    "  {} p.{} ({:.3})",
                    source.document,
                    source
                        .page
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    source.relevance
                );
            }
            println!();
        }
    }

    println!("Eval prompts: {}", total);
    println!(
        "Hit-rate@{}: {:.1}% ({}/{})",
        cli.k,
        ratio(hits_at_k, retrieval_expectations) * 100.0,
        hits_at_k,
        retrieval_expectations
    );
    println!(
        "MRR@{}: {:.3}",
        cli.k,
        if retrieval_expectations > 0 {
            reciprocal_rank_sum / retrieval_expectations as f32
        } else {
            0.0
        }
    );
    if routing_expectations > 0 {
        println!(
            "Routing accuracy: {:.1}% ({}/{})",
            ratio(routing_correct, routing_expectations) * 100.0,
            routing_correct,
            routing_expectations
        );
    }
    println!("Degraded retrievals: {}", degraded);
    if cli.answers {
        println!("Apologies: {}", apologies);
    }

    Ok(())
}

/// Rank of the first source matching the expected document and pages.
fn first_match(sources: &[SourceReference], prompt: &EvalPrompt) -> Option<usize> {
    sources.iter().position(|source| {
        let document_ok = prompt
            .expect_document
            .as_ref()
            .map_or(true, |doc| source.document.eq_ignore_ascii_case(doc));
        let page_ok = prompt.expect_pages.is_empty()
            || source
                .page
                .is_some_and(|page| prompt.expect_pages.contains(&page));
        document_ok && page_ok
    })
}

fn load_prompts(path: &str) -> Result<Vec<EvalPrompt>> {
    let file = File::open(path).with_context(|| format!("failed opening {}", path))?;
    let reader = BufReader::new(file);
    let mut prompts = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let parsed: EvalPrompt = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid JSON at {} line {}", path, idx + 1))?;
        prompts.push(parsed);
    }

    Ok(prompts)
}

fn ratio(n: usize, d: usize) -> f32 {
    if d == 0 {
        return 0.0;
    }
    n as f32 / d as f32
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
