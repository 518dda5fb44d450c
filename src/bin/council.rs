#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use council_harness::council::{self, CouncilRequest};
use council_harness::gateway::{ModelCatalog, NoopUsageSink, ProviderGateway, StderrUsageSink};
use council_harness::gateway::openrouter::OpenRouterAdapter;
use council_harness::{input, vision};

#[derive(Parser)]
#[command(name = "council", version, about = "LLM council CLI")]
struct Cli {
    /// Log each provider call to stderr as a JSON line
    #[arg(long, global = true)]
    log_usage: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full council pipeline and print the final answer
    Ask {
        /// The question to put to the council
        prompt: String,

        /// Comma-separated OpenRouter model IDs (defaults to the built-in council)
        #[arg(long, value_delimiter = ',')]
        members: Vec<String>,

        /// Chairman model for the final synthesis
        #[arg(long)]
        chairman: Option<String>,

        /// Print the full council record as JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Run the pipeline and print each progress event as a JSON line
    Stream {
        prompt: String,

        #[arg(long, value_delimiter = ',')]
        members: Vec<String>,

        #[arg(long)]
        chairman: Option<String>,
    },
    /// Generate a short conversation title for a prompt
    Title { prompt: String },
    /// Extract structured context from an image and print it
    Vision {
        /// Path to the image file
        #[arg(long)]
        image: PathBuf,

        /// MIME type (guessed from the extension when omitted)
        #[arg(long)]
        mime: Option<String>,

        /// Preferred vision model to try first
        #[arg(long)]
        model: Option<String>,

        /// Optional caption; prints the rendered council prompt instead of raw JSON
        #[arg(long)]
        caption: Option<String>,
    },
    /// List free models from the catalog
    Models,
}

fn default_members(members: Vec<String>) -> Vec<String> {
    if members.is_empty() {
        council::DEFAULT_COUNCIL_MODELS
            .iter()
            .map(|m| m.to_string())
            .collect()
    } else {
        members
    }
}

fn guess_mime(path: &Path) -> String {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
    .to_string()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let adapter = OpenRouterAdapter::from_env()?;
    let gateway: Arc<dyn council_harness::ChatGateway> = if cli.log_usage {
        Arc::new(ProviderGateway::new(
            adapter.clone(),
            Arc::new(StderrUsageSink),
        ))
    } else {
        Arc::new(ProviderGateway::new(adapter.clone(), Arc::new(NoopUsageSink)))
    };

    match cli.command {
        Commands::Ask {
            prompt,
            members,
            chairman,
            json,
        } => {
            let mut req = CouncilRequest::new(prompt, default_members(members));
            if let Some(chairman) = chairman {
                req = req.chairman(chairman);
            }

            eprintln!("[council] dispatching to {} members...", req.members.len());
            let result = council::run_full_council(gateway.as_ref(), &req).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                eprintln!(
                    "[council] {} answers, {} rankings, consensus:",
                    result.stage1.len(),
                    result.stage2.len()
                );
                for (position, entry) in result.metadata.aggregate_ranking.iter().enumerate() {
                    eprintln!(
                        "[council]   #{} {} (mean rank {:.2}, {} votes)",
                        position + 1,
                        entry.model_id,
                        entry.mean_rank,
                        entry.vote_count
                    );
                }
                eprintln!(
                    "[council] chairman {} in {}ms",
                    result.stage3.chairman_model_id, result.metadata.duration_ms
                );
                println!("{}", result.stage3.content);
            }
        }

        Commands::Stream {
            prompt,
            members,
            chairman,
        } => {
            let mut req = CouncilRequest::new(prompt, default_members(members));
            if let Some(chairman) = chairman {
                req = req.chairman(chairman);
            }

            let mut events = council::run_council_streaming(gateway, req);
            while let Some(event) = events.next().await {
                println!("{}", serde_json::to_string(&event)?);
                if event.is_terminal() {
                    break;
                }
            }
        }

        Commands::Title { prompt } => {
            println!("{}", council::generate_title(gateway.as_ref(), &prompt).await);
        }

        Commands::Vision {
            image,
            mime,
            model,
            caption,
        } => {
            let bytes = std::fs::read(&image)?;
            let mime = mime.unwrap_or_else(|| guess_mime(&image));

            eprintln!("[council] extracting context from {}...", image.display());
            let ctx = vision::extract_vision_context(
                gateway.as_ref(),
                &bytes,
                &mime,
                model.as_deref(),
            )
            .await?;
            eprintln!(
                "[council] extracted with {} (confidence {:.2})",
                ctx.model_used, ctx.confidence
            );

            if caption.is_some() {
                println!("{}", input::normalize_input(caption.as_deref(), Some(&ctx))?);
            } else {
                println!("{}", serde_json::to_string_pretty(&ctx)?);
            }
        }

        Commands::Models => {
            let catalog = ModelCatalog::new(adapter);
            let models = catalog.free_models().await?;
            eprintln!("[council] {} free models", models.len());
            for model in models {
                match model.context_length {
                    Some(ctx_len) => println!("{}\t{}", model.id, ctx_len),
                    None => println!("{}", model.id),
                }
            }
        }
    }

    Ok(())
}
