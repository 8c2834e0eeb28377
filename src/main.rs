use anyhow::{Context, Result};
use clap::Parser;
use crew_llm::config::{Config, LocalModels};
use crew_llm::{Attempt, EnvSource, ProcessEnv, ResolveError, Resolved};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "crew-llm",
    about = "Pick a working LLM backend for a crew — local Ollama first, remote providers as fallback"
)]
struct Cli {
    /// Path to config file [default: crew-llm.toml, built-in defaults when absent]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Probe candidates in priority order and report the first working backend
    Resolve {
        /// Print the attempt report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Resolve a backend, then send it a prompt and print the answer
    Complete {
        /// Prompt text
        prompt: String,
    },

    /// Check the OLLAMA_* environment and print the crew's model roster
    CheckEnv {
        /// Fail when any OLLAMA_* variable is unset instead of using defaults
        #[arg(long)]
        strict: bool,
    },

    /// List the effective candidate priority list and whether each is eligible
    Candidates,
}

#[derive(Serialize)]
struct ResolveReport<'a> {
    winner: Option<&'a str>,
    attempts: &'a [Attempt],
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crew_llm=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::from_cli(cli.config.as_deref())?;

    match cli.command {
        Command::Resolve { json } => {
            let outcome = resolve_backend(&config).await?;
            let attempts: &[Attempt] = match &outcome {
                Ok(resolved) => resolved.attempts.as_slice(),
                Err(ResolveError::Exhausted(failure)) => failure.attempts.as_slice(),
                Err(ResolveError::NoCandidates) => &[],
            };
            if json {
                let report = ResolveReport {
                    winner: outcome.as_ref().ok().map(|r| r.identifier.as_str()),
                    attempts,
                };
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for attempt in attempts {
                    println!("{:<48} {}", attempt.identifier, attempt.outcome);
                }
            }
            let resolved = outcome?;
            if !json {
                println!("\nUsing {}", resolved.identifier);
            }
            Ok(())
        }
        Command::Complete { prompt } => {
            let resolved = resolve_backend(&config).await??;
            info!(backend = %resolved.identifier, "sending prompt");
            let answer = resolved
                .handle
                .complete(&prompt)
                .await
                .with_context(|| format!("{} failed to answer", resolved.identifier))?;
            println!("{answer}");
            Ok(())
        }
        Command::CheckEnv { strict } => {
            let local = LocalModels::from_env(&ProcessEnv, &config.models, strict)?;
            println!("Ollama base URL: {}", local.base_url);
            println!("  LLAMA3:   {}", local.llama3);
            println!("  DEEPSEEK: {}", local.deepseek);
            println!("  GEMMA3:   {}", local.gemma3);
            Ok(())
        }
        Command::Candidates => {
            let candidates = config.build_candidates(&ProcessEnv)?;
            for (i, candidate) in candidates.iter().enumerate() {
                let missing = candidate.missing_env(&ProcessEnv);
                let status = if missing.is_empty() {
                    "eligible".to_string()
                } else {
                    format!("missing env {}", missing.join(", "))
                };
                println!(
                    "{:>2}. {:<48} {:<36} {}",
                    i + 1,
                    candidate.identifier,
                    candidate.endpoint.as_deref().unwrap_or("-"),
                    status
                );
            }
            Ok(())
        }
    }
}

async fn resolve_backend(config: &Config) -> Result<std::result::Result<Resolved, ResolveError>> {
    let env: &dyn EnvSource = &ProcessEnv;
    let candidates = config.build_candidates(env)?;
    info!(count = candidates.len(), "resolving model backend");
    Ok(config.resolver().resolve(&candidates, env).await)
}
