//! PIRLS Agent - command line entry point
//!
//! Answers one question and prints the answer to stdout.

use clap::Parser;
use pirls_agent::{config::Config, submission::create_submission_with_config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "pirls-agent", version, about = "Ask a question about PIRLS 2021")]
struct Cli {
    /// The question to answer
    question: String,

    /// Identifier attached to requests and log lines
    #[arg(long, default_value = "cli")]
    call_id: String,

    /// Override MAX_ITERATIONS
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Override DEFAULT_MODEL
    #[arg(long)]
    model: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr so stdout only carries the answer
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pirls_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(max_iterations) = cli.max_iterations {
        config.max_iterations = max_iterations;
    }
    if let Some(model) = cli.model {
        config.default_model = model;
    }
    info!("Loaded configuration: model={}", config.default_model);

    let agent = create_submission_with_config(&cli.call_id, &config)?;
    let answer = agent.run(&cli.question).await;
    println!("{}", answer);

    Ok(())
}
