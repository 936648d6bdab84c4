use std::path::PathBuf;
use std::sync::Arc;

use analyst::{check_endpoint, ChatCompletionsGenerator, HttpJsonBackend, PostgresBackend, RuntimeConfig};
use analyst_coordination::data::{BackendSet, FixtureBackend, QueryRegistry};
use analyst_coordination::{
    AnalysisContext, AnalysisEngine, AnalystConfig, ComplexityTier, FactConsistencyVerifier,
    RunOptions, SynthesisResult,
};
use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Answer an analytical question through a fact-grounded debate.
#[derive(Debug, Parser)]
#[command(name = "analyst", version)]
struct Args {
    /// The question to analyze.
    question: String,

    /// Engine config (TOML). ANALYST_* variables override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Query definitions file (TOML or YAML).
    #[arg(long)]
    definitions: Option<PathBuf>,

    /// JSON fixture tables served to `fixture` queries.
    #[arg(long)]
    fixtures: Option<PathBuf>,

    /// Skip classification and use this tier.
    #[arg(long)]
    tier: Option<ComplexityTier>,

    /// Print every progress event as a JSON line.
    #[arg(long)]
    stream: bool,

    /// Print the final result as JSON.
    #[arg(long)]
    json: bool,
}

fn build_backends(runtime: &RuntimeConfig, fixtures: Option<&PathBuf>) -> Result<BackendSet> {
    let mut backends = BackendSet::new().with(Arc::new(
        HttpJsonBackend::new(runtime.http_timeout).context("Failed to build HTTP client")?,
    ));
    if let Some(url) = &runtime.database_url {
        backends.register(Arc::new(PostgresBackend::new(url.clone())));
    }
    if let Some(path) = fixtures {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixtures {}", path.display()))?;
        let value: serde_json::Value =
            serde_json::from_str(&text).context("Fixtures are not valid JSON")?;
        let fixture = FixtureBackend::from_json(value).context("Invalid fixture document")?;
        info!(tables = ?fixture.table_names(), "Fixture backend loaded");
        backends.register(Arc::new(fixture));
    }
    Ok(backends)
}

fn print_report(result: &SynthesisResult) {
    println!("{}\n", result.narrative);
    println!("{}", result.summary_line());
    if !result.citations_used.is_empty() {
        println!("Sources: {}", result.citations_used.join(", "));
    }
    for caveat in &result.caveats {
        println!("  - {}", caveat);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let runtime = RuntimeConfig::default();
    info!("{}", runtime.describe());

    let config = AnalystConfig::load(args.config.as_deref()).context("Failed to load config")?;
    let definitions = args
        .definitions
        .clone()
        .unwrap_or_else(|| runtime.definitions_path.clone());
    let registry = QueryRegistry::from_path(&definitions)
        .with_context(|| format!("Failed to load definitions {}", definitions.display()))?;
    info!(queries = registry.len(), path = %definitions.display(), "Query registry loaded");

    if !check_endpoint(&runtime.llm.url).await {
        warn!(url = %runtime.llm.url, "Generation endpoint not reachable; debate turns will fail");
    }

    let backends = build_backends(&runtime, args.fixtures.as_ref())?;
    let generator = ChatCompletionsGenerator::new(runtime.llm.clone())
        .context("Failed to build generation client")?;
    let ctx = AnalysisContext::new(
        config,
        Arc::new(registry),
        backends,
        Arc::new(generator),
        Arc::new(FactConsistencyVerifier::default()),
    );
    let engine = Arc::new(AnalysisEngine::new(ctx.shared()));

    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; finishing with what the debate has so far");
                engine.shutdown();
            }
        });
    }

    let options = RunOptions {
        tier: args.tier,
        ..RunOptions::default()
    };
    let (mut events, handle) = engine.run_streaming(args.question.clone(), options);
    loop {
        match events.recv().await {
            Ok(event) => {
                if args.stream {
                    println!("{}", serde_json::to_string(&event)?);
                }
                if event.is_terminal() {
                    break;
                }
            }
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event stream lagged"),
            Err(RecvError::Closed) => break,
        }
    }
    let result = handle.await.context("Analysis task failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if !args.stream {
        print_report(&result);
    }
    Ok(())
}
