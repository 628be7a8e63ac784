use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use promptql_engine::{
    Config, InMemoryBackend, LlmGateway, OutputFormat, PromptQlEngine, QueryMode, QueryOptions,
};

const USAGE: &str = "usage: promptql [--format table|markdown|csv|json|summary] [--mode MODE] \
[--session ID] [--explain] [--llm] [PROMPT...]";

#[derive(Debug, Default)]
struct CliArgs {
    format: OutputFormat,
    mode: Option<QueryMode>,
    session: Option<String>,
    explain: bool,
    llm: bool,
    prompt: Option<String>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<CliArgs> {
    let mut parsed = CliArgs::default();
    let mut words = Vec::new();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--format" => {
                let value = args.next().context("--format needs a value")?;
                parsed.format = value.parse()?;
            }
            "--mode" => {
                let value = args.next().context("--mode needs a value")?;
                parsed.mode = Some(value.parse()?);
            }
            "--session" => {
                parsed.session = Some(args.next().context("--session needs a value")?);
            }
            "--explain" => parsed.explain = true,
            "--llm" => parsed.llm = true,
            "-h" | "--help" => anyhow::bail!(USAGE),
            _ => words.push(arg),
        }
    }
    if !words.is_empty() {
        parsed.prompt = Some(words.join(" "));
    }
    Ok(parsed)
}

async fn answer(engine: &PromptQlEngine, args: &CliArgs, prompt: &str) -> anyhow::Result<()> {
    if args.explain {
        let explanation = engine.explain(prompt).await?;
        println!("{}", serde_json::to_string_pretty(&explanation)?);
        return Ok(());
    }

    let mut options = QueryOptions {
        mode: args.mode,
        session_id: args.session.clone(),
        deep_understanding: args.llm,
        ..Default::default()
    };
    if options.session_id.is_none() && args.mode == Some(QueryMode::Conversational) {
        options = options.with_session("cli");
    }

    let result = engine.query(prompt, options).await;
    if !result.success {
        error!(
            "{}: {}",
            result.error_code.as_deref().unwrap_or("ERROR"),
            result.error.as_deref().unwrap_or_default()
        );
        return Ok(());
    }

    println!("{}", engine.formatter().format(&result.data, args.format));
    for warning in &result.warnings {
        println!("warning: {}", warning);
    }
    if args.llm {
        match engine.narrate(prompt, &result).await {
            Ok(narration) => println!("\n{}", narration),
            Err(e) => error!("Narration failed: {}", e),
        }
    }
    if !result.suggestions.is_empty() {
        println!("\nTry next:");
        for suggestion in &result.suggestions {
            println!("  {}", suggestion);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_ansi(config.logging.style != "never")
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args(std::env::args().skip(1))?;

    let mut engine = PromptQlEngine::new(config.engine.clone());
    match &config.data.path {
        Some(path) => {
            let store = InMemoryBackend::from_file(path)
                .await
                .with_context(|| format!("Failed to load data from {}", path))?;
            engine = engine.with_in_memory(Arc::new(store));
        }
        None => info!("No data file configured (PROMPTQL_DATA); queries run without a backend"),
    }
    if args.llm {
        let gateway = LlmGateway::from_config(&config.llm)?;
        info!("Using {} via {}", gateway.model_name(), config.llm.gateway_url);
        engine = engine.with_llm(Arc::new(gateway));
    }

    if let Some(prompt) = &args.prompt {
        answer(&engine, &args, prompt).await?;
    } else {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let prompt = line.trim();
            if prompt.is_empty() {
                continue;
            }
            if matches!(prompt, "exit" | "quit") {
                break;
            }
            answer(&engine, &args, prompt).await?;
        }
    }

    let stats = engine.stats().await;
    info!(
        "Processed {} queries ({} failed, {} cache hits)",
        stats.queries_processed, stats.failed_queries, stats.cache_hits
    );
    engine.teardown().await;
    Ok(())
}
