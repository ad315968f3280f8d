//! Command-line entry point: parse a flow document and either execute it
//! against the demo dispatcher or render its dependency graph.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowcraft_core::model::Flow;
use flowcraft_engine::events::{Event, EventOptionsPatch};
use flowcraft_engine::FlowExecutor;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use std::time::Duration;

use crate::dispatcher::DemoDispatcher;

fn create_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let spinner_style = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
        .template("{spinner:.green} {msg}")
        .unwrap();
    pb.set_style(spinner_style);
    pb.set_message("running flow...");
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

#[derive(Parser)]
#[command(name = "flowcraft")]
#[command(about = "Execute and inspect declarative RPC-flow documents")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow document against the built-in demo dispatcher.
    Run {
        /// Path to a YAML or JSON flow document.
        path: PathBuf,
        /// Optional JSON object merged in as the flow's initial context.
        #[arg(short, long)]
        context: Option<String>,
        /// Suppress per-step progress output.
        #[arg(short, long)]
        quiet: bool,
    },
    /// Print the flow's dependency graph as a Mermaid diagram.
    Graph {
        /// Path to a YAML or JSON flow document.
        path: PathBuf,
    },
    /// Parse and validate a flow document without executing it.
    Validate {
        /// Path to a YAML or JSON flow document.
        path: PathBuf,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { path, context, quiet } => run_flow(&path, context.as_deref(), quiet).await,
        Commands::Graph { path } => print_graph(&path),
        Commands::Validate { path } => validate_flow(&path),
    }
}

fn load_flow(path: &PathBuf) -> Result<Flow> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("reading flow document at {}", path.display()))?;
    let flow = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        Flow::from_json_str(&contents)
    } else {
        Flow::from_yaml_str(&contents)
    };
    flow.map_err(|e| anyhow::anyhow!("{e}"))
}

async fn run_flow(path: &PathBuf, context: Option<&str>, quiet: bool) -> Result<()> {
    let flow = load_flow(path)?;
    let executor = FlowExecutor::new(flow, Arc::new(DemoDispatcher::new())).map_err(|e| anyhow::anyhow!("{e}"))?;

    if let Some(context) = context {
        let value: serde_json::Value = serde_json::from_str(context).context("parsing --context as JSON")?;
        executor.set_context(value);
    }

    let pb = if quiet { None } else { Some(create_progress_bar()) };

    if let Some(pb) = pb.clone() {
        executor.update_event_options(EventOptionsPatch {
            include_results: Some(true),
            ..Default::default()
        });
        executor.subscribe(move |event| print_event(&pb, event));
    }

    let outcome = executor.execute().await;
    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }
    let results = outcome.map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("{}", serde_json::to_string_pretty(&results_to_json(&results))?);
    Ok(())
}

fn results_to_json(results: &flowcraft_core::model::StepResultMap) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (name, result) in results {
        map.insert(name.clone(), result.to_value());
    }
    serde_json::Value::Object(map)
}

fn print_event(pb: &ProgressBar, event: &Event) {
    match event {
        Event::StepStart { step, .. } => pb.set_message(format!("running {step}...")),
        Event::StepComplete { step, duration_ms, .. } => pb.println(format!("{} {step} ({duration_ms}ms)", "✔".green())),
        Event::StepError { step, error, .. } => pb.println(format!("{} {step}: {error}", "✘".red())),
        Event::StepRetry { step, attempt, delay_ms, .. } => pb.println(format!("{} {step} (attempt {attempt}, retrying in {delay_ms}ms)", "↻".yellow())),
        Event::FlowComplete { duration_ms, .. } => pb.println(format!("{} flow complete in {duration_ms}ms", "✔".green().bold())),
        Event::FlowError { error, .. } => pb.println(format!("{} flow failed: {error}", "✘".red().bold())),
        _ => {}
    }
}

fn print_graph(path: &PathBuf) -> Result<()> {
    let flow = load_flow(path)?;
    let graph = flowcraft_engine::DependencyGraph::build(&flow).map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("{}", graph.mermaid(&flow));
    Ok(())
}

fn validate_flow(path: &PathBuf) -> Result<()> {
    let flow = load_flow(path)?;
    flow.validate_unique_names().map_err(|e| anyhow::anyhow!("{e}"))?;
    flowcraft_engine::DependencyGraph::build(&flow).map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("{} {} is valid ({} steps)", "✔".green(), flow.name, flow.steps.len());
    Ok(())
}
