mod validate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nodeflow_core::config::AppConfig;
use nodeflow_core::{EventBus, ExecutionLogEntry, ExpressionEvaluator, Graph, LogStatus};
use nodeflow_engine::{FlowExecutor, RunLogWriter, RunStatus};
use nodeflow_nodes::{NodeRegistry, RhaiEvaluator};
use nodeflow_variables::{VariableOrigin, VariableRegistry};

const DEFAULT_CONFIG: &str = "nodeflow.toml";

#[derive(Parser)]
#[command(name = "nodeflow", version, about = "Run and inspect node-graph workflows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow graph
    Run {
        /// Graph JSON file ({nodes, edges})
        graph: PathBuf,
        /// Trigger payload as inline JSON
        #[arg(long, conflicts_with = "input_file")]
        input: Option<String>,
        /// Read the trigger payload from a JSON file
        #[arg(long)]
        input_file: Option<PathBuf>,
        /// Mirror run events to a JSONL file
        #[arg(long)]
        log_file: Option<PathBuf>,
        /// Print the full run result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a graph without running it
    Validate { graph: PathBuf },
    /// List the variables a node can reference
    Variables {
        graph: PathBuf,
        /// Target node id
        #[arg(long)]
        node: String,
        /// Filter by name, label, description or path
        #[arg(long)]
        search: Option<String>,
        /// Run the flow with this payload first so runtime variables show up
        #[arg(long)]
        input: Option<String>,
    },
    /// List registered node types
    Plugins,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "nodeflow", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let event_bus = Arc::new(EventBus::new(config.event_bus.capacity));
    let variables = Arc::new(
        VariableRegistry::new(config.extractor.clone()).with_event_bus(event_bus.clone()),
    );
    let registry = Arc::new(
        NodeRegistry::with_builtins(&config, variables, None)?.with_event_bus(event_bus.clone()),
    );
    let evaluator: Arc<dyn ExpressionEvaluator> = Arc::new(RhaiEvaluator::new(&config.expression));

    match cli.command {
        Commands::Run {
            graph,
            input,
            input_file,
            log_file,
            json,
        } => {
            let workflow_id = graph
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "default".into());
            let graph = load_graph(&graph)?;
            let input = parse_input(input.as_deref(), input_file.as_deref())?;
            let executor = FlowExecutor::new(registry, evaluator, event_bus.clone())
                .with_workflow_id(workflow_id);

            let writer = log_file.map(|path| {
                let rx = event_bus.subscribe();
                tokio::spawn(RunLogWriter::new(path).run(rx, CancellationToken::new()))
            });

            let result = executor
                .execute_flow(&graph, input, |entry| {
                    if !json {
                        print_entry(entry);
                    }
                })
                .await;

            event_bus.flush().await;
            if let Some(handle) = writer {
                match handle.await {
                    Ok(Ok(lines)) => info!(lines, "Run log written"),
                    Ok(Err(e)) => warn!(error = %e, "Run log failed"),
                    Err(e) => warn!(error = %e, "Run log task panicked"),
                }
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!();
                println!(
                    "Run {} {:?} after {} node(s) in {}ms",
                    result.execution_id,
                    result.status,
                    result.path.len(),
                    result.elapsed_ms
                );
                if let Some(output) = result.final_output() {
                    println!("{}", serde_json::to_string_pretty(output)?);
                }
            }

            event_bus.shutdown().await;
            if result.status == RunStatus::Failed {
                let message = result
                    .failure
                    .map(|f| f.message)
                    .unwrap_or_else(|| "unknown error".into());
                anyhow::bail!("flow failed: {}", message);
            }
        }
        Commands::Validate { graph } => {
            let graph = load_graph(&graph)?;
            let issues = validate::run_validate(&graph, &registry);
            if issues > 0 {
                anyhow::bail!("{} issue(s) found", issues);
            }
        }
        Commands::Variables {
            graph,
            node,
            search,
            input,
        } => {
            let graph = load_graph(&graph)?;
            if graph.node(&node).is_none() {
                anyhow::bail!("node '{}' is not in the graph", node);
            }
            if let Some(input) = input {
                let input: Value = serde_json::from_str(&input).context("parsing --input")?;
                let executor = FlowExecutor::new(registry.clone(), evaluator, event_bus.clone());
                let result = executor.execute_flow(&graph, input, |_| {}).await;
                info!(status = ?result.status, "Seed run finished");
            }

            let variables = registry.variables();
            let available = match search.as_deref() {
                Some(term) => variables.get_suggestions(&node, &graph, term),
                None => variables.get_available_variables_for_node(&node, &graph),
            };
            if available.is_empty() {
                println!("No variables available to '{}'", node);
            }
            for var in available {
                let origin = match var.origin {
                    VariableOrigin::Static => "static".to_string(),
                    VariableOrigin::Runtime => format!("runtime:{}", var.depth.unwrap_or(0)),
                };
                println!(
                    "  {{{}}}  {:<8} {:<10} {}",
                    var.full_path,
                    var.var_type.as_str(),
                    origin,
                    preview_text(&var.preview)
                );
            }
            event_bus.shutdown().await;
        }
        Commands::Plugins => {
            for plugin in registry.list() {
                println!(
                    "  {:<10} {:<14} v{:<6} in:{} out:{} {}{}",
                    plugin.node_type,
                    plugin.name,
                    plugin.version,
                    plugin.ports.inputs,
                    plugin.ports.outputs,
                    plugin.description,
                    if plugin.enabled { "" } else { " (disabled)" }
                );
            }
            let problems = registry.validate_all();
            for (node_type, errors) in &problems {
                for error in errors {
                    println!("  [!!] {}: {}", node_type, error);
                }
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => unreachable!(),
    }

    Ok(())
}

/// A missing file at the default path means defaults; an explicit path must exist.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path == Path::new(DEFAULT_CONFIG) {
        Ok(AppConfig::load_or_default(path)?)
    } else {
        Ok(AppConfig::load(path)?)
    }
}

fn load_graph(path: &Path) -> anyhow::Result<Graph> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading graph {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing graph {}", path.display()))
}

fn parse_input(inline: Option<&str>, file: Option<&Path>) -> anyhow::Result<Value> {
    match (inline, file) {
        (Some(text), _) => serde_json::from_str(text).context("parsing --input"),
        (None, Some(path)) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
        }
        (None, None) => Ok(Value::Object(Default::default())),
    }
}

fn print_entry(entry: &ExecutionLogEntry) {
    let tag = match entry.status {
        LogStatus::Processing => "[..]",
        LogStatus::Success => "[OK]",
        LogStatus::Error => "[!!]",
        LogStatus::Skipped => "[--]",
    };
    println!("  {} {}: {}", tag, entry.node_label, entry.message);
}

fn preview_text(preview: &Value) -> String {
    match preview {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
