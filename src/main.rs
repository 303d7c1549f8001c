use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stepflow_core::config::EngineConfig;
use stepflow_core::event::{EventBus, EventType, RunEvent};
use stepflow_core::traits::{handler_fn, HandlerOutcome, HandlerRequest};
use stepflow_core::types::{NodeType, RunId, WorkflowDefinition};
use stepflow_engine::{
    compile, validate, GateBroker, GateDecision, HandlerRegistry, RunLogger, WorkflowRunner,
};

#[derive(Parser)]
#[command(name = "stepflow", version, about = "Workflow DAG compiler and execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stepflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow definition and list every problem found
    Validate {
        /// Workflow definition (JSON)
        workflow: PathBuf,
    },
    /// Show the execution plan of a workflow
    Compile {
        /// Workflow definition (JSON)
        workflow: PathBuf,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Execute a workflow with built-in echo handlers
    Run {
        /// Workflow definition (JSON)
        workflow: PathBuf,
        /// Run input as inline JSON, or @path to a JSON file
        #[arg(long)]
        input: Option<String>,
        /// Compile and print the plan without executing
        #[arg(long)]
        dry_run: bool,
        /// Approve every human gate without prompting
        #[arg(long)]
        auto_approve: bool,
    },
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
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stepflow=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "stepflow", &mut std::io::stdout());
        return Ok(());
    }

    let config = EngineConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Validate { workflow } => {
            let def = load_definition(&workflow, &config)?;
            let errors = validate(&def);
            if errors.is_empty() {
                println!("{}: ok ({} nodes, {} edges)", def.id, def.nodes.len(), def.edges.len());
            } else {
                for e in &errors {
                    println!("  [{:?}] {}", e.kind(), e);
                }
                bail!("{} validation error(s) in {}", errors.len(), workflow.display());
            }
        }
        Commands::Compile { workflow, json } => {
            let def = load_definition(&workflow, &config)?;
            let compiled = compile(def)?;
            if json {
                let plan = json!({
                    "id": compiled.id(),
                    "version": compiled.version(),
                    "topological_order": compiled.topological_order(),
                    "levels": compiled.levels(),
                });
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print_plan(&compiled);
            }
        }
        Commands::Run {
            workflow,
            input,
            dry_run,
            auto_approve,
        } => {
            let def = load_definition(&workflow, &config)?;
            let input = parse_input(input.as_deref())?;
            let compiled = Arc::new(compile(def)?);
            if dry_run {
                print_plan(&compiled);
                return Ok(());
            }
            run_workflow(&config, compiled, input, auto_approve).await?;
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_definition(path: &Path, config: &EngineConfig) -> anyhow::Result<WorkflowDefinition> {
    let mut def = WorkflowDefinition::load(path).with_context(|| format!("reading {}", path.display()))?;
    config.apply_defaults(&mut def);
    Ok(def)
}

/// `--input` is inline JSON or `@path`; the run input must be an object.
fn parse_input(raw: Option<&str>) -> anyhow::Result<Value> {
    let value = match raw {
        None => json!({}),
        Some(arg) => {
            let text = match arg.strip_prefix('@') {
                Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?,
                None => arg.to_string(),
            };
            serde_json::from_str(&text).context("parsing run input")?
        }
    };
    if !value.is_object() {
        bail!("run input must be a JSON object");
    }
    Ok(value)
}

fn print_plan(compiled: &stepflow_engine::CompiledWorkflow) {
    println!("{} v{}", compiled.id(), compiled.version());
    for (i, level) in compiled.levels().iter().enumerate() {
        println!("  level {}: {}", i, level.join(", "));
    }
}

async fn run_workflow(
    config: &EngineConfig,
    compiled: Arc<stepflow_engine::CompiledWorkflow>,
    input: Value,
    auto_approve: bool,
) -> anyhow::Result<()> {
    let event_bus = Arc::new(EventBus::new(config.events.capacity));
    let gates = Arc::new(GateBroker::new());
    let echo = || {
        handler_fn(|req: HandlerRequest, _cancel| async move { HandlerOutcome::success(req.input) })
    };
    let registry = HandlerRegistry::new()
        .with(NodeType::AgentCall, echo())
        .with(NodeType::ToolCall, echo());
    let runner = WorkflowRunner::new(
        Arc::new(registry),
        event_bus.clone(),
        gates.clone(),
        config.runner.clone(),
    );

    let run_id = RunId::new();
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Cancelling run...");
        cancel_clone.cancel();
    });

    let log_handle = config.log.as_ref().filter(|l| l.enabled).map(|log| {
        let logger = RunLogger::new(log.resolved_dir());
        info!(path = %logger.log_path(&run_id).display(), "Logging run");
        // Not tied to Ctrl-C, so the final run event still gets written
        tokio::spawn(logger.run(event_bus.subscribe(), run_id.clone(), CancellationToken::new()))
    });

    // Subscribe before the run starts so no event is missed
    let mut rx = event_bus.subscribe();
    let printer = {
        let gates = gates.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.run_id == run_id => {
                        print_event(&event);
                        if is_gate_wait(&event) {
                            answer_gate(&gates, &event, auto_approve).await;
                        }
                        if event.event_type.is_run_terminal() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event printer lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    let result = runner
        .execute_with_id(run_id, compiled, input, cancel)
        .await;
    printer.await.ok();
    if let Some(handle) = log_handle {
        handle.await.ok();
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.succeeded() {
        bail!("run {} finished {:?}", result.run_id, result.status);
    }
    Ok(())
}

fn is_gate_wait(event: &RunEvent) -> bool {
    event.event_type == EventType::NodeRunning && event.payload["awaiting"] == "human_gate"
}

fn print_event(event: &RunEvent) {
    let node = event.node_key.as_deref().unwrap_or("-");
    let detail = match event.event_type {
        EventType::NodeRunning => format!("attempt {}", event.payload["attempt"]),
        EventType::NodeFailed => event.payload["error"].to_string(),
        EventType::NodeSkipped | EventType::NodeCancelled => event.payload["reason"].to_string(),
        _ => String::new(),
    };
    eprintln!("[{}] {} {}", event.event_type.as_str(), node, detail);
    std::io::stderr().flush().ok();
}

async fn answer_gate(gates: &Arc<GateBroker>, event: &RunEvent, auto_approve: bool) {
    let Some(node_key) = event.node_key.clone() else {
        return;
    };
    let prompt = event.payload["prompt"]
        .as_str()
        .map(String::from)
        .unwrap_or_else(|| format!("Approve {node_key}?"));

    let approved = if auto_approve {
        true
    } else {
        eprintln!("  input: {}", event.payload["input"]);
        tokio::task::spawn_blocking(move || {
            dialoguer::Confirm::new()
                .with_prompt(prompt)
                .default(true)
                .interact()
                .unwrap_or(false)
        })
        .await
        .unwrap_or(false)
    };

    let (decision, payload) = if approved {
        (GateDecision::Approve, json!({ "approved_by": "cli" }))
    } else {
        (GateDecision::Reject, json!({ "reason": "rejected by user" }))
    };
    if let Err(e) = gates.resume(&event.run_id, &node_key, decision, payload).await {
        warn!(error = %e, node = %node_key, "Gate no longer pending");
    }
}
