//! `flow`: run and validate flow definitions from the command line.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use agent_flow::{
    ConditionEvaluator, DependencyResolver, ExecutorProvider, FlowDefinition, FlowError,
    FlowRequest, FlowRunner, StepKind,
};

#[derive(Parser)]
#[command(name = "flow", version, about = "Declarative multi-agent flow runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a flow definition against a request.
    Run {
        /// Path to the flow definition JSON.
        #[arg(short, long)]
        flow: PathBuf,

        /// The user request the flow runs against.
        #[arg(short, long)]
        request: String,

        /// Trace id propagated to every agent invocation.
        #[arg(long)]
        trace_id: Option<String>,

        /// Agent provider (`mock`, `command:<program>`, or an `http(s)://`
        /// endpoint). The `AGENT_FLOW_PROVIDER` environment variable takes
        /// precedence.
        #[arg(long)]
        provider: Option<String>,

        /// Print the full run (step results included) as JSON instead of
        /// just the aggregated output.
        #[arg(long)]
        json: bool,
    },
    /// Validate a flow definition without running it.
    Validate {
        /// Path to the flow definition JSON.
        #[arg(short, long)]
        flow: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,agent_flow=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            flow,
            request,
            trace_id,
            provider,
            json,
        } => {
            let definition = load_flow(&flow)?;
            let executor = ExecutorProvider::from_settings(provider.as_deref()).build();
            let runner = FlowRunner::new(executor);

            let mut flow_request = FlowRequest::new(request);
            if let Some(trace_id) = trace_id {
                flow_request = flow_request.with_trace_id(trace_id);
            }

            match runner.execute(&definition, &flow_request).await {
                Ok(run) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&run)?);
                    } else {
                        println!("{}", run.output);
                    }
                    if run.success {
                        Ok(())
                    } else {
                        anyhow::bail!("flow completed with failed steps");
                    }
                }
                Err(FlowError::Execution {
                    step_id,
                    message,
                    partial,
                    ..
                }) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&partial)?);
                    } else {
                        let mut ids: Vec<&String> = partial.step_results.keys().collect();
                        ids.sort();
                        for id in ids {
                            let result = &partial.step_results[id];
                            let status = if result.skipped {
                                "skipped"
                            } else if result.success {
                                "ok"
                            } else {
                                "failed"
                            };
                            eprintln!("  {id}: {status}");
                        }
                    }
                    anyhow::bail!("step '{step_id}' failed: {message}")
                }
                Err(e) => Err(e.into()),
            }
        }
        Command::Validate { flow } => {
            let definition = load_flow(&flow)?;
            definition.validate()?;

            let resolver = DependencyResolver::new(&definition.steps)?;
            let waves = resolver.group_into_waves()?;

            for step in &definition.steps {
                if let Some(condition) = step.condition.as_deref() {
                    ConditionEvaluator::validate_condition(condition)
                        .with_context(|| format!("bad condition on step '{}'", step.id))?;
                }
                if let StepKind::Branch { branches, .. } = &step.kind {
                    for arm in branches {
                        ConditionEvaluator::validate_condition(&arm.condition).with_context(
                            || format!("bad branch condition on step '{}'", step.id),
                        )?;
                    }
                }
            }

            println!(
                "{}: {} step(s) in {} wave(s)",
                definition.id,
                definition.steps.len(),
                waves.len()
            );
            for (i, wave) in waves.iter().enumerate() {
                println!("  wave {i}: {}", wave.join(", "));
            }
            Ok(())
        }
    }
}

fn load_flow(path: &PathBuf) -> Result<FlowDefinition> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read flow definition {}", path.display()))?;
    FlowDefinition::from_json(&text)
        .with_context(|| format!("invalid flow definition {}", path.display()))
}
