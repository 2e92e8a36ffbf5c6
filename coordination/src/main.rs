//! Command-line runner for the dialectic engine.
//!
//! Runs one session end to end with the in-process stores and prints the
//! compiled decision. Engine events stream to stderr; Ctrl-C triggers a
//! global interrupt.
//!
//! # Usage
//!
//! ```bash
//! dialectic --goal "choose a message queue" \
//!     --constraint "must survive a zone outage" \
//!     --constraint "prefer managed services"
//!
//! # Machine-readable outcome
//! dialectic --goal "..." --json > outcome.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dialectic::{EngineConfig, EngineEvent, PhaseOrchestrator, SessionRequest};
use tokio::sync::broadcast::error::RecvError;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Decision goal to reason about
    #[arg(long)]
    goal: String,

    /// Initial constraint (repeatable). Wording such as "must" makes it hard.
    #[arg(long = "constraint")]
    constraints: Vec<String>,

    /// TOML configuration file; DIALECTIC_* variables are applied on top
    #[arg(long)]
    config: Option<PathBuf>,

    /// Debate round ceiling (overrides config)
    #[arg(long)]
    max_rounds: Option<u32>,

    /// Seed for Monte Carlo estimators
    #[arg(long)]
    seed: Option<u64>,

    /// Print the full outcome as JSON instead of markdown
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Do not stream engine events to stderr
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    }
    .apply_env();

    if let Some(rounds) = args.max_rounds {
        config.convergence.max_rounds = rounds;
        config.arbiter.max_rounds = rounds;
    }
    if let Some(seed) = args.seed {
        config.set_seed(seed);
    }
    config.validate()?;
    Ok(config)
}

fn describe(event: &EngineEvent) -> Option<String> {
    match event {
        EngineEvent::PhaseChanged { from, to, reason, .. } => {
            Some(format!("phase {from} → {to} ({reason})"))
        }
        EngineEvent::ProgressUpdated { phase, progress, message, .. } => {
            Some(format!("[{phase} {:>3.0}%] {message}", progress * 100.0))
        }
        EngineEvent::BranchPruned { branch_id, reason, .. } => {
            Some(format!("pruned {branch_id}: {reason}"))
        }
        EngineEvent::ConvergenceTriggered { round, trigger, .. } => {
            Some(format!("round {round}: {trigger}"))
        }
        EngineEvent::AuditCompleted { compliant, violations, cycles, .. } => Some(format!(
            "audit: compliant={compliant} violations={violations} cycles={cycles}"
        )),
        EngineEvent::GlobalInterrupt { user_id, branches_paused, .. } => {
            Some(format!("interrupt by {user_id}: {branches_paused} branches paused"))
        }
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&args)?;
    let live = config.oracle.base_url.is_some();
    let engine = Arc::new(PhaseOrchestrator::in_memory(config));
    tracing::info!(session_id = engine.session_id(), live, "Starting session");

    if !args.quiet {
        let mut rx = engine.events().subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if let Some(line) = describe(&envelope.event) {
                            eprintln!("{line}");
                        }
                    }
                    Err(RecvError::Lagged(n)) => eprintln!("({n} events skipped)"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    let interrupter = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if let Err(e) = interrupter.interrupt("operator").await {
                tracing::warn!(error = %e, "Interrupt failed");
            }
        }
    });

    let request = SessionRequest {
        goal: args.goal.clone(),
        constraints: args.constraints.clone(),
    };
    let outcome = engine.run(request).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", outcome.output.markdown);
    }
    Ok(())
}
