use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use berghain_agent::config::Config;
use berghain_agent::controller::SessionController;
use berghain_agent::model::{Decision, Scenario, Session, Strategy};
use berghain_agent::scheduler::ScheduleExit;

/// Berghain admission agent - drives a decision session against the game service
#[derive(Parser, Debug)]
#[command(name = "berghain-agent", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the service base URL
    #[arg(long)]
    api: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the restored session and its feasibility
    Status,
    /// Start a new session and fetch the first candidate
    New {
        /// Scenario number (1, 2 or 3)
        #[arg(short, long)]
        scenario: Option<u8>,
    },
    /// Admit the pending candidate
    Accept,
    /// Turn the pending candidate away
    Reject,
    /// Let the service decide until the run finishes or Ctrl-C
    Auto {
        /// greedy_tightness, expected_feasible, risk_adjusted_feasible,
        /// proportional_control or lookahead_1
        #[arg(short, long)]
        strategy: Option<Strategy>,

        /// Pause between decisions
        #[arg(long)]
        delay_ms: Option<u64>,
    },
    /// Drop the session and clear its snapshot
    Reset,
}

fn print_session(controller: &SessionController) {
    let session: Session = controller.session();
    println!("phase:    {}", session.phase);
    println!("scenario: {}", session.scenario);

    let Some(run) = session.run.as_ref() else {
        return;
    };
    println!("run:      {} (game {})", run.run_id, run.game_id);
    println!("status:   {}", run.status);
    println!(
        "admitted: {}/{}  rejected: {}",
        run.admitted_count, run.capacity_required, run.rejected_count
    );

    if let Some(report) = controller.feasibility() {
        for progress in &report.progress {
            println!(
                "  {:<24} {:>5}/{:<5} deficit {}",
                progress.attribute, progress.current, progress.min_count, progress.deficit
            );
        }
        if !report.is_feasible() {
            for constraint in &report.infeasible {
                println!(
                    "  infeasible: {} needs {} with {} slots left",
                    constraint.attribute, constraint.deficit, constraint.remaining
                );
            }
        }
    }

    if let Some(pending) = session.pending.as_ref() {
        let mut traits: Vec<&str> = pending
            .attributes
            .iter()
            .filter(|(_, has)| **has)
            .map(|(name, _)| name.as_str())
            .collect();
        traits.sort_unstable();
        println!("next:     #{} [{}]", pending.index, traits.join(", "));
    }
}

async fn run_auto(
    controller: &SessionController,
    strategy: Option<Strategy>,
    delay_ms: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(strategy) = strategy {
        controller.set_strategy(strategy);
    }
    if let Some(ms) = delay_ms {
        controller.set_delay(Duration::from_millis(ms));
    }
    controller.start_auto().await?;

    let exit = tokio::select! {
        exit = controller.wait_auto() => exit,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping auto-run");
            controller.stop_auto().await
        }
    };

    match exit {
        Some(ScheduleExit::Failed(e)) => Err(e.into()),
        _ => Ok(()),
    }
}

async fn run(
    controller: &SessionController,
    config: &Config,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Status => {}
        Command::New { scenario } => {
            let scenario = match scenario {
                Some(n) => Scenario::try_from(n)?,
                None => config.default_scenario,
            };
            controller.new_session(scenario).await?;
        }
        Command::Accept => {
            controller.decide(Decision::Accept).await?;
        }
        Command::Reject => {
            controller.decide(Decision::Reject).await?;
        }
        Command::Auto { strategy, delay_ms } => run_auto(controller, strategy, delay_ms).await?,
        Command::Reset => controller.reset().await?,
    }
    print_session(controller);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();

    let mut config = match args.config.as_ref() {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env(),
    };
    if let Some(url) = args.api {
        config.api.base_url = url;
    }

    info!(base_url = %config.api.base_url, "berghain agent starting");

    let controller = SessionController::from_config(&config)?;
    controller.restore().await;

    let result = run(&controller, &config, args.command).await;
    if let Err(e) = &result {
        warn!(error = %e, "command failed");
    }
    controller.shutdown().await;
    result
}
