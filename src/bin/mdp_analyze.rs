//! mdp-analyze: value iteration, minimum k and effective horizon for one MDP.
//!
//! Prints a JSON report to stdout; progress goes to the log (stderr).

use std::path::PathBuf;
use std::process;

use clap::Parser;
use serde::Serialize;
use tracing::{error, info};

use effective_horizon::effective_horizon::compute_effective_horizon;
use effective_horizon::env_config::{init_rayon_threads, init_tracing};
use effective_horizon::min_k::{compute_min_k, MinKOptions};
use effective_horizon::progress::LogProgress;
use effective_horizon::simulation::{simulate_exploration_returns, RolloutSummary};
use effective_horizon::storage::{load_mdp, load_policy};
use effective_horizon::types::ValueSummary;
use effective_horizon::value_iteration::value_iteration;
use effective_horizon::{EffectiveHorizonResult, Result, SolverConfig};

#[derive(Parser)]
#[command(name = "mdp-analyze")]
#[command(about = "Minimum lookahead depth and effective horizon of a deterministic MDP")]
struct Args {
    /// MDP file: {"transitions": [[int]], "rewards": [[float]]}
    #[arg(long)]
    mdp: PathBuf,

    /// Number of decision steps
    #[arg(long)]
    horizon: usize,

    /// Exploration policy file: {"probabilities": [[[float]]]} (uniform if omitted)
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Seed the minimum-k search with rewards instead of exploration Q-values
    #[arg(long)]
    start_with_rewards: bool,

    /// Stop after the minimum-k search
    #[arg(long)]
    skip_effective_horizon: bool,

    /// Run every sweep on one thread with a single shard
    #[arg(long)]
    sequential: bool,

    /// Monte-Carlo rollouts of the exploration policy (0 = none)
    #[arg(long, default_value_t = 0)]
    rollouts: usize,

    /// Rollout seed
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Serialize)]
struct AnalysisReport {
    num_states: usize,
    num_actions: usize,
    horizon: usize,
    values: ValueSummary,
    min_k: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    effective_horizon: Option<EffectiveHorizonResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rollouts: Option<RolloutSummary>,
}

fn run(args: &Args) -> Result<AnalysisReport> {
    let mdp = load_mdp(&args.mdp)?;
    let policy = args.policy.as_deref().map(load_policy).transpose()?;
    let config = if args.sequential {
        SolverConfig::sequential()
    } else {
        SolverConfig::from_env()
    };
    info!(
        "Config: parallel={} shards={} precision={}",
        config.parallel, config.num_shards, config.reward_precision
    );
    let progress = LogProgress::new();

    let vi = value_iteration(&mdp, args.horizon, policy.as_ref(), &config, &progress)?;
    let values = vi.summary()?;
    info!(
        "Returns from initial state: optimal {:.4}, exploration {:.4}, worst {:.4}",
        values.optimal_return, values.exploration_return, values.worst_return
    );

    let min_k = compute_min_k(
        &mdp,
        &vi,
        MinKOptions {
            start_with_rewards: args.start_with_rewards,
        },
        &config,
        &progress,
    )?;

    let effective_horizon = if args.skip_effective_horizon {
        None
    } else {
        Some(compute_effective_horizon(&mdp, &vi, &config, &progress)?)
    };

    let rollouts = if args.rollouts > 0 {
        Some(simulate_exploration_returns(
            &mdp,
            args.horizon,
            policy.as_ref(),
            args.rollouts,
            args.seed,
        )?)
    } else {
        None
    };

    Ok(AnalysisReport {
        num_states: mdp.num_states(),
        num_actions: mdp.num_actions(),
        horizon: args.horizon,
        values,
        min_k,
        effective_horizon,
        rollouts,
    })
}

fn main() {
    init_tracing();
    let args = Args::parse();
    let _threads = init_rayon_threads();

    match run(&args) {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                error!("Failed to serialize report: {e}");
                process::exit(1);
            }
        },
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    }
}
