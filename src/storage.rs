//! JSON input for MDP instances and exploration policies.
//!
//! MDP format: `{"transitions": [[int, ...], ...], "rewards": [[float, ...], ...]}`
//! with one row per state and one column per action. Transition targets are
//! 0-based; `-1` means no next state.
//!
//! Policy format: `{"probabilities": [[[float, ...], ...], ...]}` indexed
//! timestep × state × action. A single timestep is applied at every timestep.

use std::fs;
use std::path::Path;
use std::time::Instant;

use serde::Deserialize;
use tracing::info;

use crate::error::Result;
use crate::types::{ExplorationPolicy, Mdp};

#[derive(Deserialize)]
struct MdpFile {
    transitions: Vec<Vec<i64>>,
    rewards: Vec<Vec<f64>>,
}

#[derive(Deserialize)]
struct PolicyFile {
    probabilities: Vec<Vec<Vec<f64>>>,
}

pub fn parse_mdp(json: &str) -> Result<Mdp> {
    let file: MdpFile = serde_json::from_str(json)?;
    Mdp::new(file.transitions, file.rewards)
}

pub fn parse_policy(json: &str) -> Result<ExplorationPolicy> {
    let file: PolicyFile = serde_json::from_str(json)?;
    ExplorationPolicy::new(file.probabilities)
}

/// Read and validate an MDP file.
pub fn load_mdp(path: &Path) -> Result<Mdp> {
    let start = Instant::now();
    let mdp = parse_mdp(&fs::read_to_string(path)?)?;
    info!(
        "Loaded MDP from {}: {} states × {} actions in {:.2} ms",
        path.display(),
        mdp.num_states(),
        mdp.num_actions(),
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(mdp)
}

pub fn load_policy(path: &Path) -> Result<ExplorationPolicy> {
    let policy = parse_policy(&fs::read_to_string(path)?)?;
    info!("Loaded exploration policy from {}", path.display());
    Ok(policy)
}
