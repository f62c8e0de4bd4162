use anyhow::{Context, Result, ensure};
use candle_core::Tensor;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::agent::Agent;
use crate::emulator::Emulator;
use crate::env::Env;
use crate::memory::PrioritizedReplay;
use crate::viewer::Viewer;

// =============================================================================
// Training Schedule
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Total environment steps.
    pub t_max: u64,
    pub learn_start: u64,
    pub replay_frequency: u64,
    pub target_update: u64,
    /// Rewards are clipped to ±this; 0 disables clipping.
    pub reward_clip: f64,
    pub evaluation_interval: u64,
    pub evaluation_episodes: usize,
    /// Validation states used to track average Q.
    pub evaluation_size: usize,
    pub evaluation_epsilon: f64,
    /// Steps between `checkpoint.safetensors` writes; 0 disables them.
    pub checkpoint_interval: u64,
    pub log_interval: u64,
    pub results_dir: PathBuf,
    /// Replay snapshot written when training ends.
    pub memory: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            t_max: 50_000_000,
            learn_start: 80_000,
            replay_frequency: 4,
            target_update: 8_000,
            reward_clip: 1.0,
            evaluation_interval: 100_000,
            evaluation_episodes: 10,
            evaluation_size: 500,
            evaluation_epsilon: 0.001,
            checkpoint_interval: 0,
            log_interval: 25_000,
            results_dir: PathBuf::from("results"),
            memory: None,
        }
    }
}

// =============================================================================
// Evaluation
// =============================================================================

/// Fixed states gathered by random play, for tracking average Q.
pub struct ValidationStates {
    states: Vec<Tensor>,
}

impl ValidationStates {
    pub fn collect<E: Emulator>(env: &mut Env<E>, size: usize, seed: u64) -> Result<Self> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut states = Vec::with_capacity(size);
        let mut state = env.reset()?;
        while states.len() < size {
            let action = rng.random_range(0..env.action_space());
            let result = env.step(action)?;
            states.push(state);
            state = if result.done { env.reset()? } else { result.state };
        }
        Ok(Self { states })
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tensor> {
        self.states.iter()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalStats {
    pub step: u64,
    pub avg_reward: f64,
    pub avg_q: f64,
    pub rewards: Vec<f64>,
}

/// Plays `episodes` full episodes ε-greedily with the noisy layers at their
/// means, then averages the greedy Q over `validation`.
pub fn evaluate<E: Emulator>(
    agent: &mut Agent,
    env: &mut Env<E>,
    validation: &ValidationStates,
    episodes: usize,
    epsilon: f64,
    mut viewer: Option<&mut Viewer>,
) -> Result<EvalStats> {
    agent.eval();
    env.eval();

    let mut rewards = Vec::with_capacity(episodes);
    'episodes: for episode in 0..episodes {
        let mut state = env.reset()?;
        let mut reward_sum = 0.0;
        loop {
            let action = agent.act_e_greedy(&state, epsilon)?;
            let result = env.step(action)?;
            reward_sum += result.reward;
            state = result.state;
            if let Some(viewer) = viewer.as_deref_mut() {
                if !viewer.show(env.screen())? {
                    warn!("viewer closed, stopping evaluation");
                    rewards.push(reward_sum);
                    break 'episodes;
                }
            }
            if result.done {
                break;
            }
        }
        info!(episode, reward = reward_sum, "evaluation episode");
        rewards.push(reward_sum);
    }

    let mut q_sum = 0.0f64;
    for state in validation.iter() {
        q_sum += agent.evaluate_q(state)? as f64;
    }

    let mean = |sum: f64, n: usize| if n == 0 { 0.0 } else { sum / n as f64 };
    Ok(EvalStats {
        step: 0,
        avg_reward: mean(rewards.iter().sum(), rewards.len()),
        avg_q: mean(q_sum, validation.len()),
        rewards,
    })
}

// =============================================================================
// Training Loop
// =============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub evaluations: Vec<EvalStats>,
    pub best_avg_reward: Option<f64>,
}

impl Metrics {
    fn record<P: AsRef<Path>>(&mut self, stats: EvalStats, dir: P) -> Result<bool> {
        let improved = self.best_avg_reward.is_none_or(|best| stats.avg_reward > best);
        if improved {
            self.best_avg_reward = Some(stats.avg_reward);
        }
        self.evaluations.push(stats);
        self.save(dir)?;
        Ok(improved)
    }

    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join("metrics.json");
        let file = File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

/// Runs the full training schedule: act, store, learn, evaluate and sync the
/// target network until `t_max` steps have been taken.
pub fn run<E: Emulator>(
    agent: &mut Agent,
    env: &mut Env<E>,
    eval_env: &mut Env<E>,
    memory: &mut PrioritizedReplay,
    validation: &ValidationStates,
    config: &TrainConfig,
) -> Result<Metrics> {
    ensure!(
        config.replay_frequency > 0 && config.target_update > 0,
        "replay_frequency and target_update must be positive"
    );
    let mut metrics = Metrics::default();
    let beta_increase = if config.t_max > config.learn_start {
        (1.0 - memory.priority_weight) / (config.t_max - config.learn_start) as f64
    } else {
        0.0
    };

    agent.train();
    env.train();
    let mut state = env.reset()?;
    let mut episode = 0u64;
    let mut episode_reward = 0.0f64;
    let mut last_loss = None;

    for t in 1..=config.t_max {
        if (t - 1) % config.replay_frequency == 0 {
            agent.reset_noise()?;
        }
        let action = agent.act(&state)?;
        let result = env.step(action)?;
        episode_reward += result.reward;
        let reward = if config.reward_clip > 0.0 {
            result.reward.clamp(-config.reward_clip, config.reward_clip)
        } else {
            result.reward
        };
        memory.append(&state, action, reward as f32, result.done)?;

        if config.log_interval > 0 && t % config.log_interval == 0 {
            info!(step = t, episode, loss = ?last_loss, beta = memory.priority_weight, "progress");
        }

        if t >= config.learn_start {
            memory.priority_weight = (memory.priority_weight + beta_increase).min(1.0);

            // Early steps may not have a complete n-step window yet.
            if t % config.replay_frequency == 0 && memory.is_sampleable() {
                last_loss = Some(agent.learn(memory)?);
            }

            if config.evaluation_interval > 0 && t % config.evaluation_interval == 0 {
                let mut stats = evaluate(
                    agent,
                    eval_env,
                    validation,
                    config.evaluation_episodes,
                    config.evaluation_epsilon,
                    None,
                )?;
                agent.train();
                stats.step = t;
                info!(
                    step = t,
                    avg_reward = stats.avg_reward,
                    avg_q = stats.avg_q,
                    "evaluation"
                );
                if metrics.record(stats, &config.results_dir)? {
                    agent.save(&config.results_dir, "model.safetensors")?;
                }
            }

            if t % config.target_update == 0 {
                agent.update_target_net()?;
            }
        }

        if config.checkpoint_interval > 0 && t % config.checkpoint_interval == 0 {
            agent.save(&config.results_dir, "checkpoint.safetensors")?;
        }

        state = if result.done {
            info!(episode, step = t, reward = episode_reward, "episode finished");
            episode += 1;
            episode_reward = 0.0;
            env.reset()?
        } else {
            result.state
        };
    }

    if let Some(path) = &config.memory {
        memory
            .save(path)
            .with_context(|| format!("Failed to save replay memory to {}", path.display()))?;
        info!(path = %path.display(), transitions = memory.len(), "replay memory saved");
    }
    metrics.save(&config.results_dir)?;
    Ok(metrics)
}
