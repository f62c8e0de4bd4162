use anyhow::{Context, Result, anyhow};
use candle_core::{D, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::distribution::{PROB_FLOOR, Projection};
use crate::memory::ReplayMemory;
use crate::model::{DistributionalNet, NetConfig, RainbowNet};

// =============================================================================
// Agent Hyperparameters
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub atoms: usize,
    pub v_min: f64,
    pub v_max: f64,
    pub batch_size: usize,
    pub multi_step: usize,
    pub discount: f64,
    pub learning_rate: f64,
    pub adam_eps: f64,
    /// Online weights to start from, if the file exists.
    pub model: Option<PathBuf>,
    pub hidden_size: usize,
    pub noisy_std: f64,
    pub history_length: usize,
    pub seed: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            atoms: 51,
            v_min: -10.0,
            v_max: 10.0,
            batch_size: 32,
            multi_step: 3,
            discount: 0.99,
            learning_rate: 0.0000625,
            adam_eps: 1.5e-4,
            model: None,
            hidden_size: 512,
            noisy_std: 0.1,
            history_length: 4,
            seed: 123,
        }
    }
}

impl AgentConfig {
    pub fn net_config(&self) -> NetConfig {
        NetConfig {
            history_length: self.history_length,
            hidden_size: self.hidden_size,
            noisy_std: self.noisy_std,
            atoms: self.atoms,
            v_min: self.v_min,
            v_max: self.v_max,
        }
    }
}

#[cfg(target_os = "macos")]
fn with_autorelease_pool<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    objc::rc::autoreleasepool(f)
}

#[cfg(not(target_os = "macos"))]
fn with_autorelease_pool<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    f()
}

/// Picks `probs[i, actions[i], :]` for every sample: `(batch, actions, atoms)`
/// -> `(batch, atoms)`.
fn gather_actions(probs: &Tensor, actions: &Tensor) -> Result<Tensor> {
    let (batch, _, atoms) = probs.dims3()?;
    let index = actions
        .reshape((batch, 1, 1))?
        .broadcast_as((batch, 1, atoms))?
        .contiguous()?;
    Ok(probs.gather(&index, 1)?.squeeze(1)?)
}

// =============================================================================
// Rainbow Agent
// =============================================================================

/// Distributional double-Q agent with noisy exploration.
pub struct Agent<N: DistributionalNet = RainbowNet> {
    online_net: N,
    target_net: N,
    optimizer: AdamW,
    projection: Projection,
    action_space: usize,
    batch_size: usize,
    rng: SmallRng,
}

impl Agent<RainbowNet> {
    pub fn new(config: &AgentConfig, action_space: usize, device: &Device) -> Result<Self> {
        let net_config = config.net_config();
        let mut online_net = RainbowNet::new(&net_config, action_space, device)?;
        if let Some(path) = &config.model {
            if path.is_file() {
                online_net
                    .varmap_mut()
                    .load(path)
                    .with_context(|| format!("Failed to load model from {}", path.display()))?;
                info!(path = %path.display(), "loaded model");
            } else {
                warn!(path = %path.display(), "model file not found, starting from scratch");
            }
        }
        let target_net = RainbowNet::new(&net_config, action_space, device)?.frozen();

        let mut agent = Self::from_nets(online_net, target_net, config, action_space, device)?;
        agent.update_target_net()?;
        Ok(agent)
    }
}

impl<N: DistributionalNet> Agent<N> {
    /// Wraps replicas as given. The target is not synced from the online net.
    pub fn from_nets(
        online_net: N,
        target_net: N,
        config: &AgentConfig,
        action_space: usize,
        device: &Device,
    ) -> Result<Self> {
        let params = ParamsAdamW {
            lr: config.learning_rate,
            eps: config.adam_eps,
            weight_decay: 0.0,
            ..Default::default()
        };
        let optimizer = AdamW::new(online_net.varmap().all_vars(), params)?;
        let projection = Projection::new(
            config.v_min,
            config.v_max,
            config.atoms,
            config.discount,
            config.multi_step,
            device,
        )?;

        Ok(Self {
            online_net,
            target_net,
            optimizer,
            projection,
            action_space,
            batch_size: config.batch_size,
            rng: SmallRng::seed_from_u64(config.seed),
        })
    }

    pub fn action_space(&self) -> usize {
        self.action_space
    }

    pub fn online_net(&self) -> &N {
        &self.online_net
    }

    pub fn target_net(&self) -> &N {
        &self.target_net
    }

    /// Resamples noise of the online network only.
    pub fn reset_noise(&mut self) -> Result<()> {
        self.online_net.reset_noise()
    }

    /// Greedy action on a single `(history, 84, 84)` state.
    pub fn act(&self, state: &Tensor) -> Result<usize> {
        self.online_net.act(state)
    }

    pub fn act_e_greedy(&mut self, state: &Tensor, epsilon: f64) -> Result<usize> {
        if self.rng.random::<f64>() < epsilon {
            Ok(self.rng.random_range(0..self.action_space))
        } else {
            self.act(state)
        }
    }

    /// Highest expected return over actions for a single state.
    pub fn evaluate_q(&self, state: &Tensor) -> Result<f32> {
        let q = self.online_net.expected_values(&state.unsqueeze(0)?)?;
        Ok(q.max(D::Minus1)?.squeeze(0)?.to_scalar::<f32>()?)
    }

    /// One optimisation step on a prioritized batch. Returns the
    /// importance-weighted loss.
    pub fn learn<M: ReplayMemory>(&mut self, memory: &mut M) -> Result<f32> {
        with_autorelease_pool(|| {
            let batch = memory.sample(self.batch_size)?;

            // p(s_t, a_t; θ_online)
            self.online_net.reset_noise()?;
            let ps = self.online_net.forward(&batch.states)?;
            let ps_a = gather_actions(&ps, &batch.actions)?;

            // Double-Q: online picks a*, target evaluates it
            self.online_net.reset_noise()?;
            let next_actions = self
                .online_net
                .expected_values(&batch.next_states)?
                .detach()
                .argmax(D::Minus1)?;
            self.target_net.reset_noise()?;
            let pns = self.target_net.forward(&batch.next_states)?;
            let pns_a = gather_actions(&pns, &next_actions)?;

            let m = self
                .projection
                .project(&pns_a, &batch.returns, &batch.nonterminals)?;

            // Cross-entropy -Σ m log p(s_t, a_t)
            let loss = m.mul(&ps_a.maximum(PROB_FLOOR)?.log()?)?.sum(1)?.neg()?;
            let weighted = batch.weights.mul(&loss)?.mean_all()?;
            self.optimizer.backward_step(&weighted)?;

            let priorities = loss.detach().to_vec1::<f32>()?;
            memory.update_priorities(&batch.indices, &priorities)?;

            let weighted = weighted.to_scalar::<f32>()?;
            debug!(loss = weighted, "learn step");
            Ok(weighted)
        })
    }

    /// Copy online weights → target (hard copy)
    pub fn update_target_net(&mut self) -> Result<()> {
        let online_data = self
            .online_net
            .varmap()
            .data()
            .lock()
            .map_err(|_| anyhow!("Failed to lock online varmap for target update"))?;
        let mut target_data = self
            .target_net
            .varmap()
            .data()
            .lock()
            .map_err(|_| anyhow!("Failed to lock target varmap for target update"))?;
        for (name, target_v) in target_data.iter_mut() {
            let online_v = online_data.get(name).ok_or_else(|| {
                anyhow!("Missing var {name} in online varmap during target update")
            })?;
            target_v.set(&online_v.as_tensor().detach())?;
        }
        Ok(())
    }

    pub fn train(&mut self) {
        self.online_net.set_training(true);
    }

    /// Noisy layers fall back to their mean weights.
    pub fn eval(&mut self) {
        self.online_net.set_training(false);
    }

    /// Writes online weights to `dir/name` as safetensors.
    pub fn save<P: AsRef<Path>>(&self, dir: P, name: &str) -> Result<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(name);
        self.online_net
            .varmap()
            .save(&path)
            .with_context(|| format!("Failed to save model to {}", path.display()))?;
        info!(path = %path.display(), "model saved");
        Ok(path)
    }
}
