use anyhow::{Context, Result, ensure};
use candle_core::{Device, Tensor};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

use crate::env::{FRAME_LEN, FRAME_SIZE};

// =============================================================================
// Replay Hyperparameters
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub capacity: usize,
    pub history_length: usize,
    pub multi_step: usize,
    pub discount: f64,
    /// α: how strongly priorities skew sampling.
    pub priority_exponent: f64,
    /// β at the start of training; annealed toward 1 by the caller.
    pub priority_weight: f64,
    pub seed: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000_000,
            history_length: 4,
            multi_step: 3,
            discount: 0.99,
            priority_exponent: 0.5,
            priority_weight: 0.4,
            seed: 123,
        }
    }
}

// =============================================================================
// Replay Contract
// =============================================================================

/// Sampled batch. Tensors live on the memory's device.
pub struct ReplayBatch {
    pub indices: Vec<usize>,
    /// `(batch, history, 84, 84)`
    pub states: Tensor,
    /// `(batch,)` u32
    pub actions: Tensor,
    /// `(batch,)` n-step discounted returns
    pub returns: Tensor,
    pub next_states: Tensor,
    /// `(batch,)` 1.0 when no terminal occurred within n steps
    pub nonterminals: Tensor,
    /// `(batch,)` importance-sampling weights in (0, 1]
    pub weights: Tensor,
}

pub trait ReplayMemory {
    fn sample(&mut self, batch_size: usize) -> Result<ReplayBatch>;

    fn update_priorities(&mut self, indices: &[usize], priorities: &[f32]) -> Result<()>;
}

// =============================================================================
// Sum Tree
// =============================================================================

/// Binary tree whose internal nodes hold the sum of their children, for
/// proportional sampling over `size` leaves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SumTree {
    size: usize,
    nodes: Vec<f64>,
    max: f64,
}

impl SumTree {
    pub fn new(size: usize) -> Self {
        let leaves = size.next_power_of_two();
        Self {
            size,
            nodes: vec![0.0; 2 * leaves],
            max: 1.0,
        }
    }

    fn leaves(&self) -> usize {
        self.nodes.len() / 2
    }

    pub fn update(&mut self, index: usize, value: f64) {
        debug_assert!(index < self.size);
        let mut node = self.leaves() + index;
        self.nodes[node] = value;
        node /= 2;
        while node > 0 {
            self.nodes[node] = self.nodes[2 * node] + self.nodes[2 * node + 1];
            node /= 2;
        }
        self.max = self.max.max(value);
    }

    pub fn get(&self, index: usize) -> f64 {
        self.nodes[self.leaves() + index]
    }

    pub fn total(&self) -> f64 {
        self.nodes[1]
    }

    /// Largest value ever stored, at least 1.
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Leaf whose cumulative range contains `value`. Never descends into an
    /// empty subtree, so the returned leaf has positive priority whenever
    /// `total() > 0`.
    pub fn find(&self, value: f64) -> (usize, f64) {
        let leaves = self.leaves();
        let mut node = 1;
        let mut value = value;
        while node < leaves {
            let left = 2 * node;
            if value < self.nodes[left] || self.nodes[left + 1] <= 0.0 {
                node = left;
            } else {
                value -= self.nodes[left];
                node = left + 1;
            }
        }
        (node - leaves, self.nodes[node])
    }
}

// =============================================================================
// Prioritized n-step Replay
// =============================================================================

/// One time step: the newest frame of the state, what was done from it and
/// what came back.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Slot {
    /// Absolute append counter, detects overwritten neighbours.
    step: u64,
    /// Position within the episode; 0 for the first state.
    timestep: u32,
    frame: Vec<u8>,
    action: u32,
    reward: f32,
    terminal: bool,
}

struct Transition {
    state: Vec<f32>,
    action: u32,
    ret: f32,
    next_state: Vec<f32>,
    nonterminal: bool,
}

fn default_device() -> Device {
    Device::Cpu
}

fn default_rng() -> SmallRng {
    SmallRng::seed_from_u64(0)
}

/// Ring buffer of time steps with proportional prioritized sampling.
///
/// Frames are stored once per step as `u8` and stacked on sampling. A slot is
/// sampleable only after the `multi_step` steps following it are written.
#[derive(Serialize, Deserialize)]
pub struct PrioritizedReplay {
    config: MemoryConfig,
    slots: Vec<Option<Slot>>,
    tree: SumTree,
    index: usize,
    steps: u64,
    timestep: u32,
    pub priority_weight: f64,
    #[serde(skip, default = "default_device")]
    device: Device,
    #[serde(skip, default = "default_rng")]
    rng: SmallRng,
}

impl PrioritizedReplay {
    pub fn new(config: MemoryConfig, device: &Device) -> Result<Self> {
        ensure!(
            config.capacity > config.multi_step + config.history_length,
            "replay capacity {} too small for {}-step returns over {} frames",
            config.capacity,
            config.multi_step,
            config.history_length
        );
        Ok(Self {
            slots: vec![None; config.capacity],
            tree: SumTree::new(config.capacity),
            index: 0,
            steps: 0,
            timestep: 0,
            priority_weight: config.priority_weight,
            device: device.clone(),
            rng: SmallRng::seed_from_u64(config.seed),
            config,
        })
    }

    pub fn len(&self) -> usize {
        (self.steps as usize).min(self.config.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.steps == 0
    }

    /// True once at least one transition has a complete n-step window.
    pub fn is_sampleable(&self) -> bool {
        self.tree.total() > 0.0
    }

    /// Stores the step taken from `state` (`(history, 84, 84)`); only its
    /// newest frame is kept.
    pub fn append(
        &mut self,
        state: &Tensor,
        action: usize,
        reward: f32,
        terminal: bool,
    ) -> Result<()> {
        let history = state.dim(0)?;
        let frame: Vec<u8> = state
            .get(history - 1)?
            .flatten_all()?
            .to_vec1::<f32>()?
            .into_iter()
            .map(|v| (v * 255.0).round().clamp(0.0, 255.0) as u8)
            .collect();
        ensure!(frame.len() == FRAME_LEN, "frame has {} pixels", frame.len());

        let capacity = self.config.capacity;
        let n = self.config.multi_step;
        self.slots[self.index] = Some(Slot {
            step: self.steps,
            timestep: self.timestep,
            frame,
            action: action as u32,
            reward,
            terminal,
        });
        self.tree.update(self.index, 0.0);

        // The step n slots back now has its full n-step window.
        if self.steps >= n as u64 {
            let start = (self.index + capacity - n) % capacity;
            let expected = self.steps - n as u64;
            if self.slots[start].as_ref().is_some_and(|s| s.step == expected) {
                let max = self.tree.max();
                self.tree.update(start, max);
            }
        }

        self.index = (self.index + 1) % capacity;
        self.steps += 1;
        self.timestep = if terminal { 0 } else { self.timestep + 1 };
        Ok(())
    }

    fn slot(&self, index: usize) -> Result<&Slot> {
        self.slots[index]
            .as_ref()
            .with_context(|| format!("replay slot {index} is empty"))
    }

    /// Stacked frames ending at `index`, blanking frames from earlier
    /// episodes or already overwritten.
    fn stack_frames(&self, index: usize) -> Result<Vec<f32>> {
        let capacity = self.config.capacity;
        let history = self.config.history_length;
        let newest = self.slot(index)?;
        let mut frames = Vec::with_capacity(history * FRAME_LEN);
        for k in (0..history).rev() {
            let pos = (index + capacity - k) % capacity;
            let k64 = k as u64;
            let frame = self.slots[pos].as_ref().filter(|s| {
                k as u32 <= newest.timestep && newest.step >= k64 && s.step == newest.step - k64
            });
            match frame {
                Some(s) => frames.extend(s.frame.iter().map(|&p| p as f32 / 255.0)),
                None => frames.extend(std::iter::repeat_n(0.0, FRAME_LEN)),
            }
        }
        Ok(frames)
    }

    fn transition(&self, index: usize) -> Result<Transition> {
        let capacity = self.config.capacity;
        let n = self.config.multi_step;
        let first = self.slot(index)?;

        let mut ret = 0.0f64;
        let mut discount = 1.0f64;
        let mut nonterminal = true;
        for k in 0..n {
            let slot = self.slot((index + k) % capacity)?;
            ensure!(
                slot.step == first.step + k as u64,
                "transition at slot {index} overlaps the write head"
            );
            ret += discount * slot.reward as f64;
            discount *= self.config.discount;
            if slot.terminal {
                nonterminal = false;
                break;
            }
        }

        let next_state = if nonterminal {
            self.stack_frames((index + n) % capacity)?
        } else {
            vec![0.0; self.config.history_length * FRAME_LEN]
        };

        Ok(Transition {
            state: self.stack_frames(index)?,
            action: first.action,
            ret: ret as f32,
            next_state,
            nonterminal,
        })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create replay file {}", path.display()))?;
        let writer = std::io::BufWriter::new(file);
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open replay file {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        let mut memory: Self = bincode::deserialize_from(reader)?;
        memory.device = device.clone();
        memory.rng = SmallRng::seed_from_u64(memory.config.seed ^ memory.steps);
        Ok(memory)
    }
}

impl ReplayMemory for PrioritizedReplay {
    fn sample(&mut self, batch_size: usize) -> Result<ReplayBatch> {
        let total = self.tree.total();
        ensure!(total > 0.0, "replay memory has no sampleable transitions");
        let segment = total / batch_size as f64;
        let history = self.config.history_length;

        let mut indices = Vec::with_capacity(batch_size);
        let mut probs = Vec::with_capacity(batch_size);
        let mut states = Vec::with_capacity(batch_size * history * FRAME_LEN);
        let mut actions = Vec::with_capacity(batch_size);
        let mut returns = Vec::with_capacity(batch_size);
        let mut next_states = Vec::with_capacity(batch_size * history * FRAME_LEN);
        let mut nonterminals = Vec::with_capacity(batch_size);

        // Stratified: one draw from each equal-mass segment.
        for i in 0..batch_size {
            let value = (i as f64 + self.rng.random::<f64>()) * segment;
            let (index, priority) = self.tree.find(value.min(total));
            let t = self.transition(index)?;
            indices.push(index);
            probs.push(priority / total);
            states.extend_from_slice(&t.state);
            actions.push(t.action);
            returns.push(t.ret);
            next_states.extend_from_slice(&t.next_state);
            nonterminals.push(if t.nonterminal { 1.0f32 } else { 0.0 });
        }

        let population = self.len() as f64;
        let raw: Vec<f64> = probs
            .iter()
            .map(|p| (population * p).powf(-self.priority_weight))
            .collect();
        let max_weight = raw.iter().copied().fold(f64::MIN_POSITIVE, f64::max);
        let weights: Vec<f32> = raw.iter().map(|w| (w / max_weight) as f32).collect();

        let shape = (batch_size, history, FRAME_SIZE, FRAME_SIZE);
        Ok(ReplayBatch {
            indices,
            states: Tensor::from_vec(states, shape, &self.device)?,
            actions: Tensor::from_vec(actions, batch_size, &self.device)?,
            returns: Tensor::from_vec(returns, batch_size, &self.device)?,
            next_states: Tensor::from_vec(next_states, shape, &self.device)?,
            nonterminals: Tensor::from_vec(nonterminals, batch_size, &self.device)?,
            weights: Tensor::from_vec(weights, batch_size, &self.device)?,
        })
    }

    fn update_priorities(&mut self, indices: &[usize], priorities: &[f32]) -> Result<()> {
        ensure!(
            indices.len() == priorities.len(),
            "{} indices but {} priorities",
            indices.len(),
            priorities.len()
        );
        for (&index, &priority) in indices.iter().zip(priorities) {
            self.tree
                .update(index, (priority as f64).powf(self.config.priority_exponent));
        }
        Ok(())
    }
}
