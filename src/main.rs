// =============================================================================
// Rainbow distributional agent for NES games
// =============================================================================
// Build & Run:
//   cargo build --release
//   cargo run --release -- train --rom kung_fu.nes --t-max 10000000
//   cargo run --release -- eval  --rom kung_fu.nes --model results/model.safetensors --render

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

use rainbow_nes_rl::{
    Agent, AgentConfig, Env, EnvConfig, MemoryConfig, NES_HEIGHT, NES_WIDTH, NesConfig,
    NesEmulator, PrioritizedReplay, TrainConfig, ValidationStates, Viewer, evaluate, run,
    select_device,
};

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "rainbow-nes-rl", about = "Rainbow distributional RL agent for NES games")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the agent
    Train(TrainArgs),
    /// Evaluate a trained agent
    Eval(EvalArgs),
}

fn parse_addr(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid RAM address {s}: {e}"))
}

#[derive(Args)]
struct CommonArgs {
    #[arg(long)]
    rom: PathBuf,
    #[arg(long, default_value_t = 123)]
    seed: u64,
    /// Frame cap per episode
    #[arg(long, default_value_t = 108_000)]
    max_episode_length: u32,
    #[arg(long, default_value_t = 4)]
    history_length: usize,
    #[arg(long, default_value_t = 51)]
    atoms: usize,
    #[arg(long, default_value_t = -10.0, allow_hyphen_values = true)]
    v_min: f64,
    #[arg(long, default_value_t = 10.0)]
    v_max: f64,
    #[arg(long, default_value_t = 512)]
    hidden_size: usize,
    #[arg(long, default_value_t = 0.1)]
    noisy_std: f64,
    /// Pretrained online weights (safetensors)
    #[arg(long)]
    model: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    cuda: bool,
    /// RAM address holding the lives counter
    #[arg(long, value_parser = parse_addr, default_value = "0x005C")]
    lives_addr: u16,
    #[arg(long, default_value = "results")]
    results_dir: PathBuf,
}

#[derive(Args)]
struct TrainArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long, default_value_t = 32)]
    batch_size: usize,
    #[arg(long, default_value_t = 3)]
    multi_step: usize,
    #[arg(long, default_value_t = 0.99)]
    discount: f64,
    #[arg(long, default_value_t = 0.0000625)]
    lr: f64,
    #[arg(long, default_value_t = 1.5e-4)]
    adam_eps: f64,
    #[arg(long, default_value_t = 1_000_000)]
    memory_capacity: usize,
    #[arg(long, default_value_t = 0.5)]
    priority_exponent: f64,
    #[arg(long, default_value_t = 0.4)]
    priority_weight: f64,
    #[arg(long, default_value_t = 50_000_000)]
    t_max: u64,
    #[arg(long, default_value_t = 80_000)]
    learn_start: u64,
    #[arg(long, default_value_t = 4)]
    replay_frequency: u64,
    #[arg(long, default_value_t = 8_000)]
    target_update: u64,
    #[arg(long, default_value_t = 1.0)]
    reward_clip: f64,
    #[arg(long, default_value_t = 100_000)]
    evaluation_interval: u64,
    #[arg(long, default_value_t = 10)]
    evaluation_episodes: usize,
    #[arg(long, default_value_t = 500)]
    evaluation_size: usize,
    #[arg(long, default_value_t = 0)]
    checkpoint_interval: u64,
    #[arg(long, default_value_t = 25_000)]
    log_interval: u64,
    /// Replay snapshot: loaded if present, written when training ends
    #[arg(long)]
    memory: Option<PathBuf>,
}

#[derive(Args)]
struct EvalArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long, default_value_t = 10)]
    evaluation_episodes: usize,
    #[arg(long, default_value_t = 500)]
    evaluation_size: usize,
    #[arg(long, default_value_t = 0.001)]
    epsilon: f64,
    #[arg(long, default_value_t = false)]
    render: bool,
}

// =============================================================================
// Run Configuration
// =============================================================================

#[derive(Serialize, Deserialize)]
struct RunConfig {
    env: EnvConfig,
    agent: AgentConfig,
    memory: MemoryConfig,
    train: TrainConfig,
}

impl CommonArgs {
    fn env_config(&self) -> EnvConfig {
        EnvConfig {
            seed: self.seed,
            max_episode_length: self.max_episode_length,
            history_length: self.history_length,
        }
    }

    fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            atoms: self.atoms,
            v_min: self.v_min,
            v_max: self.v_max,
            model: self.model.clone(),
            hidden_size: self.hidden_size,
            noisy_std: self.noisy_std,
            history_length: self.history_length,
            seed: self.seed,
            ..Default::default()
        }
    }

    fn make_env(&self, device: &Device) -> Result<Env<NesEmulator>> {
        let emulator = NesEmulator::new(NesConfig {
            lives_addr: self.lives_addr,
            ..Default::default()
        });
        Env::new(emulator, &self.rom, &self.env_config(), device)
    }
}

impl TrainArgs {
    fn run_config(&self) -> RunConfig {
        let common = &self.common;
        RunConfig {
            env: common.env_config(),
            agent: AgentConfig {
                batch_size: self.batch_size,
                multi_step: self.multi_step,
                discount: self.discount,
                learning_rate: self.lr,
                adam_eps: self.adam_eps,
                ..common.agent_config()
            },
            memory: MemoryConfig {
                capacity: self.memory_capacity,
                history_length: common.history_length,
                multi_step: self.multi_step,
                discount: self.discount,
                priority_exponent: self.priority_exponent,
                priority_weight: self.priority_weight,
                seed: common.seed,
            },
            train: TrainConfig {
                t_max: self.t_max,
                learn_start: self.learn_start,
                replay_frequency: self.replay_frequency,
                target_update: self.target_update,
                reward_clip: self.reward_clip,
                evaluation_interval: self.evaluation_interval,
                evaluation_episodes: self.evaluation_episodes,
                evaluation_size: self.evaluation_size,
                checkpoint_interval: self.checkpoint_interval,
                log_interval: self.log_interval,
                results_dir: common.results_dir.clone(),
                memory: self.memory.clone(),
                ..Default::default()
            },
        }
    }
}

fn write_config(config: &RunConfig, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let file = File::create(dir.join("config.json"))?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(writer, config)?;
    Ok(())
}

// =============================================================================
// Commands
// =============================================================================

fn train(args: &TrainArgs) -> Result<()> {
    let device = select_device(args.common.cuda);
    info!(?device, "device selected");
    let config = args.run_config();
    write_config(&config, &args.common.results_dir)?;

    let mut env = args.common.make_env(&device)?;
    let mut eval_env = args.common.make_env(&device)?;
    let mut agent = Agent::new(&config.agent, env.action_space(), &device)?;

    let mut memory = match &args.memory {
        Some(path) if path.is_file() => {
            let memory = PrioritizedReplay::load(path, &device)?;
            info!(path = %path.display(), transitions = memory.len(), "replay memory loaded");
            memory
        }
        _ => PrioritizedReplay::new(config.memory.clone(), &device)?,
    };

    let validation =
        ValidationStates::collect(&mut env, config.train.evaluation_size, args.common.seed)?;
    info!(states = validation.len(), "validation states collected");

    let metrics = run(
        &mut agent,
        &mut env,
        &mut eval_env,
        &mut memory,
        &validation,
        &config.train,
    )?;
    info!(best_avg_reward = ?metrics.best_avg_reward, "training finished");
    Ok(())
}

fn eval(args: &EvalArgs) -> Result<()> {
    let device = select_device(args.common.cuda);
    info!(?device, "device selected");

    let mut env = args.common.make_env(&device)?;
    let mut agent = Agent::new(&args.common.agent_config(), env.action_space(), &device)?;
    env.eval();
    let validation =
        ValidationStates::collect(&mut env, args.evaluation_size, args.common.seed)?;

    let mut viewer = if args.render {
        Some(Viewer::new("Rainbow NES - Evaluation", NES_WIDTH, NES_HEIGHT)?)
    } else {
        None
    };
    let stats = evaluate(
        &mut agent,
        &mut env,
        &validation,
        args.evaluation_episodes,
        args.epsilon,
        viewer.as_mut(),
    )?;
    info!(
        avg_reward = stats.avg_reward,
        avg_q = stats.avg_q,
        episodes = stats.rewards.len(),
        "evaluation finished"
    );
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Train(args) => train(args),
        Commands::Eval(args) => eval(args),
    }
}
