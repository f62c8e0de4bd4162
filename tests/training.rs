use candle_core::Device;
use std::path::Path;

use rainbow_nes_rl::{
    Agent, AgentConfig, DistributionalNet, Env, EnvConfig, MemoryConfig, PrioritizedReplay,
    ScriptedEmulator, TrainConfig, ValidationStates, evaluate, run,
};

fn scripted_env() -> Env<ScriptedEmulator> {
    let config = EnvConfig {
        seed: 7,
        max_episode_length: 200,
        history_length: 4,
    };
    Env::new(
        ScriptedEmulator::new(3, Some(8)),
        Path::new("scripted.rom"),
        &config,
        &Device::Cpu,
    )
    .unwrap()
}

fn agent_config() -> AgentConfig {
    AgentConfig {
        atoms: 11,
        batch_size: 4,
        hidden_size: 8,
        seed: 7,
        ..Default::default()
    }
}

/// Online weights sorted by variable name.
fn online_weights(agent: &Agent) -> Vec<(String, Vec<f32>)> {
    let data = agent.online_net().varmap().data().lock().unwrap();
    let mut weights: Vec<_> = data
        .iter()
        .map(|(name, var)| {
            let values = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            (name.clone(), values)
        })
        .collect();
    weights.sort_by(|a, b| a.0.cmp(&b.0));
    weights
}

fn memory_config() -> MemoryConfig {
    MemoryConfig {
        capacity: 64,
        seed: 7,
        ..Default::default()
    }
}

#[test]
fn test_short_training_run_learns_evaluates_and_saves() {
    let results = tempfile::tempdir().unwrap();
    let memory_path = results.path().join("memory.bin");
    let config = TrainConfig {
        t_max: 40,
        learn_start: 12,
        replay_frequency: 4,
        target_update: 8,
        evaluation_interval: 20,
        evaluation_episodes: 1,
        evaluation_size: 4,
        log_interval: 0,
        results_dir: results.path().to_path_buf(),
        memory: Some(memory_path.clone()),
        ..Default::default()
    };

    let mut env = scripted_env();
    let mut eval_env = scripted_env();
    let mut agent = Agent::new(&agent_config(), env.action_space(), &Device::Cpu).unwrap();
    let mut memory = PrioritizedReplay::new(memory_config(), &Device::Cpu).unwrap();
    let validation = ValidationStates::collect(&mut env, config.evaluation_size, 7).unwrap();
    assert_eq!(validation.len(), 4);
    let weights_before = online_weights(&agent);

    let metrics = run(
        &mut agent,
        &mut env,
        &mut eval_env,
        &mut memory,
        &validation,
        &config,
    )
    .unwrap();

    let steps: Vec<u64> = metrics.evaluations.iter().map(|e| e.step).collect();
    assert_eq!(steps, vec![20, 40]);
    assert!(metrics.best_avg_reward.is_some());
    assert_ne!(online_weights(&agent), weights_before);
    for stats in &metrics.evaluations {
        assert_eq!(stats.rewards.len(), 1);
        assert!(stats.avg_q.is_finite());
    }

    // β annealed upward from its starting value.
    assert!(memory.priority_weight > memory_config().priority_weight);
    assert_eq!(memory.len(), 40);

    assert!(results.path().join("metrics.json").is_file());
    assert!(results.path().join("model.safetensors").is_file());
    let restored = PrioritizedReplay::load(&memory_path, &Device::Cpu).unwrap();
    assert_eq!(restored.len(), 40);
}

#[test]
fn test_learning_from_the_first_step_waits_for_complete_transitions() {
    let results = tempfile::tempdir().unwrap();
    let config = TrainConfig {
        t_max: 12,
        learn_start: 1,
        replay_frequency: 1,
        target_update: 4,
        evaluation_interval: 0,
        log_interval: 0,
        results_dir: results.path().to_path_buf(),
        ..Default::default()
    };

    let mut env = scripted_env();
    let mut eval_env = scripted_env();
    let mut agent = Agent::new(&agent_config(), env.action_space(), &Device::Cpu).unwrap();
    let mut memory = PrioritizedReplay::new(memory_config(), &Device::Cpu).unwrap();
    let validation = ValidationStates::collect(&mut env, 2, 7).unwrap();
    let weights_before = online_weights(&agent);

    let metrics = run(
        &mut agent,
        &mut env,
        &mut eval_env,
        &mut memory,
        &validation,
        &config,
    )
    .unwrap();

    assert!(metrics.evaluations.is_empty());
    assert_eq!(memory.len(), 12);
    assert!(memory.is_sampleable());
    assert_ne!(online_weights(&agent), weights_before);
}

#[test]
fn test_evaluate_runs_episodes_in_eval_mode() {
    let mut env = scripted_env();
    let mut agent = Agent::new(&agent_config(), env.action_space(), &Device::Cpu).unwrap();
    let validation = ValidationStates::collect(&mut env, 3, 1).unwrap();

    let stats = evaluate(&mut agent, &mut env, &validation, 2, 1.0, None).unwrap();
    assert_eq!(stats.rewards.len(), 2);
    assert!(!env.is_training());
    // Every step repeats the action 4 times at reward 1 until the game ends.
    assert!(stats.rewards.iter().all(|&r| r > 0.0));
    let mean = stats.rewards.iter().sum::<f64>() / 2.0;
    assert!((stats.avg_reward - mean).abs() < 1e-9);
}
