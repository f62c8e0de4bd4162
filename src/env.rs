use anyhow::{Result, anyhow};
use candle_core::{Device, Tensor};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;

use crate::emulator::{Emulator, EmulatorSettings, GrayScreen};

pub const FRAME_SIZE: usize = 84;
pub const FRAME_LEN: usize = FRAME_SIZE * FRAME_SIZE;

/// Emulator ticks per agent step.
pub const ACTION_REPEAT: usize = 4;
/// Random no-ops on a full reset are drawn from `0..NOOP_MAX`.
pub const NOOP_MAX: usize = 30;
/// Raw emulator action id that does nothing.
const NOOP: usize = 0;

/// One preprocessed 84x84 frame, values in [0, 1].
pub type Frame = Vec<f32>;

// =============================================================================
// Environment Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    pub seed: u64,
    pub max_episode_length: u32,
    pub history_length: usize,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            seed: 123,
            max_episode_length: 108_000,
            history_length: 4,
        }
    }
}

pub struct StepResult {
    pub state: Tensor,
    pub reward: f64,
    pub done: bool,
}

// =============================================================================
// Frame Preprocessing
// =============================================================================

/// Source rows/columns overlapped by each destination cell, with the fraction
/// of the cell each one covers.
fn area_weights(src: usize, dst: usize) -> Vec<Vec<(usize, f32)>> {
    let scale = src as f64 / dst as f64;
    (0..dst)
        .map(|d| {
            let start = d as f64 * scale;
            let end = start + scale;
            let mut weights = Vec::new();
            let mut s = start.floor() as usize;
            while (s as f64) < end && s < src {
                let lo = start.max(s as f64);
                let hi = end.min(s as f64 + 1.0);
                if hi > lo {
                    weights.push((s, ((hi - lo) / scale) as f32));
                }
                s += 1;
            }
            weights
        })
        .collect()
}

/// Area-averaging resize of a row-major single-channel image.
pub fn resize_area(
    pixels: &[u8],
    width: usize,
    height: usize,
    out_width: usize,
    out_height: usize,
) -> Vec<f32> {
    debug_assert_eq!(pixels.len(), width * height);
    let cols = area_weights(width, out_width);
    let rows = area_weights(height, out_height);

    // Horizontal pass into an intermediate (height x out_width) image.
    let mut horizontal = vec![0f32; height * out_width];
    for y in 0..height {
        let row = &pixels[y * width..(y + 1) * width];
        for (x, taps) in cols.iter().enumerate() {
            horizontal[y * out_width + x] = taps.iter().map(|&(s, w)| row[s] as f32 * w).sum();
        }
    }

    let mut out = vec![0f32; out_height * out_width];
    for (y, taps) in rows.iter().enumerate() {
        for x in 0..out_width {
            out[y * out_width + x] = taps
                .iter()
                .map(|&(s, w)| horizontal[s * out_width + x] * w)
                .sum();
        }
    }
    out
}

/// Grayscale screen -> 84x84 frame scaled to [0, 1].
pub fn preprocess(screen: &GrayScreen) -> Frame {
    let mut frame = resize_area(
        &screen.pixels,
        screen.width,
        screen.height,
        FRAME_SIZE,
        FRAME_SIZE,
    );
    for v in frame.iter_mut() {
        *v /= 255.0;
    }
    frame
}

// =============================================================================
// Environment
// =============================================================================

/// Stacked-frame environment over an emulator.
///
/// In training mode losing a life ends the episode for learning purposes, and
/// the following `reset` only issues a no-op so the game continues.
pub struct Env<E: Emulator> {
    emulator: E,
    actions: Vec<usize>,
    lives: u32,
    life_termination: bool,
    window: usize,
    state_buffer: VecDeque<Frame>,
    screen: GrayScreen,
    training: bool,
    rng: SmallRng,
    device: Device,
}

impl<E: Emulator> Env<E> {
    pub fn new(mut emulator: E, rom: &Path, config: &EnvConfig, device: &Device) -> Result<Self> {
        emulator.configure(EmulatorSettings {
            seed: config.seed,
            max_num_frames: config.max_episode_length,
            repeat_action_probability: 0.0,
            frame_skip: 1,
            color_averaging: false,
        });
        emulator.load_rom(rom)?;
        let actions = emulator.minimal_action_set();
        tracing::info!(
            rom = %rom.display(),
            actions = actions.len(),
            window = config.history_length,
            "environment ready"
        );

        Ok(Self {
            emulator,
            actions,
            lives: 0,
            life_termination: false,
            window: config.history_length,
            state_buffer: VecDeque::with_capacity(config.history_length),
            screen: GrayScreen::default(),
            training: true,
            rng: SmallRng::seed_from_u64(config.seed),
            device: device.clone(),
        })
    }

    fn capture_frame(&mut self) -> Result<Frame> {
        self.screen = self.emulator.screen_grayscale()?;
        Ok(preprocess(&self.screen))
    }

    fn push_frame(&mut self, frame: Frame) {
        if self.state_buffer.len() == self.window {
            self.state_buffer.pop_front();
        }
        self.state_buffer.push_back(frame);
    }

    fn reset_buffer(&mut self) {
        for _ in 0..self.window {
            self.push_frame(vec![0.0; FRAME_LEN]);
        }
    }

    fn stacked_state(&self) -> Result<Tensor> {
        let flat: Vec<f32> = self.state_buffer.iter().flatten().copied().collect();
        Ok(Tensor::from_vec(
            flat,
            (self.state_buffer.len(), FRAME_SIZE, FRAME_SIZE),
            &self.device,
        )?)
    }

    pub fn reset(&mut self) -> Result<Tensor> {
        if self.life_termination && self.training {
            self.life_termination = false;
            self.emulator.act(NOOP)?;
        } else {
            self.life_termination = false;
            self.reset_buffer();
            self.emulator.reset_game()?;
            let noops = self.rng.random_range(0..NOOP_MAX);
            for _ in 0..noops {
                self.emulator.act(NOOP)?;
                if self.emulator.game_over() {
                    self.emulator.reset_game()?;
                }
            }
            tracing::debug!(noops, "full reset");
        }
        let observation = self.capture_frame()?;
        self.push_frame(observation);
        self.lives = self.emulator.lives();
        self.stacked_state()
    }

    pub fn step(&mut self, action: usize) -> Result<StepResult> {
        let raw_action = self
            .actions
            .get(action)
            .copied()
            .ok_or_else(|| anyhow!("action index {action} outside 0..{}", self.actions.len()))?;

        let mut frame_buffer = [vec![0f32; FRAME_LEN], vec![0f32; FRAME_LEN]];
        let mut reward = 0.0;
        let mut done = false;
        for t in 0..ACTION_REPEAT {
            reward += self.emulator.act(raw_action)?;
            if t == ACTION_REPEAT - 2 {
                frame_buffer[0] = self.capture_frame()?;
            } else if t == ACTION_REPEAT - 1 {
                frame_buffer[1] = self.capture_frame()?;
            }
            done = self.emulator.game_over();
            if done {
                break;
            }
        }
        let [first, second] = frame_buffer;
        let observation: Frame = first.iter().zip(&second).map(|(a, b)| a.max(*b)).collect();
        self.push_frame(observation);

        if self.training {
            let lives = self.emulator.lives();
            if lives < self.lives && lives > 0 {
                self.life_termination = !done;
                done = true;
                tracing::debug!(lives, "life lost");
            }
            self.lives = lives;
        }

        Ok(StepResult {
            state: self.stacked_state()?,
            reward,
            done,
        })
    }

    /// Life loss counts as terminal.
    pub fn train(&mut self) {
        self.training = true;
    }

    /// Only game over is terminal.
    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn action_space(&self) -> usize {
        self.actions.len()
    }

    pub fn lives(&self) -> u32 {
        self.lives
    }

    pub fn window_len(&self) -> usize {
        self.state_buffer.len()
    }

    /// Last raw grayscale capture.
    pub fn screen(&self) -> &GrayScreen {
        &self.screen
    }

    pub fn emulator(&self) -> &E {
        &self.emulator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::ScriptedEmulator;

    fn make_env(emulator: ScriptedEmulator, window: usize) -> Env<ScriptedEmulator> {
        let config = EnvConfig {
            seed: 7,
            max_episode_length: 0,
            history_length: window,
        };
        Env::new(emulator, Path::new("scripted.rom"), &config, &Device::Cpu).unwrap()
    }

    fn frames(state: &Tensor) -> Vec<Vec<Vec<f32>>> {
        state.to_vec3::<f32>().unwrap()
    }

    #[test]
    fn test_resize_area_constant_image() {
        let pixels = vec![90u8; 160 * 210];
        let out = resize_area(&pixels, 160, 210, FRAME_SIZE, FRAME_SIZE);
        assert_eq!(out.len(), FRAME_LEN);
        for v in out {
            assert!((v - 90.0).abs() < 1e-3, "got {v}");
        }
    }

    #[test]
    fn test_resize_area_block_mean() {
        // 4x4 -> 2x2: each output is the mean of a 2x2 block.
        let pixels = vec![
            0, 10, 100, 100, //
            20, 30, 100, 100, //
            0, 0, 255, 255, //
            0, 0, 255, 255,
        ];
        let out = resize_area(&pixels, 4, 4, 2, 2);
        assert!((out[0] - 15.0).abs() < 1e-4);
        assert!((out[1] - 100.0).abs() < 1e-4);
        assert!((out[2] - 0.0).abs() < 1e-4);
        assert!((out[3] - 255.0).abs() < 1e-4);
    }

    #[test]
    fn test_preprocess_scales_to_unit_range() {
        let screen = GrayScreen {
            width: 160,
            height: 210,
            pixels: vec![255; 160 * 210],
        };
        let frame = preprocess(&screen);
        assert!(frame.iter().all(|&v| (v - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_reset_stacks_zero_frames_then_one_real_frame() {
        let mut env = make_env(ScriptedEmulator::new(3, None), 4);
        let state = env.reset().unwrap();
        assert_eq!(state.dims(), &[4, FRAME_SIZE, FRAME_SIZE]);
        let f = frames(&state);
        for zero_frame in &f[..3] {
            assert!(zero_frame.iter().flatten().all(|&v| v == 0.0));
        }
        assert!(f[3].iter().flatten().all(|&v| v > 0.0));
        assert_eq!(env.emulator().reset_count, 1);
    }

    #[test]
    fn test_window_length_is_fixed() {
        let mut env = make_env(ScriptedEmulator::new(3, None), 4);
        for _ in 0..4 {
            env.reset().unwrap();
            assert_eq!(env.window_len(), 4);
        }
        for _ in 0..10 {
            env.step(1).unwrap();
            assert_eq!(env.window_len(), 4);
        }
    }

    #[test]
    fn test_step_repeats_action_and_max_pools_last_two_frames() {
        let mut env = make_env(ScriptedEmulator::new(3, None), 4);
        env.reset().unwrap();
        let before = env.emulator().act_log.len();
        let result = env.step(2).unwrap();
        let log = &env.emulator().act_log[before..];
        assert_eq!(log, &[3, 3, 3, 3]);
        assert_eq!(result.reward, 4.0);
        assert!(!result.done);

        // Ticks 2 and 3 land on one odd and one even frame; the max is the bright one.
        let f = frames(&result.state);
        let expected = ScriptedEmulator::brightness(1) as f32 / 255.0;
        assert!(f[3].iter().flatten().all(|&v| (v - expected).abs() < 1e-5));
    }

    #[test]
    fn test_invalid_action_is_an_error() {
        let mut env = make_env(ScriptedEmulator::new(3, None), 4);
        env.reset().unwrap();
        assert!(env.step(env.action_space()).is_err());
    }

    #[test]
    fn test_life_loss_is_terminal_in_training_and_soft_resets() {
        // One life lost per 4 non-noop actions: every step loses a life.
        let mut env = make_env(ScriptedEmulator::new(3, Some(4)), 4);
        env.train();
        env.reset().unwrap();
        assert_eq!(env.lives(), 3);

        let result = env.step(1).unwrap();
        assert!(result.done);
        assert_eq!(env.lives(), 2);

        let resets_before = env.emulator().reset_count;
        let acts_before = env.emulator().act_log.len();
        let state = env.reset().unwrap();
        assert_eq!(env.emulator().reset_count, resets_before);
        assert_eq!(env.emulator().act_log.len(), acts_before + 1);
        assert_eq!(env.emulator().act_log.last(), Some(&0));
        // Soft reset keeps the previous frames in the window.
        let f = frames(&state);
        assert!(f[2].iter().flatten().all(|&v| v > 0.0));
    }

    #[test]
    fn test_life_loss_is_not_terminal_in_eval() {
        let mut env = make_env(ScriptedEmulator::new(3, Some(4)), 4);
        env.eval();
        env.reset().unwrap();
        let result = env.step(1).unwrap();
        assert!(!result.done);

        let resets_before = env.emulator().reset_count;
        env.reset().unwrap();
        assert_eq!(env.emulator().reset_count, resets_before + 1);
    }

    #[test]
    fn test_game_over_is_terminal_and_forces_full_reset() {
        // Single life: losing it is game over, in either mode.
        let mut env = make_env(ScriptedEmulator::new(1, Some(2)), 4);
        env.train();
        env.reset().unwrap();
        let before = env.emulator().act_log.len();
        let result = env.step(1).unwrap();
        assert!(result.done);
        // Stopped early after the life was lost on the second tick.
        assert_eq!(env.emulator().act_log.len() - before, 2);

        let resets_before = env.emulator().reset_count;
        env.reset().unwrap();
        assert!(env.emulator().reset_count > resets_before);
    }

    #[test]
    fn test_game_over_during_reset_noops_restarts_the_game() {
        // Every no-op costs the only life, so each one ends the game.
        let mut emulator = ScriptedEmulator::new(1, Some(1));
        emulator.noop_life_loss = true;
        let mut env = make_env(emulator, 4);
        env.eval();
        for _ in 0..5 {
            env.reset().unwrap();
            assert!(!env.emulator().game_over());
            assert_eq!(env.lives(), 1);
        }
        let noops = env.emulator().act_log.len();
        assert!(noops > 0);
        assert!(env.emulator().act_log.iter().all(|&a| a == NOOP));
        assert_eq!(env.emulator().reset_count, 5 + noops);
    }
}
