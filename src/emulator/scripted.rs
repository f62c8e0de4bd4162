use anyhow::{Result, bail};
use std::path::Path;

use super::{Emulator, EmulatorSettings, GrayScreen};

const WIDTH: usize = 160;
const HEIGHT: usize = 210;

/// Deterministic in-memory emulator for exercising the environment wrapper
/// and the training loop without a ROM.
///
/// Odd frames render at brightness 200 and even frames at 50. Every
/// `life_loss_interval` non-noop actions one life is lost (no-ops count too
/// when `noop_life_loss` is set); the game is over when lives reach 0 or the
/// frame cap is hit. Each action earns `reward_per_action`.
#[derive(Debug, Clone)]
pub struct ScriptedEmulator {
    pub settings: EmulatorSettings,
    pub start_lives: u32,
    pub life_loss_interval: Option<u32>,
    pub noop_life_loss: bool,
    pub reward_per_action: f64,
    pub action_set: Vec<usize>,
    /// Every action id received, in order.
    pub act_log: Vec<usize>,
    pub reset_count: usize,
    rom_loaded: bool,
    lives: u32,
    frame: u64,
    episode_frames: u32,
    actions_since_loss: u32,
}

impl ScriptedEmulator {
    pub fn new(start_lives: u32, life_loss_interval: Option<u32>) -> Self {
        Self {
            settings: EmulatorSettings::default(),
            start_lives,
            life_loss_interval,
            noop_life_loss: false,
            reward_per_action: 1.0,
            action_set: vec![0, 1, 3, 4],
            act_log: Vec::new(),
            reset_count: 0,
            rom_loaded: false,
            lives: start_lives,
            frame: 0,
            episode_frames: 0,
            actions_since_loss: 0,
        }
    }

    pub fn brightness(frame: u64) -> u8 {
        if frame % 2 == 1 { 200 } else { 50 }
    }
}

impl Emulator for ScriptedEmulator {
    fn configure(&mut self, settings: EmulatorSettings) {
        self.settings = settings;
    }

    fn load_rom(&mut self, path: &Path) -> Result<()> {
        if path.as_os_str().is_empty() {
            bail!("empty ROM path");
        }
        self.rom_loaded = true;
        Ok(())
    }

    fn minimal_action_set(&self) -> Vec<usize> {
        self.action_set.clone()
    }

    fn act(&mut self, action: usize) -> Result<f64> {
        if !self.rom_loaded {
            bail!("act called before a ROM was loaded");
        }
        if !self.action_set.contains(&action) {
            bail!("action {action} is not in the action set");
        }
        self.act_log.push(action);
        if self.game_over() {
            return Ok(0.0);
        }
        self.frame += 1;
        self.episode_frames += 1;
        let costs_life = action != 0 || self.noop_life_loss;
        if let Some(interval) = self.life_loss_interval.filter(|_| costs_life) {
            self.actions_since_loss += 1;
            if self.actions_since_loss >= interval {
                self.actions_since_loss = 0;
                self.lives = self.lives.saturating_sub(1);
            }
        }
        Ok(self.reward_per_action)
    }

    fn game_over(&self) -> bool {
        self.lives == 0
            || (self.settings.max_num_frames > 0
                && self.episode_frames >= self.settings.max_num_frames)
    }

    fn reset_game(&mut self) -> Result<()> {
        self.reset_count += 1;
        self.lives = self.start_lives;
        self.episode_frames = 0;
        self.actions_since_loss = 0;
        Ok(())
    }

    fn lives(&self) -> u32 {
        self.lives
    }

    fn screen_grayscale(&mut self) -> Result<GrayScreen> {
        Ok(GrayScreen {
            width: WIDTH,
            height: HEIGHT,
            pixels: vec![Self::brightness(self.frame); WIDTH * HEIGHT],
        })
    }
}
