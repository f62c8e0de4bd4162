use anyhow::{Context, Result, anyhow, bail};
use image::{GrayImage, RgbaImage, imageops};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use tetanes_core::input::JoypadBtnState;
use tetanes_core::mem::Read;
use tetanes_core::prelude::*;

use super::{Emulator, EmulatorSettings, GrayScreen};

pub const NES_WIDTH: usize = 256;
pub const NES_HEIGHT: usize = 240;

// =============================================================================
// Game Layout
// =============================================================================

/// Per-ROM knowledge the emulator needs to expose lives, reward and actions.
///
/// Defaults target Kung Fu (NES): lives at `0x005C`, six BCD score digits at
/// `0x0531..=0x0536`.
#[derive(Debug, Clone)]
pub struct NesConfig {
    pub lives_addr: u16,
    pub score_digits: Vec<u16>,
    /// Score jumps at or above this are RAM glitches, not reward.
    pub max_score_delta: u32,
    pub start_delay_frames: u32,
    pub start_press_frames: u32,
    pub start_settle_frames: u32,
    pub actions: Vec<JoypadBtnState>,
}

impl Default for NesConfig {
    fn default() -> Self {
        let right = JoypadBtnState::RIGHT;
        let left = JoypadBtnState::LEFT;
        let down = JoypadBtnState::DOWN;
        let up = JoypadBtnState::UP;
        let a = JoypadBtnState::A;
        let b = JoypadBtnState::B;
        Self {
            lives_addr: 0x005C,
            score_digits: vec![0x0531, 0x0532, 0x0533, 0x0534, 0x0535, 0x0536],
            max_score_delta: 5_000,
            start_delay_frames: 120,
            start_press_frames: 2,
            start_settle_frames: 240,
            actions: vec![
                JoypadBtnState::empty(),
                right,
                left,
                down,
                up,
                right | b,
                right | a,
                left | b,
                left | a,
                down | b,
                down | a,
                up | b,
                up | a,
            ],
        }
    }
}

// =============================================================================
// NES Emulator
// =============================================================================

/// `Emulator` over a tetanes control deck. Action id `0` is always the empty
/// joypad state.
pub struct NesEmulator {
    deck: ControlDeck,
    config: NesConfig,
    settings: EmulatorSettings,
    rng: SmallRng,
    last_action: usize,
    last_score: u32,
    episode_frames: u32,
    started: bool,
    prev_luma: Option<GrayImage>,
}

impl NesEmulator {
    pub fn new(config: NesConfig) -> Self {
        let mut deck = ControlDeck::new();
        deck.set_headless_mode(tetanes_core::control_deck::HeadlessMode::NO_AUDIO);
        let settings = EmulatorSettings::default();
        Self {
            deck,
            config,
            rng: SmallRng::seed_from_u64(settings.seed),
            settings,
            last_action: 0,
            last_score: 0,
            episode_frames: 0,
            started: false,
            prev_luma: None,
        }
    }

    pub fn peek(&self, addr: u16) -> u8 {
        self.deck.bus().peek(addr)
    }

    pub fn read_score(&self) -> u32 {
        let digits = self.config.score_digits.len();
        self.config
            .score_digits
            .iter()
            .enumerate()
            .map(|(i, &addr)| {
                let digit = (self.peek(addr) & 0x0F) as u32;
                digit * 10u32.pow((digits - 1 - i) as u32)
            })
            .sum()
    }

    fn clock_frame(&mut self) -> Result<()> {
        if self.settings.color_averaging {
            self.prev_luma = Some(self.luma()?);
        }
        self.deck.clock_frame()?;
        Ok(())
    }

    fn set_input_state(&mut self, btn_state: JoypadBtnState) {
        let joypad = self.deck.joypad_mut(Player::One);
        for button in [
            JoypadBtnState::LEFT,
            JoypadBtnState::RIGHT,
            JoypadBtnState::UP,
            JoypadBtnState::DOWN,
            JoypadBtnState::A,
            JoypadBtnState::B,
            JoypadBtnState::TURBO_A,
            JoypadBtnState::TURBO_B,
            JoypadBtnState::START,
            JoypadBtnState::SELECT,
        ] {
            joypad.set_button(button, btn_state.contains(button));
        }
    }

    fn press_start(&mut self, frames: u32) -> Result<()> {
        for _ in 0..frames {
            self.set_input_state(JoypadBtnState::START);
            self.clock_frame()?;
        }
        self.set_input_state(JoypadBtnState::empty());
        Ok(())
    }

    fn frame_cap_reached(&self) -> bool {
        self.settings.max_num_frames > 0 && self.episode_frames >= self.settings.max_num_frames
    }

    fn luma(&mut self) -> Result<GrayImage> {
        to_gray(self.deck.frame_buffer().to_vec())
    }
}

/// Grayscale of a `NES_WIDTH`x`NES_HEIGHT` RGBA frame.
fn to_gray(rgba: Vec<u8>) -> Result<GrayImage> {
    let len = rgba.len();
    let frame = RgbaImage::from_raw(NES_WIDTH as u32, NES_HEIGHT as u32, rgba).ok_or_else(|| {
        anyhow!("frame buffer of {len} bytes is not {NES_WIDTH}x{NES_HEIGHT} RGBA")
    })?;
    Ok(imageops::grayscale(&frame))
}

/// Per-pixel mean of two frames, written into `current`.
fn average_frames(current: &mut GrayImage, previous: &GrayImage) {
    for (cur, old) in current.pixels_mut().zip(previous.pixels()) {
        cur.0[0] = ((cur.0[0] as u16 + old.0[0] as u16) / 2) as u8;
    }
}

impl Emulator for NesEmulator {
    fn configure(&mut self, settings: EmulatorSettings) {
        self.rng = SmallRng::seed_from_u64(settings.seed);
        self.settings = EmulatorSettings {
            frame_skip: settings.frame_skip.max(1),
            ..settings
        };
    }

    fn load_rom(&mut self, path: &Path) -> Result<()> {
        self.deck
            .load_rom_path(path)
            .with_context(|| format!("Failed to load ROM: {}", path.display()))?;
        self.started = false;
        Ok(())
    }

    fn minimal_action_set(&self) -> Vec<usize> {
        (0..self.config.actions.len()).collect()
    }

    fn act(&mut self, action: usize) -> Result<f64> {
        if action >= self.config.actions.len() {
            bail!(
                "action {action} outside the action set (size {})",
                self.config.actions.len()
            );
        }
        let effective = if self.rng.random::<f64>() < self.settings.repeat_action_probability {
            self.last_action
        } else {
            action
        };
        self.last_action = effective;

        let mut reward = 0.0;
        for _ in 0..self.settings.frame_skip {
            if self.game_over() {
                break;
            }
            self.set_input_state(self.config.actions[effective]);
            self.clock_frame()?;
            self.episode_frames = self.episode_frames.saturating_add(1);

            let score = self.read_score();
            let delta = score.saturating_sub(self.last_score);
            if delta > 0 && delta < self.config.max_score_delta {
                reward += delta as f64;
            }
            self.last_score = score;
        }
        Ok(reward)
    }

    fn game_over(&self) -> bool {
        self.started && (self.lives() == 0 || self.frame_cap_reached())
    }

    fn reset_game(&mut self) -> Result<()> {
        self.deck.reset(ResetKind::Hard);
        self.set_input_state(JoypadBtnState::empty());
        self.prev_luma = None;
        for _ in 0..self.config.start_delay_frames {
            self.clock_frame()?;
        }
        self.press_start(self.config.start_press_frames)?;
        for _ in 0..self.config.start_settle_frames {
            self.clock_frame()?;
        }
        self.last_action = 0;
        self.last_score = self.read_score();
        self.episode_frames = 0;
        self.started = true;
        tracing::debug!(lives = self.lives(), score = self.last_score, "nes game reset");
        Ok(())
    }

    fn lives(&self) -> u32 {
        self.peek(self.config.lives_addr) as u32
    }

    fn screen_grayscale(&mut self) -> Result<GrayScreen> {
        let mut gray = self.luma()?;
        if let Some(prev) = self.prev_luma.as_ref() {
            average_frames(&mut gray, prev);
        }
        Ok(GrayScreen {
            width: NES_WIDTH,
            height: NES_HEIGHT,
            pixels: gray.into_raw(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(rgba: [u8; 4]) -> Vec<u8> {
        rgba.repeat(NES_WIDTH * NES_HEIGHT)
    }

    #[test]
    fn test_gray_conversion_weights_channels() {
        let gray = |px| to_gray(solid(px)).unwrap().get_pixel(0, 0).0[0];
        assert_eq!(gray([0, 0, 0, 255]), 0);
        assert_eq!(gray([255, 255, 255, 255]), 255);
        let (r, g, b) = (gray([255, 0, 0, 255]), gray([0, 255, 0, 255]), gray([0, 0, 255, 255]));
        assert!(g > r && r > b, "r={r} g={g} b={b}");

        let image = to_gray(solid([10, 20, 30, 255])).unwrap();
        assert_eq!(image.dimensions(), (NES_WIDTH as u32, NES_HEIGHT as u32));
    }

    #[test]
    fn test_short_frame_buffer_is_an_error() {
        assert!(to_gray(vec![0; 16]).is_err());
    }

    #[test]
    fn test_average_frames_is_pixelwise_mean() {
        let mut current = to_gray(solid([255, 255, 255, 255])).unwrap();
        let previous = to_gray(solid([0, 0, 0, 255])).unwrap();
        average_frames(&mut current, &previous);
        assert!(current.pixels().all(|p| p.0[0] == 127));
    }
}
