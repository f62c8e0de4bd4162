use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

mod nes;
mod scripted;

pub use nes::{NES_HEIGHT, NES_WIDTH, NesConfig, NesEmulator};
pub use scripted::ScriptedEmulator;

// =============================================================================
// Emulator Settings
// =============================================================================

/// Options applied to an emulator before its ROM is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmulatorSettings {
    pub seed: u64,
    /// Frame cap per episode; `0` disables it.
    pub max_num_frames: u32,
    pub repeat_action_probability: f64,
    /// Emulated frames per `act` call.
    pub frame_skip: u32,
    /// Average the last two frames on screen capture.
    pub color_averaging: bool,
}

impl Default for EmulatorSettings {
    fn default() -> Self {
        Self {
            seed: 0,
            max_num_frames: 0,
            repeat_action_probability: 0.25,
            frame_skip: 1,
            color_averaging: false,
        }
    }
}

/// Single-channel 8-bit screen capture, row major.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrayScreen {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

// =============================================================================
// Emulator Contract
// =============================================================================

/// What the environment wrapper needs from a game emulator.
///
/// `configure` must be called before `load_rom`. Action ids passed to `act`
/// are entries of `minimal_action_set`.
pub trait Emulator {
    fn configure(&mut self, settings: EmulatorSettings);

    fn load_rom(&mut self, path: &Path) -> Result<()>;

    fn minimal_action_set(&self) -> Vec<usize>;

    /// Runs one action and returns the reward it produced.
    fn act(&mut self, action: usize) -> Result<f64>;

    fn game_over(&self) -> bool;

    fn reset_game(&mut self) -> Result<()>;

    fn lives(&self) -> u32;

    fn screen_grayscale(&mut self) -> Result<GrayScreen>;
}
