use candle_core::Device;

pub mod agent;
pub mod distribution;
pub mod emulator;
pub mod env;
pub mod memory;
pub mod model;
pub mod train;
pub mod viewer;

pub use agent::{Agent, AgentConfig};
pub use distribution::{PROB_FLOOR, Projection, support_values};
pub use emulator::{
    Emulator, EmulatorSettings, GrayScreen, NES_HEIGHT, NES_WIDTH, NesConfig, NesEmulator,
    ScriptedEmulator,
};
pub use env::{Env, EnvConfig, FRAME_LEN, FRAME_SIZE, StepResult};
pub use memory::{MemoryConfig, PrioritizedReplay, ReplayBatch, ReplayMemory, SumTree};
pub use model::{DistributionalNet, NetConfig, NoisyLinear, RainbowNet};
pub use train::{EvalStats, Metrics, TrainConfig, ValidationStates, evaluate, run};
pub use viewer::Viewer;

/// Picks the tensor device: CUDA when requested and compiled in, Metal on
/// `metal` builds, otherwise the host.
pub fn select_device(cuda: bool) -> Device {
    if cuda {
        match Device::cuda_if_available(0) {
            Ok(device) => return device,
            Err(err) => tracing::warn!("CUDA unavailable ({err}), falling back to CPU"),
        }
    }
    if cfg!(feature = "metal") {
        return Device::new_metal(0).unwrap_or(Device::Cpu);
    }
    Device::Cpu
}
