use anyhow::Result;
use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Init, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use crate::distribution::support_values;
use crate::env::FRAME_SIZE;

// =============================================================================
// Network Hyperparameters
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    pub history_length: usize,
    pub hidden_size: usize,
    pub noisy_std: f64,
    pub atoms: usize,
    pub v_min: f64,
    pub v_max: f64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            history_length: 4,
            hidden_size: 512,
            noisy_std: 0.1,
            atoms: 51,
            v_min: -10.0,
            v_max: 10.0,
        }
    }
}

// =============================================================================
// Network Contract
// =============================================================================

/// Shared surface of the online and target replicas.
pub trait DistributionalNet {
    /// `(batch, history, 84, 84)` states -> `(batch, actions, atoms)` probabilities.
    fn forward(&self, states: &Tensor) -> Result<Tensor>;

    /// Fixed support `z`, shape `(atoms,)`.
    fn support(&self) -> &Tensor;

    fn reset_noise(&mut self) -> Result<()>;

    /// Greedy action for a single `(history, 84, 84)` state.
    fn act(&self, state: &Tensor) -> Result<usize> {
        let q = self.expected_values(&state.unsqueeze(0)?)?;
        let action = q.argmax(D::Minus1)?.squeeze(0)?.to_scalar::<u32>()?;
        Ok(action as usize)
    }

    /// `Σ z·p` per action, shape `(batch, actions)`.
    fn expected_values(&self, states: &Tensor) -> Result<Tensor> {
        let probs = self.forward(states)?;
        let atoms = self.support().dim(0)?;
        let support = self.support().reshape((1, 1, atoms))?;
        Ok(probs.broadcast_mul(&support)?.sum(2)?)
    }

    fn set_training(&mut self, training: bool);

    fn varmap(&self) -> &VarMap;

    fn varmap_mut(&mut self) -> &mut VarMap;
}

// =============================================================================
// Noisy Linear Layer
// =============================================================================

/// Linear layer with factorised Gaussian parameter noise.
///
/// In training mode the effective weights are `μ + σ ⊙ ε`; in eval mode only
/// `μ` is used.
pub struct NoisyLinear {
    in_features: usize,
    out_features: usize,
    weight_mu: Tensor,
    weight_sigma: Tensor,
    bias_mu: Tensor,
    bias_sigma: Tensor,
    weight_epsilon: Tensor,
    bias_epsilon: Tensor,
    training: bool,
}

impl NoisyLinear {
    pub fn new(
        in_features: usize,
        out_features: usize,
        std_init: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mu_range = 1.0 / (in_features as f64).sqrt();
        let weight_mu = vb.get_with_hints(
            (out_features, in_features),
            "weight_mu",
            Init::Uniform {
                lo: -mu_range,
                up: mu_range,
            },
        )?;
        let weight_sigma = vb.get_with_hints(
            (out_features, in_features),
            "weight_sigma",
            Init::Const(std_init / (in_features as f64).sqrt()),
        )?;
        let bias_mu = vb.get_with_hints(
            out_features,
            "bias_mu",
            Init::Uniform {
                lo: -mu_range,
                up: mu_range,
            },
        )?;
        let bias_sigma = vb.get_with_hints(
            out_features,
            "bias_sigma",
            Init::Const(std_init / (out_features as f64).sqrt()),
        )?;
        let device = weight_mu.device().clone();

        let mut layer = Self {
            in_features,
            out_features,
            weight_mu,
            weight_sigma,
            bias_mu,
            bias_sigma,
            weight_epsilon: Tensor::zeros((out_features, in_features), DType::F32, &device)?,
            bias_epsilon: Tensor::zeros(out_features, DType::F32, &device)?,
            training: true,
        };
        layer.reset_noise()?;
        Ok(layer)
    }

    /// `sign(x)·sqrt(|x|)` of standard normal samples.
    fn scale_noise(size: usize, device: &Device) -> Result<Tensor> {
        let x = Tensor::randn(0f32, 1f32, size, device)?;
        let sign = x.ge(0f32)?.to_dtype(DType::F32)?.affine(2.0, -1.0)?;
        Ok(sign.mul(&x.abs()?.sqrt()?)?)
    }

    pub fn reset_noise(&mut self) -> Result<()> {
        let device = self.weight_mu.device().clone();
        let epsilon_in = Self::scale_noise(self.in_features, &device)?;
        let epsilon_out = Self::scale_noise(self.out_features, &device)?;
        self.weight_epsilon = epsilon_out
            .unsqueeze(1)?
            .broadcast_mul(&epsilon_in.unsqueeze(0)?)?;
        self.bias_epsilon = epsilon_out;
        Ok(())
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let layer = if self.training {
            let weight = (&self.weight_mu + self.weight_sigma.mul(&self.weight_epsilon)?)?;
            let bias = (&self.bias_mu + self.bias_sigma.mul(&self.bias_epsilon)?)?;
            Linear::new(weight, Some(bias))
        } else {
            Linear::new(self.weight_mu.clone(), Some(self.bias_mu.clone()))
        };
        Ok(layer.forward(x)?)
    }
}

// =============================================================================
// Rainbow Network (candle)
// =============================================================================

/// Nature-DQN convolution trunk with dueling noisy heads and a softmax over
/// atoms per action.
pub struct RainbowNet {
    varmap: VarMap,
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    fc_h_v: NoisyLinear,
    fc_h_a: NoisyLinear,
    fc_z_v: NoisyLinear,
    fc_z_a: NoisyLinear,
    support: Tensor,
    action_space: usize,
    atoms: usize,
    frozen: bool,
}

/// Flattened size of the convolution trunk for one 84x84 input.
fn conv_output_size() -> usize {
    let s = (FRAME_SIZE - 8) / 4 + 1;
    let s = (s - 4) / 2 + 1;
    let s = s - 3 + 1;
    64 * s * s
}

impl RainbowNet {
    pub fn new(config: &NetConfig, action_space: usize, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let conv = |stride| Conv2dConfig {
            stride,
            ..Default::default()
        };
        let conv1 = candle_nn::conv2d(config.history_length, 32, 8, conv(4), vb.pp("conv1"))?;
        let conv2 = candle_nn::conv2d(32, 64, 4, conv(2), vb.pp("conv2"))?;
        let conv3 = candle_nn::conv2d(64, 64, 3, conv(1), vb.pp("conv3"))?;

        let features = conv_output_size();
        let h = config.hidden_size;
        let std = config.noisy_std;
        let fc_h_v = NoisyLinear::new(features, h, std, vb.pp("fc_h_v"))?;
        let fc_h_a = NoisyLinear::new(features, h, std, vb.pp("fc_h_a"))?;
        let fc_z_v = NoisyLinear::new(h, config.atoms, std, vb.pp("fc_z_v"))?;
        let fc_z_a = NoisyLinear::new(h, action_space * config.atoms, std, vb.pp("fc_z_a"))?;

        let support = Tensor::from_vec(
            support_values(config.v_min, config.v_max, config.atoms),
            config.atoms,
            device,
        )?;

        Ok(Self {
            varmap,
            conv1,
            conv2,
            conv3,
            fc_h_v,
            fc_h_a,
            fc_z_v,
            fc_z_a,
            support,
            action_space,
            atoms: config.atoms,
            frozen: false,
        })
    }

    /// Detaches every output from the graph so no gradient reaches these
    /// parameters.
    pub fn frozen(mut self) -> Self {
        self.frozen = true;
        self
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn action_space(&self) -> usize {
        self.action_space
    }

    fn noisy_layers_mut(&mut self) -> [&mut NoisyLinear; 4] {
        [
            &mut self.fc_h_v,
            &mut self.fc_h_a,
            &mut self.fc_z_v,
            &mut self.fc_z_a,
        ]
    }
}

impl DistributionalNet for RainbowNet {
    fn forward(&self, states: &Tensor) -> Result<Tensor> {
        let batch = states.dim(0)?;
        let x = self.conv1.forward(states)?.relu()?;
        let x = self.conv2.forward(&x)?.relu()?;
        let x = self.conv3.forward(&x)?.relu()?;
        let x = x.flatten_from(1)?;

        // Value stream
        let v = self.fc_h_v.forward(&x)?.relu()?;
        let v = self.fc_z_v.forward(&v)?.reshape((batch, 1, self.atoms))?;

        // Advantage stream
        let a = self.fc_h_a.forward(&x)?.relu()?;
        let a = self
            .fc_z_a
            .forward(&a)?
            .reshape((batch, self.action_space, self.atoms))?;

        let a_mean = a.mean_keepdim(1)?;
        let q = v.broadcast_add(&a.broadcast_sub(&a_mean)?)?;
        let probs = candle_nn::ops::softmax(&q, D::Minus1)?;
        if self.frozen {
            Ok(probs.detach())
        } else {
            Ok(probs)
        }
    }

    fn support(&self) -> &Tensor {
        &self.support
    }

    fn reset_noise(&mut self) -> Result<()> {
        for layer in self.noisy_layers_mut() {
            layer.reset_noise()?;
        }
        Ok(())
    }

    fn set_training(&mut self, training: bool) {
        for layer in self.noisy_layers_mut() {
            layer.set_training(training);
        }
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn varmap_mut(&mut self) -> &mut VarMap {
        &mut self.varmap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> NetConfig {
        NetConfig {
            hidden_size: 16,
            atoms: 11,
            ..Default::default()
        }
    }

    fn states(batch: usize) -> Tensor {
        Tensor::rand(0f32, 1f32, (batch, 4, FRAME_SIZE, FRAME_SIZE), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_conv_output_size() {
        assert_eq!(conv_output_size(), 3136);
    }

    #[test]
    fn test_forward_yields_distributions() {
        let net = RainbowNet::new(&small_config(), 3, &Device::Cpu).unwrap();
        let probs = net.forward(&states(2)).unwrap();
        assert_eq!(probs.dims(), &[2, 3, 11]);
        let sums = probs.sum(2).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_act_returns_valid_action() {
        let net = RainbowNet::new(&small_config(), 5, &Device::Cpu).unwrap();
        let state = states(1).squeeze(0).unwrap();
        assert!(net.act(&state).unwrap() < 5);
    }

    #[test]
    fn test_reset_noise_changes_training_output_only() {
        let mut net = RainbowNet::new(&small_config(), 3, &Device::Cpu).unwrap();
        let x = states(1);

        let before = net.forward(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        net.reset_noise().unwrap();
        let after = net.forward(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_ne!(before, after);

        net.set_training(false);
        let eval_a = net.forward(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        net.reset_noise().unwrap();
        let eval_b = net.forward(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(eval_a, eval_b);
    }

    #[test]
    fn test_frozen_net_receives_no_gradient() {
        let online = RainbowNet::new(&small_config(), 3, &Device::Cpu).unwrap();
        let target = RainbowNet::new(&small_config(), 3, &Device::Cpu).unwrap().frozen();
        assert!(target.is_frozen() && !online.is_frozen());
        let x = states(2);
        let loss = (online.forward(&x).unwrap() * target.forward(&x).unwrap())
            .unwrap()
            .sum_all()
            .unwrap();
        let grads = loss.backward().unwrap();
        for var in target.varmap().all_vars() {
            assert!(grads.get(var.as_tensor()).is_none());
        }
        assert!(
            online
                .varmap()
                .all_vars()
                .iter()
                .any(|var| grads.get(var.as_tensor()).is_some())
        );
    }
}
