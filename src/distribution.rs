use anyhow::{Result, ensure};
use candle_core::{DType, Device, Tensor};

/// Lower bound on predicted probabilities before taking their log.
pub const PROB_FLOOR: f32 = 1e-3;

/// `atoms` evenly spaced values from `v_min` to `v_max`, both inclusive.
pub fn support_values(v_min: f64, v_max: f64, atoms: usize) -> Vec<f32> {
    let delta_z = (v_max - v_min) / (atoms - 1) as f64;
    (0..atoms)
        .map(|i| {
            if i == atoms - 1 {
                v_max as f32
            } else {
                (v_min + i as f64 * delta_z) as f32
            }
        })
        .collect()
}

// =============================================================================
// Categorical Projection
// =============================================================================

/// Projects n-step Bellman targets `R + γⁿ·z` back onto the fixed support.
pub struct Projection {
    support: Tensor,
    atoms: usize,
    v_min: f64,
    v_max: f64,
    /// 1 / Δz
    inv_delta_z: f64,
    discount_n: f64,
}

impl Projection {
    pub fn new(
        v_min: f64,
        v_max: f64,
        atoms: usize,
        discount: f64,
        multi_step: usize,
        device: &Device,
    ) -> Result<Self> {
        ensure!(atoms >= 2, "need at least two atoms, got {atoms}");
        ensure!(v_max > v_min, "v_max ({v_max}) must exceed v_min ({v_min})");
        let support = Tensor::from_vec(support_values(v_min, v_max, atoms), atoms, device)?;
        Ok(Self {
            support,
            atoms,
            v_min,
            v_max,
            inv_delta_z: (atoms - 1) as f64 / (v_max - v_min),
            discount_n: discount.powi(multi_step as i32),
        })
    }

    /// Shape `(atoms,)`.
    pub fn support(&self) -> &Tensor {
        &self.support
    }

    /// Replaces the rows of terminal samples with the uniform distribution.
    ///
    /// `probs`: `(batch, atoms)`, `nonterminals`: `(batch,)` of 0/1.
    pub fn mask_terminal(&self, probs: &Tensor, nonterminals: &Tensor) -> Result<Tensor> {
        let (batch, atoms) = probs.dims2()?;
        let keep = nonterminals.reshape((batch, 1))?.broadcast_as((batch, atoms))?;
        let uniform = Tensor::full(1.0 / atoms as f32, (batch, atoms), probs.device())?;
        Ok(keep.ne(0f32)?.where_cond(probs, &uniform)?)
    }

    /// Builds the target distribution `m` of shape `(batch, atoms)`.
    ///
    /// Mass at fractional bin `b` is split between `floor(b)` and `ceil(b)`.
    /// When `b` is integral the pair is widened by one bin so the full mass
    /// lands on `b` exactly once.
    pub fn project(
        &self,
        next_probs: &Tensor,
        returns: &Tensor,
        nonterminals: &Tensor,
    ) -> Result<Tensor> {
        let (batch, atoms) = next_probs.dims2()?;
        ensure!(
            atoms == self.atoms,
            "distribution has {atoms} atoms, support has {}",
            self.atoms
        );
        let device = next_probs.device();
        let next_probs = self.mask_terminal(next_probs, nonterminals)?;

        // Tz = R^n + (γ^n · nonterminal) · z, clamped to the support range
        let discount = nonterminals.reshape((batch, 1))?.affine(self.discount_n, 0.0)?;
        let tz = returns
            .reshape((batch, 1))?
            .broadcast_add(&discount.broadcast_mul(&self.support.reshape((1, atoms))?)?)?
            .clamp(self.v_min as f32, self.v_max as f32)?;

        // b = (Tz - Vmin) / Δz, kept inside the bin range against rounding
        let b = tz
            .affine(self.inv_delta_z, -self.v_min * self.inv_delta_z)?
            .clamp(0f32, (atoms - 1) as f32)?;
        let lower = b.floor()?;
        let upper = b.ceil()?;
        let coincide = lower.eq(&upper)?.to_dtype(DType::F32)?;
        let upper_positive = upper.gt(0f32)?.to_dtype(DType::F32)?;
        let lower = (&lower - coincide.mul(&upper_positive)?)?;
        let upper = (&upper + coincide.mul(&upper_positive.affine(-1.0, 1.0)?)?)?;

        let lower_mass = next_probs.mul(&(&upper - &b)?)?;
        let upper_mass = next_probs.mul(&(&b - &lower)?)?;

        let offsets: Vec<f32> = (0..batch).map(|i| (i * atoms) as f32).collect();
        let offsets = Tensor::from_vec(offsets, (batch, 1), device)?;
        let lower_idx = lower
            .broadcast_add(&offsets)?
            .flatten_all()?
            .to_dtype(DType::U32)?;
        let upper_idx = upper
            .broadcast_add(&offsets)?
            .flatten_all()?
            .to_dtype(DType::U32)?;

        let m = Tensor::zeros(batch * atoms, DType::F32, device)?
            .index_add(&lower_idx, &lower_mass.flatten_all()?, 0)?
            .index_add(&upper_idx, &upper_mass.flatten_all()?, 0)?;
        Ok(m.reshape((batch, atoms))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn projection(atoms: usize) -> Projection {
        Projection::new(-10.0, 10.0, atoms, 0.99, 3, &Device::Cpu).unwrap()
    }

    fn uniform(batch: usize, atoms: usize) -> Tensor {
        Tensor::full(1.0 / atoms as f32, (batch, atoms), &Device::Cpu).unwrap()
    }

    fn vec1(values: &[f32]) -> Tensor {
        Tensor::from_slice(values, values.len(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_support_is_evenly_spaced_and_bounded() {
        for &(v_min, v_max, atoms) in &[(-10.0, 10.0, 51), (0.0, 1.0, 2), (-3.5, 200.0, 11)] {
            let z = support_values(v_min, v_max, atoms);
            assert_eq!(z.len(), atoms);
            assert_eq!(z[0], v_min as f32);
            assert_eq!(z[atoms - 1], v_max as f32);
            assert!(z.windows(2).all(|w| w[1] > w[0]));
        }
    }

    #[test]
    fn test_fractional_bin_splits_mass() {
        // Tz = 7.3 everywhere -> b = 43.25 -> 0.75 to bin 43, 0.25 to bin 44
        let p = projection(51);
        let m = p
            .project(&uniform(1, 51), &vec1(&[7.3]), &vec1(&[0.0]))
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!((m[43] - 0.75).abs() < 1e-4, "bin 43 = {}", m[43]);
        assert!((m[44] - 0.25).abs() < 1e-4, "bin 44 = {}", m[44]);
        let rest: f32 = m
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != 43 && *i != 44)
            .map(|(_, v)| v)
            .sum();
        assert!(rest.abs() < 1e-6);
    }

    #[test]
    fn test_exact_bin_keeps_full_mass() {
        // Tz = -2.0 -> b = 20.0 exactly
        let p = projection(51);
        let m = p
            .project(&uniform(1, 51), &vec1(&[-2.0]), &vec1(&[0.0]))
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!((m[20] - 1.0).abs() < 1e-5, "bin 20 = {}", m[20]);
        assert!(m[19].abs() < 1e-6);
        assert!(m[21].abs() < 1e-6);
    }

    #[test]
    fn test_support_edges_keep_full_mass() {
        let p = projection(51);
        let m = p
            .project(&uniform(2, 51), &vec1(&[-50.0, 50.0]), &vec1(&[0.0, 0.0]))
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert!((m[0][0] - 1.0).abs() < 1e-5);
        assert!((m[1][50] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_projection_conserves_mass() {
        let atoms = 51;
        let p = projection(atoms);
        let logits = Tensor::randn(0f32, 2f32, (6, atoms), &Device::Cpu).unwrap();
        let probs = candle_nn::ops::softmax_last_dim(&logits).unwrap();
        let returns = vec1(&[0.0, 1.3, -4.2, 9.9, 3.0, -0.7]);
        let nonterminals = vec1(&[1.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
        let m = p.project(&probs, &returns, &nonterminals).unwrap();
        for row in m.sum(1).unwrap().to_vec1::<f32>().unwrap() {
            assert!((row - 1.0).abs() < 1e-4, "row mass {row}");
        }
        let flat = m.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(flat.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_samples_do_not_collide() {
        // Two samples whose targets land on different bins stay separate.
        let p = projection(51);
        let m = p
            .project(&uniform(2, 51), &vec1(&[-2.0, 6.0]), &vec1(&[0.0, 0.0]))
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert!((m[0][20] - 1.0).abs() < 1e-5);
        assert!((m[1][40] - 1.0).abs() < 1e-5);
        assert!(m[0][40].abs() < 1e-6);
        assert!(m[1][20].abs() < 1e-6);
    }

    #[test]
    fn test_rounding_at_support_edges_stays_in_row() {
        // Inexact Δz can push b a hair past the last bin. The overflow must not
        // wrap into the next sample's row or past the end of the batch.
        for &(v_min, v_max, atoms) in &[(0.1, 0.7, 51), (-5.5, 13.1, 51), (-5.5, 13.1, 101)] {
            let p = Projection::new(v_min, v_max, atoms, 0.99, 3, &Device::Cpu).unwrap();
            let high = v_max as f32 + 5.0;
            let mid = ((v_min + v_max) / 2.0) as f32;
            let m = p
                .project(
                    &uniform(3, atoms),
                    &vec1(&[high, mid, high]),
                    &vec1(&[0.0, 0.0, 0.0]),
                )
                .unwrap()
                .to_vec2::<f32>()
                .unwrap();
            for row in &m {
                let total: f32 = row.iter().sum();
                assert!((total - 1.0).abs() < 1e-4, "{v_min}..{v_max}/{atoms}: {total}");
                assert!(row.iter().all(|&v| v >= 0.0));
            }
            assert!((m[0][atoms - 1] - 1.0).abs() < 1e-4);
            assert!((m[2][atoms - 1] - 1.0).abs() < 1e-4);
            assert_eq!(m[1][0], 0.0);
        }
    }

    #[test]
    fn test_terminal_rows_become_uniform() {
        let atoms = 5;
        let p = projection(atoms);
        let probs = Tensor::new(
            &[[0.7f32, 0.1, 0.1, 0.05, 0.05], [0.0, 0.0, 1.0, 0.0, 0.0]],
            &Device::Cpu,
        )
        .unwrap();
        let masked = p
            .mask_terminal(&probs, &vec1(&[1.0, 0.0]))
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(masked[0], vec![0.7, 0.1, 0.1, 0.05, 0.05]);
        assert!(masked[1].iter().all(|&v| (v - 0.2).abs() < 1e-7));
    }
}
