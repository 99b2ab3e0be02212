//! RMS Normalization.
//!
//! Reference: <https://arxiv.org/abs/1910.07467>

use candle_core::{Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// RMS Normalization layer.
///
/// Formula: `output = (x / sqrt(mean(x^2) + eps)) * weight`
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale parameter [hidden_size].
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
}

impl RmsNorm {
    /// Creates a new RmsNorm layer.
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    /// Loads `weight` under `vb`, initialising to ones when absent.
    pub fn load(hidden_size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(hidden_size, "weight", Init::Const(1.0))?;
        Ok(Self::new(weight, eps))
    }

    /// Returns a reference to the weight tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Normalizes over the last dimension.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let rms = (variance + self.eps)?.sqrt()?;
        x.broadcast_div(&rms)?.broadcast_mul(&self.weight)
    }

    /// Fused residual add then normalize.
    ///
    /// Returns `(norm(x + residual), x + residual)`.
    pub fn forward_residual(&self, x: &Tensor, residual: &Tensor) -> Result<(Tensor, Tensor)> {
        let summed = (x + residual)?;
        Ok((self.forward(&summed)?, summed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_rms_norm_unit_rms() {
        let device = Device::Cpu;
        let norm = RmsNorm::new(Tensor::ones(4, DType::F32, &device).unwrap(), 0.0);
        let x = Tensor::new(&[[2f32, 2., 2., 2.]], &device).unwrap();

        let y = norm.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        for v in &y[0] {
            assert!((v - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_forward_residual_returns_sum() {
        let device = Device::Cpu;
        let norm = RmsNorm::new(Tensor::ones(2, DType::F32, &device).unwrap(), 1e-6);
        let x = Tensor::new(&[[1f32, 2.]], &device).unwrap();
        let r = Tensor::new(&[[3f32, 2.]], &device).unwrap();

        let (normed, summed) = norm.forward_residual(&x, &r).unwrap();
        assert_eq!(summed.to_vec2::<f32>().unwrap(), vec![vec![4., 4.]]);
        let normed = normed.to_vec2::<f32>().unwrap();
        assert!((normed[0][0] - 1.0).abs() < 1e-4);
    }
}
