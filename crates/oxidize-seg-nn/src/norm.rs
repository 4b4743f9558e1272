use oxidize_seg_core::{Tensor, TensorError, TensorResult};
use rayon::prelude::*;

use crate::module::{join, Module, TensorKind};

/// Batch Normalization over the channel axis of `[batch, channels, h, w]` input.
///
/// y = (x - μ) / √(σ² + ε) * γ + β
///
/// In inference mode (the default) μ and σ² are the stored running
/// statistics. In training mode they are the biased statistics of the current
/// batch over `(batch, h, w)`. Running statistics are buffers maintained by
/// whoever trains the network; `forward` never updates them.
pub struct BatchNorm2d {
    pub num_features: usize,
    pub eps: f32,
    pub weight: Tensor<f32>,       // γ, [num_features]
    pub bias: Tensor<f32>,         // β, [num_features]
    pub running_mean: Tensor<f32>, // [num_features]
    pub running_var: Tensor<f32>,  // [num_features]
    training: bool,
}

impl BatchNorm2d {
    pub fn new(num_features: usize) -> Self {
        BatchNorm2d {
            num_features,
            eps: 1e-5,
            weight: Tensor::ones(vec![num_features]),
            bias: Tensor::zeros(vec![num_features]),
            running_mean: Tensor::zeros(vec![num_features]),
            running_var: Tensor::ones(vec![num_features]),
            training: false,
        }
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Per-channel mean and biased variance of `x`.
    fn batch_statistics(&self, x: &Tensor<f32>) -> TensorResult<(Vec<f32>, Vec<f32>)> {
        let [n, c, h, w] = x.nchw()?;
        let count = n * h * w;
        if count <= 1 {
            return Err(TensorError::InvalidOperation(format!(
                "Expected more than 1 value per channel when training, got input shape {}",
                x.shape()
            )));
        }
        let plane = h * w;
        let data = x.data();
        let stats: Vec<(f32, f32)> = (0..c)
            .into_par_iter()
            .map(|ch| {
                let values = (0..n).flat_map(|b| {
                    let start = (b * c + ch) * plane;
                    data[start..start + plane].iter().map(|&v| v as f64)
                });
                let mean = values.clone().sum::<f64>() / count as f64;
                let var = values.map(|v| (v - mean) * (v - mean)).sum::<f64>() / count as f64;
                (mean as f32, var as f32)
            })
            .collect();
        Ok(stats.into_iter().unzip())
    }

    /// Normalize `x` in place.
    fn normalize(&self, x: &mut Tensor<f32>) -> TensorResult<()> {
        let [n, c, h, w] = x.nchw()?;
        if c != self.num_features {
            return Err(TensorError::ShapeMismatch {
                expected: vec![n, self.num_features, h, w],
                got: x.shape_vec(),
            });
        }
        if x.numel() == 0 {
            return Ok(());
        }

        let (mean, var) = if self.training {
            self.batch_statistics(x)?
        } else {
            (
                self.running_mean.data().to_vec(),
                self.running_var.data().to_vec(),
            )
        };

        // Fold into one multiply-add per element.
        let gamma = self.weight.data();
        let beta = self.bias.data();
        let (scale, shift): (Vec<f32>, Vec<f32>) = (0..c)
            .map(|ch| {
                let inv_std = 1.0 / (var[ch] + self.eps).sqrt();
                let scale = gamma[ch] * inv_std;
                (scale, beta[ch] - mean[ch] * scale)
            })
            .unzip();

        x.data_mut()
            .par_chunks_mut(h * w)
            .enumerate()
            .for_each(|(i, plane)| {
                let ch = i % c;
                let (a, b) = (scale[ch], shift[ch]);
                plane.iter_mut().for_each(|v| *v = *v * a + b);
            });
        Ok(())
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        self.forward_owned(input.clone())
    }

    fn forward_owned(&self, mut input: Tensor<f32>) -> TensorResult<Tensor<f32>> {
        self.normalize(&mut input)?;
        Ok(input)
    }

    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor<f32>, TensorKind)) {
        f(&join(prefix, "weight"), &self.weight, TensorKind::Parameter);
        f(&join(prefix, "bias"), &self.bias, TensorKind::Parameter);
        f(&join(prefix, "running_mean"), &self.running_mean, TensorKind::Buffer);
        f(&join(prefix, "running_var"), &self.running_var, TensorKind::Buffer);
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Tensor<f32>, TensorKind)) {
        f(&join(prefix, "weight"), &mut self.weight, TensorKind::Parameter);
        f(&join(prefix, "bias"), &mut self.bias, TensorKind::Parameter);
        f(&join(prefix, "running_mean"), &mut self.running_mean, TensorKind::Buffer);
        f(&join(prefix, "running_var"), &mut self.running_var, TensorKind::Buffer);
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_batchnorm_inference_defaults() {
        // Fresh statistics (mean 0, var 1) leave the input almost untouched.
        let bn = BatchNorm2d::new(3);
        let x = Tensor::randn(vec![2, 3, 4, 4], Some(0));
        let y = bn.forward(&x).unwrap();
        let scale = 1.0 / (1.0f32 + 1e-5).sqrt();
        assert_abs_diff_eq!(y.max_abs_diff(&x.apply(|v| v * scale)).unwrap(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_batchnorm_running_statistics() {
        let mut bn = BatchNorm2d::new(2);
        bn.running_mean = Tensor::from_slice(&[1.0, -2.0]);
        bn.running_var = Tensor::from_slice(&[4.0, 0.25]);
        bn.weight = Tensor::from_slice(&[2.0, 1.0]);
        bn.bias = Tensor::from_slice(&[0.5, 0.0]);
        bn.eps = 0.0;
        let x = Tensor::new(vec![3.0, 5.0, -2.0, -1.0], vec![1, 2, 1, 2]).unwrap();
        let y = bn.forward(&x).unwrap();
        // ch0: (x - 1) / 2 * 2 + 0.5, ch1: (x + 2) / 0.5
        assert_eq!(y.data(), &[2.5, 4.5, 0.0, 2.0]);
    }

    #[test]
    fn test_batchnorm_training_uses_batch_statistics() {
        let mut bn = BatchNorm2d::new(1);
        bn.set_training(true);
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 1, 1, 2]).unwrap();
        let y = bn.forward(&x).unwrap();
        assert_abs_diff_eq!(y.mean_all(), 0.0, epsilon = 1e-6);
        let var: f32 = y.data().iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert_abs_diff_eq!(var, 1.0, epsilon = 1e-4);
        // running statistics are not touched
        assert_eq!(bn.running_mean.data(), &[0.0]);
        assert_eq!(bn.running_var.data(), &[1.0]);
    }

    #[test]
    fn test_batchnorm_training_single_value_fails() {
        let mut bn = BatchNorm2d::new(4);
        bn.set_training(true);
        let x = Tensor::zeros(vec![1, 4, 1, 1]);
        assert!(bn.forward(&x).is_err());

        bn.set_training(false);
        assert!(bn.forward(&x).is_ok());
    }

    #[test]
    fn test_batchnorm_channel_mismatch() {
        let bn = BatchNorm2d::new(4);
        let x = Tensor::zeros(vec![1, 3, 2, 2]);
        assert!(matches!(bn.forward(&x), Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_batchnorm_state() {
        let bn = BatchNorm2d::new(5);
        assert_eq!(bn.num_parameters(), 10);
        let keys: Vec<String> = bn.state_dict().keys().map(String::from).collect();
        assert_eq!(keys, vec!["weight", "bias", "running_mean", "running_var"]);
    }
}
