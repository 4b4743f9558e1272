//! Weight initialisation.

use oxidize_seg_core::Tensor;
use rand::Rng;

/// He/Kaiming uniform: `U(-b, b)` with `b = gain * sqrt(3 / fan_in)` and
/// `gain = sqrt(2 / (1 + a^2))`.
///
/// Convolution weights use `a = sqrt(5)`, which reduces to `b = 1 / sqrt(fan_in)`.
pub fn kaiming_uniform<R: Rng + ?Sized>(
    shape: Vec<usize>,
    fan_in: usize,
    negative_slope: f64,
    rng: &mut R,
) -> Tensor<f32> {
    let gain = (2.0 / (1.0 + negative_slope * negative_slope)).sqrt();
    let bound = if fan_in == 0 {
        0.0
    } else {
        gain * (3.0 / fan_in as f64).sqrt()
    };
    Tensor::uniform(shape, -bound as f32, bound as f32, rng)
}

/// `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`, used for biases.
pub fn fan_in_uniform<R: Rng + ?Sized>(shape: Vec<usize>, fan_in: usize, rng: &mut R) -> Tensor<f32> {
    let bound = if fan_in == 0 {
        0.0
    } else {
        1.0 / (fan_in as f64).sqrt()
    };
    Tensor::uniform(shape, -bound as f32, bound as f32, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_conv_default_bound() {
        let mut rng = StdRng::seed_from_u64(0);
        let fan_in = 16 * 3 * 3;
        let w = kaiming_uniform(vec![8, 16, 3, 3], fan_in, 5f64.sqrt(), &mut rng);
        let bound = 1.0 / (fan_in as f32).sqrt();
        assert!(w.max_all().unwrap() <= bound + 1e-6);
        assert!(w.min_all().unwrap() >= -bound - 1e-6);
        // plenty of samples land near the edge
        assert!(w.max_all().unwrap() > 0.8 * bound);
    }

    #[test]
    fn test_zero_fan_in() {
        let mut rng = StdRng::seed_from_u64(0);
        let b = fan_in_uniform(vec![4], 0, &mut rng);
        assert_eq!(b.data(), &[0.0; 4]);
    }
}
