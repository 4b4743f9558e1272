use oxidize_seg_core::{Tensor, TensorError, TensorResult};
use rayon::prelude::*;

use crate::module::Module;

/// Adaptive Average Pooling 2D.
///
/// Produces a fixed `out_h x out_w` grid whatever the input size. Output cell
/// `i` averages input rows `floor(i * h / out_h) .. ceil((i + 1) * h / out_h)`,
/// and likewise for columns, so neighbouring bins may overlap.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveAvgPool2d {
    pub output_size: (usize, usize),
}

impl AdaptiveAvgPool2d {
    pub fn new(output_size: (usize, usize)) -> Self {
        AdaptiveAvgPool2d { output_size }
    }

    /// Pool to a single cell per channel.
    pub fn global() -> Self {
        Self::new((1, 1))
    }
}

/// Half-open input range covered by output bin `i`.
fn bin(i: usize, input: usize, output: usize) -> (usize, usize) {
    let start = i * input / output;
    let end = ((i + 1) * input).div_ceil(output);
    (start, end)
}

impl Module for AdaptiveAvgPool2d {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let [n, c, h, w] = input.nchw()?;
        let (out_h, out_w) = self.output_size;
        if out_h == 0 || out_w == 0 || h == 0 || w == 0 {
            return Err(TensorError::InvalidOperation(format!(
                "AdaptiveAvgPool2d cannot pool {} to {}x{}",
                input.shape(),
                out_h,
                out_w
            )));
        }

        let rows: Vec<(usize, usize)> = (0..out_h).map(|i| bin(i, h, out_h)).collect();
        let cols: Vec<(usize, usize)> = (0..out_w).map(|j| bin(j, w, out_w)).collect();

        let mut output = vec![0.0f32; n * c * out_h * out_w];
        output
            .par_chunks_mut(out_h * out_w)
            .zip(input.data().par_chunks(h * w))
            .for_each(|(dst, src)| {
                for (i, &(r0, r1)) in rows.iter().enumerate() {
                    for (j, &(c0, c1)) in cols.iter().enumerate() {
                        let mut sum = 0.0f32;
                        for r in r0..r1 {
                            sum += src[r * w + c0..r * w + c1].iter().sum::<f32>();
                        }
                        dst[i * out_w + j] = sum / ((r1 - r0) * (c1 - c0)) as f32;
                    }
                }
            });

        Tensor::new(output, vec![n, c, out_h, out_w])
    }
}
