use log::trace;
use ndarray::linalg::general_mat_mul;
use ndarray::{s, ArrayView2, ArrayViewMut2, ShapeBuilder};
use oxidize_seg_core::{Tensor, TensorError, TensorResult};
use rand::Rng;
use rayon::prelude::*;

use crate::init::{fan_in_uniform, kaiming_uniform};
use crate::module::{join, Module, TensorKind};

/// Upper bound on the im2col buffer, in floats (32 MiB).
const MAX_COL_FLOATS: usize = 8 * 1024 * 1024;

/// Hyper-parameters of a [`Conv2d`]. Square kernels, symmetric padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conv2dConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub dilation: usize,
    pub groups: usize,
    pub bias: bool,
}

impl Conv2dConfig {
    /// Stride 1, no padding, no dilation, one group, with bias.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Conv2dConfig {
            in_channels,
            out_channels,
            kernel_size,
            stride: 1,
            padding: 0,
            dilation: 1,
            groups: 1,
            bias: true,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    fn validate(&self) -> TensorResult<()> {
        let sizes = [
            ("in_channels", self.in_channels),
            ("out_channels", self.out_channels),
            ("kernel_size", self.kernel_size),
            ("stride", self.stride),
            ("dilation", self.dilation),
            ("groups", self.groups),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(TensorError::InvalidOperation(format!(
                "Conv2d {} must be positive",
                name
            )));
        }
        if self.in_channels % self.groups != 0 || self.out_channels % self.groups != 0 {
            return Err(TensorError::InvalidOperation(format!(
                "Conv2d channels ({} -> {}) must be divisible by groups ({})",
                self.in_channels, self.out_channels, self.groups
            )));
        }
        Ok(())
    }

    /// Build the layer with default initialisation drawn from `rng`.
    pub fn init<R: Rng + ?Sized>(&self, rng: &mut R) -> TensorResult<Conv2d> {
        self.validate()?;
        let k = self.kernel_size;
        let fan_in = self.in_channels / self.groups * k * k;
        let weight = kaiming_uniform(
            vec![self.out_channels, self.in_channels / self.groups, k, k],
            fan_in,
            5f64.sqrt(),
            rng,
        );
        let bias = self
            .bias
            .then(|| fan_in_uniform(vec![self.out_channels], fan_in, rng));
        Ok(Conv2d {
            config: self.clone(),
            weight,
            bias,
        })
    }
}

/// 2D convolution with stride, zero padding, dilation and channel groups.
///
/// Input shape:  `[batch, in_channels, height, width]`
/// Output shape: `[batch, out_channels, out_h, out_w]` where
/// `out = (in + 2 * padding - dilation * (kernel - 1) - 1) / stride + 1`.
///
/// Each group is lowered to im2col followed by a GEMM, tiled by output rows
/// so the column buffer stays bounded.
pub struct Conv2d {
    config: Conv2dConfig,
    pub weight: Tensor<f32>, // [out_channels, in_channels / groups, k, k]
    pub bias: Option<Tensor<f32>>, // [out_channels]
}

impl Conv2d {
    pub fn config(&self) -> &Conv2dConfig {
        &self.config
    }

    pub fn in_channels(&self) -> usize {
        self.config.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.config.out_channels
    }

    /// Spatial output size for an `h x w` input.
    pub fn output_size(&self, h: usize, w: usize) -> TensorResult<(usize, usize)> {
        let c = &self.config;
        let span = c.dilation * (c.kernel_size - 1) + 1;
        let dim = |len: usize| -> TensorResult<usize> {
            let padded = len + 2 * c.padding;
            if padded < span {
                return Err(TensorError::InvalidOperation(format!(
                    "Conv2d kernel span {} exceeds padded input size {}",
                    span, padded
                )));
            }
            Ok((padded - span) / c.stride + 1)
        };
        Ok((dim(h)?, dim(w)?))
    }

    /// Fill `cols` with the `[cin_g * k * k, tile_h * out_w]` patch matrix of
    /// one group for output rows `tile_start..tile_start + tile_h`.
    #[allow(clippy::too_many_arguments)]
    fn im2col(
        &self,
        group_input: &[f32],
        h: usize,
        w: usize,
        out_w: usize,
        tile_start: usize,
        tile_h: usize,
        cols: &mut [f32],
    ) {
        let c = &self.config;
        let (k, stride, pad, dil) = (c.kernel_size, c.stride, c.padding, c.dilation);
        let cin_g = c.in_channels / c.groups;
        let tile_spatial = tile_h * out_w;

        for ic in 0..cin_g {
            let plane = &group_input[ic * h * w..(ic + 1) * h * w];
            for kh in 0..k {
                for kw in 0..k {
                    let row_start = ((ic * k + kh) * k + kw) * tile_spatial;
                    let row = &mut cols[row_start..row_start + tile_spatial];
                    row.fill(0.0);

                    // Output columns whose tap lands inside the input row.
                    let dw = kw * dil;
                    let ow_lo = if dw < pad { (pad - dw).div_ceil(stride) } else { 0 };
                    let ow_hi = if w + pad > dw {
                        ((w + pad - dw - 1) / stride + 1).min(out_w)
                    } else {
                        0
                    };
                    if ow_lo >= ow_hi {
                        continue;
                    }
                    let iw_lo = ow_lo * stride + dw - pad;

                    for th in 0..tile_h {
                        let ih = ((tile_start + th) * stride + kh * dil) as isize - pad as isize;
                        if ih < 0 || ih >= h as isize {
                            continue;
                        }
                        let src = &plane[ih as usize * w..(ih as usize + 1) * w];
                        let dst = &mut row[th * out_w..(th + 1) * out_w];
                        if stride == 1 {
                            let n = ow_hi - ow_lo;
                            dst[ow_lo..ow_hi].copy_from_slice(&src[iw_lo..iw_lo + n]);
                        } else {
                            for (j, ow) in (ow_lo..ow_hi).enumerate() {
                                dst[ow] = src[iw_lo + j * stride];
                            }
                        }
                    }
                }
            }
        }
    }
}

fn layout_error(e: ndarray::ShapeError) -> TensorError {
    TensorError::InvalidOperation(format!("Conv2d buffer layout: {}", e))
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let [batch, c_in, h, w] = input.nchw()?;
        let c = &self.config;
        if c_in != c.in_channels {
            return Err(TensorError::ShapeMismatch {
                expected: vec![batch, c.in_channels, h, w],
                got: input.shape_vec(),
            });
        }
        let (out_h, out_w) = self.output_size(h, w)?;
        let c_out = c.out_channels;
        let cin_g = c.in_channels / c.groups;
        let cout_g = c_out / c.groups;
        let col_k = cin_g * c.kernel_size * c.kernel_size;
        let spatial_out = out_h * out_w;

        let weight = ArrayView2::from_shape((c_out, col_k), self.weight.data()).map_err(layout_error)?;
        let mut output = vec![0.0f32; batch * c_out * spatial_out];

        let tile_rows = (MAX_COL_FLOATS / (col_k * out_w)).clamp(1, out_h);
        let mut col_buf = vec![0.0f32; col_k * tile_rows * out_w];

        for b in 0..batch {
            let sample = &input.data()[b * c_in * h * w..(b + 1) * c_in * h * w];
            let out_sample = &mut output[b * c_out * spatial_out..(b + 1) * c_out * spatial_out];

            for g in 0..c.groups {
                let group_input = &sample[g * cin_g * h * w..(g + 1) * cin_g * h * w];
                let group_weight = weight.slice(s![g * cout_g..(g + 1) * cout_g, ..]);
                let group_out = &mut out_sample[g * cout_g * spatial_out..(g + 1) * cout_g * spatial_out];

                for tile_start in (0..out_h).step_by(tile_rows) {
                    let tile_h = (tile_start + tile_rows).min(out_h) - tile_start;
                    let tile_spatial = tile_h * out_w;
                    let cols = &mut col_buf[..col_k * tile_spatial];
                    self.im2col(group_input, h, w, out_w, tile_start, tile_h, cols);

                    let col_view = ArrayView2::from_shape((col_k, tile_spatial), &*cols)
                        .map_err(layout_error)?;
                    // Output rows of this group, restricted to the tile's columns.
                    let first = tile_start * out_w;
                    let span = (cout_g - 1) * spatial_out + tile_spatial;
                    let mut out_view = ArrayViewMut2::from_shape(
                        (cout_g, tile_spatial).strides((spatial_out, 1)),
                        &mut group_out[first..first + span],
                    )
                    .map_err(layout_error)?;
                    general_mat_mul(1.0, &group_weight, &col_view, 0.0, &mut out_view);
                }
            }
        }

        if let Some(bias) = &self.bias {
            let bias = bias.data();
            output
                .par_chunks_mut(spatial_out)
                .enumerate()
                .for_each(|(i, plane)| {
                    let v = bias[i % c_out];
                    plane.iter_mut().for_each(|x| *x += v);
                });
        }

        trace!(
            "conv2d {}x{} d{}: {} -> [{}, {}, {}, {}]",
            c.kernel_size,
            c.kernel_size,
            c.dilation,
            input.shape(),
            batch,
            c_out,
            out_h,
            out_w
        );
        Tensor::new(output, vec![batch, c_out, out_h, out_w])
    }

    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor<f32>, TensorKind)) {
        f(&join(prefix, "weight"), &self.weight, TensorKind::Parameter);
        if let Some(bias) = &self.bias {
            f(&join(prefix, "bias"), bias, TensorKind::Parameter);
        }
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Tensor<f32>, TensorKind)) {
        f(&join(prefix, "weight"), &mut self.weight, TensorKind::Parameter);
        if let Some(bias) = &mut self.bias {
            f(&join(prefix, "bias"), bias, TensorKind::Parameter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    /// One output element computed directly from the definition.
    fn reference_at(conv: &Conv2d, input: &Tensor<f32>, b: usize, oc: usize, y: usize, x: usize) -> f32 {
        let c = conv.config();
        let [_, _, h, w] = input.nchw().unwrap();
        let cin_g = c.in_channels / c.groups;
        let g = oc / (c.out_channels / c.groups);
        let mut acc = conv.bias.as_ref().map_or(0.0, |b| b.data()[oc]);
        for ic in 0..cin_g {
            for kh in 0..c.kernel_size {
                for kw in 0..c.kernel_size {
                    let iy = (y * c.stride + kh * c.dilation) as isize - c.padding as isize;
                    let ix = (x * c.stride + kw * c.dilation) as isize - c.padding as isize;
                    if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize {
                        continue;
                    }
                    let xv = input.get(&[b, g * cin_g + ic, iy as usize, ix as usize]).unwrap();
                    acc += xv * conv.weight.get(&[oc, ic, kh, kw]).unwrap();
                }
            }
        }
        acc
    }

    fn reference_conv(conv: &Conv2d, input: &Tensor<f32>) -> Tensor<f32> {
        let [n, _, h, w] = input.nchw().unwrap();
        let (oh, ow) = conv.output_size(h, w).unwrap();
        let c_out = conv.out_channels();
        let mut out = Tensor::zeros(vec![n, c_out, oh, ow]);
        for b in 0..n {
            for oc in 0..c_out {
                for y in 0..oh {
                    for x in 0..ow {
                        out.set(&[b, oc, y, x], reference_at(conv, input, b, oc, y, x)).unwrap();
                    }
                }
            }
        }
        out
    }

    #[test]
    fn test_conv2d_valid() {
        let conv = Conv2dConfig::new(1, 2, 3).init(&mut rng()).unwrap();
        let input = Tensor::new((0..16).map(|i| i as f32).collect(), vec![1, 1, 4, 4]).unwrap();
        let out = conv.forward(&input).unwrap();
        assert_eq!(out.shape_vec(), vec![1, 2, 2, 2]); // (4-3)/1+1 = 2
    }

    #[test]
    fn test_conv2d_hand_computed() {
        let mut conv = Conv2dConfig::new(1, 1, 3).with_padding(1).with_bias(false).init(&mut rng()).unwrap();
        conv.weight = Tensor::ones(vec![1, 1, 3, 3]);
        let input = Tensor::new((1..=9).map(|i| i as f32).collect(), vec![1, 1, 3, 3]).unwrap();
        let out = conv.forward(&input).unwrap();
        // 3x3 box sums with zero padding
        assert_eq!(out.data(), &[12.0, 21.0, 16.0, 27.0, 45.0, 33.0, 24.0, 39.0, 28.0]);
    }

    #[test]
    fn test_conv2d_dilated_keeps_size() {
        for rate in [1, 2, 6] {
            let conv = Conv2dConfig::new(3, 4, 3)
                .with_padding(rate)
                .with_dilation(rate)
                .with_bias(false)
                .init(&mut rng())
                .unwrap();
            let input = Tensor::randn(vec![2, 3, 9, 7], Some(1));
            let out = conv.forward(&input).unwrap();
            assert_eq!(out.shape_vec(), vec![2, 4, 9, 7]);
            let expected = reference_conv(&conv, &input);
            assert_abs_diff_eq!(out.max_abs_diff(&expected).unwrap(), 0.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_conv2d_strided_matches_reference() {
        let conv = Conv2dConfig::new(2, 3, 3)
            .with_stride(2)
            .with_padding(2)
            .with_dilation(2)
            .init(&mut rng())
            .unwrap();
        let input = Tensor::randn(vec![1, 2, 8, 11], Some(3));
        let out = conv.forward(&input).unwrap();
        let expected = reference_conv(&conv, &input);
        assert_eq!(out.shape_vec(), expected.shape_vec());
        assert_abs_diff_eq!(out.max_abs_diff(&expected).unwrap(), 0.0, epsilon = 1e-4);
    }

    #[test]
    fn test_conv2d_depthwise() {
        let conv = Conv2dConfig::new(4, 4, 3)
            .with_padding(1)
            .with_groups(4)
            .with_bias(false)
            .init(&mut rng())
            .unwrap();
        assert_eq!(conv.weight.shape_vec(), vec![4, 1, 3, 3]);
        let input = Tensor::randn(vec![1, 4, 5, 5], Some(9));
        let out = conv.forward(&input).unwrap();
        let expected = reference_conv(&conv, &input);
        assert_abs_diff_eq!(out.max_abs_diff(&expected).unwrap(), 0.0, epsilon = 1e-4);
    }

    #[test]
    fn test_conv2d_pointwise_bias() {
        let mut conv = Conv2dConfig::new(2, 1, 1).init(&mut rng()).unwrap();
        conv.weight = Tensor::new(vec![2.0, -1.0], vec![1, 2, 1, 1]).unwrap();
        conv.bias = Some(Tensor::from_slice(&[0.5]));
        let input = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![1, 2, 1, 2]).unwrap();
        let out = conv.forward(&input).unwrap();
        assert_eq!(out.data(), &[2.0 - 3.0 + 0.5, 4.0 - 4.0 + 0.5]);
    }

    #[test]
    fn test_conv2d_row_tiles() {
        // col_k * out_w = 576 * 256 forces a tile of 56 rows over 64 output rows.
        let conv = Conv2dConfig::new(64, 1, 3).with_padding(1).init(&mut rng()).unwrap();
        let input = Tensor::randn(vec![1, 64, 64, 256], Some(5));
        let out = conv.forward(&input).unwrap();
        assert_eq!(out.shape_vec(), vec![1, 1, 64, 256]);
        for (y, x) in [(0, 0), (55, 17), (56, 17), (56, 255), (63, 128)] {
            let expected = reference_at(&conv, &input, 0, 0, y, x);
            assert_abs_diff_eq!(out.get(&[0, 0, y, x]).unwrap(), expected, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_conv2d_errors() {
        assert!(Conv2dConfig::new(3, 4, 3).with_groups(2).init(&mut rng()).is_err());
        assert!(Conv2dConfig::new(3, 4, 0).init(&mut rng()).is_err());

        let conv = Conv2dConfig::new(3, 4, 3).init(&mut rng()).unwrap();
        let wrong_channels = Tensor::zeros(vec![1, 2, 5, 5]);
        assert!(matches!(
            conv.forward(&wrong_channels),
            Err(TensorError::ShapeMismatch { .. })
        ));
        let too_small = Tensor::zeros(vec![1, 3, 2, 2]);
        assert!(conv.forward(&too_small).is_err());
        let rank3 = Tensor::zeros(vec![3, 5, 5]);
        assert!(conv.forward(&rank3).is_err());
    }

    #[test]
    fn test_conv2d_parameter_names() {
        let conv = Conv2dConfig::new(2, 3, 1).init(&mut rng()).unwrap();
        assert_eq!(conv.parameter_names(), vec!["weight", "bias"]);
        assert_eq!(conv.num_parameters(), 3 * 2 + 3);

        let no_bias = Conv2dConfig::new(2, 3, 1).with_bias(false).init(&mut rng()).unwrap();
        assert_eq!(no_bias.parameter_names(), vec!["weight"]);
    }
}
