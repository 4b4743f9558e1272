use oxidize_seg_core::{Tensor, TensorResult};
use oxidize_seg_nn::{join, Conv2d, Conv2dConfig, Module, TensorKind};
use rand::Rng;

/// Depthwise-separable convolution.
///
/// A depthwise conv (one filter per input channel, no bias) carries the
/// spatial kernel, stride, padding and dilation; a pointwise 1x1 conv then
/// mixes channels. Tensors are named `0.*` (depthwise) and `1.*` (pointwise).
pub struct SeparableConv2d {
    pub depthwise: Conv2d,
    pub pointwise: Conv2d,
}

impl SeparableConv2d {
    /// `spatial` supplies the kernel size, stride, padding and dilation of the
    /// depthwise stage; its channel counts, groups and bias are overridden.
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        spatial: &Conv2dConfig,
        bias: bool,
        rng: &mut R,
    ) -> TensorResult<Self> {
        let depthwise = Conv2dConfig::new(in_channels, in_channels, spatial.kernel_size)
            .with_stride(spatial.stride)
            .with_padding(spatial.padding)
            .with_dilation(spatial.dilation)
            .with_groups(in_channels)
            .with_bias(false)
            .init(rng)?;
        let pointwise = Conv2dConfig::new(in_channels, out_channels, 1)
            .with_bias(bias)
            .init(rng)?;
        Ok(SeparableConv2d {
            depthwise,
            pointwise,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.pointwise.out_channels()
    }
}

impl Module for SeparableConv2d {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let x = self.depthwise.forward(input)?;
        self.pointwise.forward(&x)
    }

    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor<f32>, TensorKind)) {
        self.depthwise.visit(&join(prefix, "0"), f);
        self.pointwise.visit(&join(prefix, "1"), f);
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Tensor<f32>, TensorKind)) {
        self.depthwise.visit_mut(&join(prefix, "0"), f);
        self.pointwise.visit_mut(&join(prefix, "1"), f);
    }
}
