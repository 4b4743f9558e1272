//! Atrous Spatial Pyramid Pooling.
//!
//! Five branches look at the same feature map with different receptive
//! fields: a 1x1 projection, three dilated 3x3 convolutions and an
//! image-level pooling branch. Their outputs are stacked along channels and
//! projected back to `out_channels`.

use log::{debug, trace};
use oxidize_seg_core::{Tensor, TensorResult};
use oxidize_seg_nn::{
    interpolate_bilinear, join, AdaptiveAvgPool2d, BatchNorm2d, Conv2dConfig, Module, ReLU,
    Sequential, TensorKind,
};
use rand::Rng;
use rayon::prelude::*;

use crate::config::validate_rates;
use crate::error::DecoderResult;
use crate::separable::SeparableConv2d;

/// Number of parallel branches.
pub const NUM_BRANCHES: usize = 5;

/// Forward `Module` calls to an inner [`Sequential`] stored as `block`.
macro_rules! delegate_to_block {
    ($name:ident) => {
        impl Module for $name {
            fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
                self.block.forward(input)
            }

            fn forward_owned(&self, input: Tensor<f32>) -> TensorResult<Tensor<f32>> {
                self.block.forward_owned(input)
            }

            fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor<f32>, TensorKind)) {
                self.block.visit(prefix, f)
            }

            fn visit_mut(
                &mut self,
                prefix: &str,
                f: &mut dyn FnMut(&str, &mut Tensor<f32>, TensorKind),
            ) {
                self.block.visit_mut(prefix, f)
            }

            fn set_training(&mut self, training: bool) {
                self.block.set_training(training)
            }
        }
    };
}

/// conv -> batch norm -> ReLU
fn conv_bn_relu(conv: Box<dyn Module>, out_channels: usize) -> Sequential {
    Sequential::new()
        .add(conv)
        .add(Box::new(BatchNorm2d::new(out_channels)))
        .add(Box::new(ReLU))
}

/// Dilated 3x3 conv (no bias) -> BN -> ReLU. Padding equals the rate, so the
/// spatial size is kept.
pub struct AsppConv {
    block: Sequential,
}

impl AsppConv {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        dilation: usize,
        rng: &mut R,
    ) -> TensorResult<Self> {
        let conv = Conv2dConfig::new(in_channels, out_channels, 3)
            .with_padding(dilation)
            .with_dilation(dilation)
            .with_bias(false)
            .init(rng)?;
        Ok(AsppConv {
            block: conv_bn_relu(Box::new(conv), out_channels),
        })
    }
}

delegate_to_block!(AsppConv);

/// [`AsppConv`] with the dilated conv factored into depthwise + pointwise.
pub struct AsppSeparableConv {
    block: Sequential,
}

impl AsppSeparableConv {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        dilation: usize,
        rng: &mut R,
    ) -> TensorResult<Self> {
        let spatial = Conv2dConfig::new(in_channels, out_channels, 3)
            .with_padding(dilation)
            .with_dilation(dilation);
        let conv = SeparableConv2d::new(in_channels, out_channels, &spatial, false, rng)?;
        Ok(AsppSeparableConv {
            block: conv_bn_relu(Box::new(conv), out_channels),
        })
    }
}

delegate_to_block!(AsppSeparableConv);

/// Image-level features: global average pool -> 1x1 conv -> BN -> ReLU, then
/// bilinear upsampling (`align_corners = false`) back to the input size.
pub struct AsppPooling {
    block: Sequential,
}

impl AsppPooling {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        rng: &mut R,
    ) -> TensorResult<Self> {
        let conv = Conv2dConfig::new(in_channels, out_channels, 1)
            .with_bias(false)
            .init(rng)?;
        let block = Sequential::new()
            .add(Box::new(AdaptiveAvgPool2d::global()))
            .add(Box::new(conv))
            .add(Box::new(BatchNorm2d::new(out_channels)))
            .add(Box::new(ReLU));
        Ok(AsppPooling { block })
    }
}

impl Module for AsppPooling {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let [_, _, h, w] = input.nchw()?;
        let pooled = self.block.forward(input)?;
        interpolate_bilinear(&pooled, (h, w), false)
    }

    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor<f32>, TensorKind)) {
        self.block.visit(prefix, f)
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Tensor<f32>, TensorKind)) {
        self.block.visit_mut(prefix, f)
    }

    fn set_training(&mut self, training: bool) {
        self.block.set_training(training)
    }
}

/// The ASPP block.
///
/// Tensors are named `convs.{i}.*` for branch `i` (1x1, the three atrous
/// rates in the order given, pooling) and `conv1x1.*` for the fusion stage.
pub struct Aspp {
    in_channels: usize,
    out_channels: usize,
    rates: [usize; 3],
    separable: bool,
    convs: Vec<Box<dyn Module>>,
    conv1x1: Sequential,
}

impl Aspp {
    /// Build the block. `atrous_rates` must hold exactly three positive rates.
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        atrous_rates: &[usize],
        separable: bool,
        rng: &mut R,
    ) -> DecoderResult<Self> {
        let rates = validate_rates(atrous_rates)?;

        let projection = Conv2dConfig::new(in_channels, out_channels, 1)
            .with_bias(false)
            .init(rng)?;
        let mut convs: Vec<Box<dyn Module>> = Vec::with_capacity(NUM_BRANCHES);
        convs.push(Box::new(conv_bn_relu(Box::new(projection), out_channels)));
        for &rate in &rates {
            if separable {
                convs.push(Box::new(AsppSeparableConv::new(in_channels, out_channels, rate, rng)?));
            } else {
                convs.push(Box::new(AsppConv::new(in_channels, out_channels, rate, rng)?));
            }
        }
        convs.push(Box::new(AsppPooling::new(in_channels, out_channels, rng)?));

        let fuse = Conv2dConfig::new(NUM_BRANCHES * out_channels, out_channels, 1).init(rng)?;
        let conv1x1 = conv_bn_relu(Box::new(fuse), out_channels);

        let aspp = Aspp {
            in_channels,
            out_channels,
            rates,
            separable,
            convs,
            conv1x1,
        };
        debug!(
            "ASPP {} -> {} channels, rates {:?}, separable = {}, {} parameters",
            in_channels,
            out_channels,
            rates,
            separable,
            aspp.num_parameters()
        );
        Ok(aspp)
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn atrous_rates(&self) -> [usize; 3] {
        self.rates
    }

    pub fn is_separable(&self) -> bool {
        self.separable
    }

    /// Branch outputs in concatenation order, each `(N, out_channels, H, W)`.
    pub fn branch_outputs(&self, input: &Tensor<f32>) -> TensorResult<Vec<Tensor<f32>>> {
        self.convs.par_iter().map(|branch| branch.forward(input)).collect()
    }
}

impl Module for Aspp {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let stacked = {
            let branches = self.branch_outputs(input)?;
            let refs: Vec<&Tensor<f32>> = branches.iter().collect();
            Tensor::concatenate(&refs, 1)?
        };
        let output = self.conv1x1.forward_owned(stacked)?;
        trace!("aspp: {} -> {}", input.shape(), output.shape());
        Ok(output)
    }

    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor<f32>, TensorKind)) {
        let convs = join(prefix, "convs");
        for (i, branch) in self.convs.iter().enumerate() {
            branch.visit(&join(&convs, &i.to_string()), f);
        }
        self.conv1x1.visit(&join(prefix, "conv1x1"), f);
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Tensor<f32>, TensorKind)) {
        let convs = join(prefix, "convs");
        for (i, branch) in self.convs.iter_mut().enumerate() {
            branch.visit_mut(&join(&convs, &i.to_string()), f);
        }
        self.conv1x1.visit_mut(&join(prefix, "conv1x1"), f);
    }

    fn set_training(&mut self, training: bool) {
        for branch in &mut self.convs {
            branch.set_training(training);
        }
        self.conv1x1.set_training(training);
    }
}
