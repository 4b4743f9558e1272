use log::{debug, trace};
use oxidize_seg_core::{Tensor, TensorError, TensorResult};
use oxidize_seg_nn::{join, BatchNorm2d, Conv2d, Conv2dConfig, Module, ReLU, TensorKind};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::aspp::Aspp;
use crate::config::DecoderConfig;
use crate::error::{DecoderError, DecoderResult};

/// DeepLabV3 decoder head.
///
/// Runs [`Aspp`] on the deepest encoder feature map and refines the result
/// with a 3x3 conv (padding 1, no bias) -> BN -> ReLU. Spatial size is kept
/// and the output has `out_channels` channels.
///
/// Tensor names follow a sequential layout: `0.*` for the ASPP block,
/// `1.weight` for the refinement conv and `2.*` for its batch norm.
pub struct DeepLabV3Decoder {
    config: DecoderConfig,
    aspp: Aspp,
    conv: Conv2d,
    bn: BatchNorm2d,
    relu: ReLU,
}

impl DeepLabV3Decoder {
    /// Decoder with default width (256) and rates (12, 24, 36).
    pub fn new(in_channels: usize) -> DecoderResult<Self> {
        Self::from_config(&DecoderConfig::new(in_channels))
    }

    pub fn from_config(config: &DecoderConfig) -> DecoderResult<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let out = config.out_channels;

        let aspp = Aspp::new(
            config.in_channels,
            out,
            &config.atrous_rates,
            config.separable,
            &mut rng,
        )?;
        let conv = Conv2dConfig::new(out, out, 3)
            .with_padding(1)
            .with_bias(false)
            .init(&mut rng)?;

        let decoder = DeepLabV3Decoder {
            config: config.clone(),
            aspp,
            conv,
            bn: BatchNorm2d::new(out),
            relu: ReLU,
        };
        debug!(
            "DeepLabV3 decoder {} -> {} channels, {} parameters",
            config.in_channels,
            out,
            decoder.num_parameters()
        );
        Ok(decoder)
    }

    /// Decode a multi-scale feature list. Only the last (deepest) map is used.
    pub fn forward_features(&self, features: &[Tensor<f32>]) -> DecoderResult<Tensor<f32>> {
        let deepest = features
            .last()
            .ok_or(DecoderError::Tensor(TensorError::EmptyTensor))?;
        if features.len() > 1 {
            trace!("decoder: ignoring {} shallower feature maps", features.len() - 1);
        }
        Ok(self.forward(deepest)?)
    }

    /// Channels of the decoded feature map, for sizing a segmentation head.
    pub fn out_channels(&self) -> usize {
        self.config.out_channels
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn aspp(&self) -> &Aspp {
        &self.aspp
    }
}

impl Module for DeepLabV3Decoder {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let x = self.aspp.forward(input)?;
        let x = self.conv.forward(&x)?;
        let x = self.bn.forward_owned(x)?;
        let output = self.relu.forward_owned(x)?;
        trace!("deeplabv3 decoder: {} -> {}", input.shape(), output.shape());
        Ok(output)
    }

    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor<f32>, TensorKind)) {
        self.aspp.visit(&join(prefix, "0"), f);
        self.conv.visit(&join(prefix, "1"), f);
        self.bn.visit(&join(prefix, "2"), f);
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Tensor<f32>, TensorKind)) {
        self.aspp.visit_mut(&join(prefix, "0"), f);
        self.conv.visit_mut(&join(prefix, "1"), f);
        self.bn.visit_mut(&join(prefix, "2"), f);
    }

    fn set_training(&mut self, training: bool) {
        self.aspp.set_training(training);
        self.bn.set_training(training);
    }
}
