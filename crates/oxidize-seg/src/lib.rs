//! # oxidize-seg
//!
//! Segmentation decoder layers written in pure Rust.
//!
//! ## Modules
//!
//! - **core**: Tensor engine: flat row-major arrays, concatenation, reductions
//! - **nn**: Layers: Conv2d (dilation, groups), BatchNorm2d, ReLU, AdaptiveAvgPool2d, bilinear interpolation, Sequential, StateDict
//! - **decoder**: DeepLabV3: SeparableConv2d, ASPP branches, Aspp, DeepLabV3Decoder, DecoderConfig

/// Core tensor engine.
pub use oxidize_seg_core as core;

/// Neural network layers.
pub use oxidize_seg_nn as nn;

/// ASPP and the DeepLabV3 decoder head.
pub use oxidize_seg_decoder as decoder;

pub use oxidize_seg_decoder::{DecoderConfig, DeepLabV3Decoder};
