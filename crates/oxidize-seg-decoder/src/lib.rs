//! DeepLabV3 decoder head: Atrous Spatial Pyramid Pooling over the deepest
//! encoder feature map, followed by a 3x3 refinement stage.
//!
//! ```no_run
//! use oxidize_seg_core::Tensor;
//! use oxidize_seg_decoder::{DecoderConfig, DeepLabV3Decoder};
//!
//! let config = DecoderConfig::new(2048).with_atrous_rates(&[6, 12, 18]);
//! let decoder = DeepLabV3Decoder::from_config(&config)?;
//! let features = vec![Tensor::zeros(vec![1, 2048, 32, 32])];
//! let decoded = decoder.forward_features(&features)?;
//! assert_eq!(decoded.shape_vec(), vec![1, decoder.out_channels(), 32, 32]);
//! # Ok::<(), oxidize_seg_decoder::DecoderError>(())
//! ```

pub mod aspp;
pub mod config;
pub mod decoder;
pub mod error;
pub mod separable;

pub use aspp::{Aspp, AsppConv, AsppPooling, AsppSeparableConv, NUM_BRANCHES};
pub use config::{DecoderConfig, DEFAULT_ATROUS_RATES, DEFAULT_OUT_CHANNELS, DEFAULT_SEED};
pub use decoder::DeepLabV3Decoder;
pub use error::{DecoderError, DecoderResult};
pub use separable::SeparableConv2d;
