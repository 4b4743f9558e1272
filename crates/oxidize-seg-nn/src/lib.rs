//! Inference layers for NCHW feature maps: convolution, batch norm, pooling,
//! bilinear resize and the [`Module`] plumbing that names their tensors.

pub mod activation;
pub mod conv;
pub mod init;
pub mod module;
pub mod norm;
pub mod pool;
pub mod sequential;
pub mod upsample;

pub use activation::ReLU;
pub use conv::{Conv2d, Conv2dConfig};
pub use module::{join, Module, StateDict, TensorKind};
pub use norm::BatchNorm2d;
pub use pool::AdaptiveAvgPool2d;
pub use sequential::Sequential;
pub use upsample::interpolate_bilinear;
