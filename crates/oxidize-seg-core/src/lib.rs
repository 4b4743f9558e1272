//! Tensor engine underneath the oxidize-seg layers: a flat row-major buffer
//! plus a [`Shape`], generic over [`Float`] scalars.

pub mod tensor;
pub mod shape;
pub mod dtype;
pub mod error;

pub use tensor::Tensor;
pub use shape::Shape;
pub use dtype::Float;
pub use error::{TensorError, TensorResult};
