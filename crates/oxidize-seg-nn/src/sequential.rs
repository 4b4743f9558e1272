use oxidize_seg_core::{Tensor, TensorResult};

use crate::module::{join, Module, TensorKind};

/// Sequential model: chains layers in order.
///
/// Children are named by position (`"0"`, `"1"`, ...), so a conv followed by
/// a batch norm exposes `0.weight`, `1.weight`, `1.running_mean` and so on.
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new() -> Self {
        Sequential { layers: Vec::new() }
    }

    /// Add a layer to the model.
    pub fn add(mut self, layer: Box<dyn Module>) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        match self.layers.split_first() {
            None => Ok(input.clone()),
            Some((first, rest)) => {
                let x = first.forward(input)?;
                rest.iter().try_fold(x, |x, layer| layer.forward_owned(x))
            }
        }
    }

    fn forward_owned(&self, input: Tensor<f32>) -> TensorResult<Tensor<f32>> {
        self.layers
            .iter()
            .try_fold(input, |x, layer| layer.forward_owned(x))
    }

    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor<f32>, TensorKind)) {
        for (i, layer) in self.layers.iter().enumerate() {
            layer.visit(&join(prefix, &i.to_string()), f);
        }
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Tensor<f32>, TensorKind)) {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.visit_mut(&join(prefix, &i.to_string()), f);
        }
    }

    fn set_training(&mut self, training: bool) {
        for layer in &mut self.layers {
            layer.set_training(training);
        }
    }
}

impl Default for Sequential {
    fn default() -> Self {
        Self::new()
    }
}
