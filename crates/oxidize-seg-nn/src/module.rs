use oxidize_seg_core::{Tensor, TensorError, TensorResult};
use serde::{Deserialize, Serialize};

/// Whether a named tensor is learned or only tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorKind {
    /// Updated by an optimizer (conv weights, norm affine terms).
    Parameter,
    /// Statistics carried alongside the parameters (norm running mean/var).
    Buffer,
}

/// The base trait for all neural network modules.
///
/// Feature maps are `(batch, channels, height, width)` tensors. Modules own
/// their tensors and never change them during `forward`; an external
/// training procedure reaches them through [`Module::visit_mut`] or
/// [`Module::load_state_dict`].
pub trait Module: Send + Sync {
    /// Forward pass.
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>>;

    /// Forward pass that may reuse the input buffer.
    fn forward_owned(&self, input: Tensor<f32>) -> TensorResult<Tensor<f32>> {
        self.forward(&input)
    }

    /// Call `f` for every tensor owned by this module and its children,
    /// with names joined by `.` under `prefix`.
    fn visit(&self, _prefix: &str, _f: &mut dyn FnMut(&str, &Tensor<f32>, TensorKind)) {}

    fn visit_mut(
        &mut self,
        _prefix: &str,
        _f: &mut dyn FnMut(&str, &mut Tensor<f32>, TensorKind),
    ) {
    }

    /// Switch between batch statistics (training) and running statistics.
    fn set_training(&mut self, _training: bool) {}

    /// Total number of learned scalars.
    fn num_parameters(&self) -> usize {
        let mut n = 0;
        self.visit("", &mut |_, t, kind| {
            if kind == TensorKind::Parameter {
                n += t.numel();
            }
        });
        n
    }

    /// Names of learned parameters in registration order.
    fn parameter_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.visit("", &mut |name, _, kind| {
            if kind == TensorKind::Parameter {
                names.push(name.to_string());
            }
        });
        names
    }

    /// Snapshot of every parameter and buffer.
    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        self.visit("", &mut |name, t, _| state.insert(name, t.clone()));
        state
    }

    /// Overwrite parameters and buffers from `state`.
    ///
    /// Strict: every key must be present with a matching shape and no extra
    /// keys are allowed. Nothing is written unless the whole dict checks out.
    fn load_state_dict(&mut self, state: &StateDict) -> TensorResult<()> {
        let mut expected = Vec::new();
        let mut problem: Option<TensorError> = None;
        self.visit("", &mut |name, t, _| {
            expected.push(name.to_string());
            if problem.is_some() {
                return;
            }
            match state.get(name) {
                None => {
                    problem = Some(TensorError::InvalidOperation(format!(
                        "missing key in state dict: {}",
                        name
                    )))
                }
                Some(src) if src.shape() != t.shape() => {
                    problem = Some(TensorError::ShapeMismatch {
                        expected: t.shape_vec(),
                        got: src.shape_vec(),
                    })
                }
                Some(_) => {}
            }
        });
        if let Some(err) = problem {
            return Err(err);
        }
        if let Some(extra) = state.keys().find(|k| !expected.iter().any(|e| e.as_str() == *k)) {
            return Err(TensorError::InvalidOperation(format!(
                "unexpected key in state dict: {}",
                extra
            )));
        }

        self.visit_mut("", &mut |name, t, _| {
            if let Some(src) = state.get(name) {
                t.data_mut().copy_from_slice(src.data());
            }
        });
        Ok(())
    }
}

/// Join a child name onto a dotted prefix.
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Ordered collection of named tensors, as produced by [`Module::state_dict`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    entries: Vec<(String, Tensor<f32>)>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `name`.
    pub fn insert(&mut self, name: &str, tensor: Tensor<f32>) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = tensor,
            None => self.entries.push((name.to_string(), tensor)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor<f32>> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor<f32>> {
        self.entries.iter_mut().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn remove(&mut self, name: &str) -> Option<Tensor<f32>> {
        let idx = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor<f32>)> {
        self.entries.iter().map(|(n, t)| (n.as_str(), t))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
