// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::{SE3Error, SE3Result};
use st_tensor::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Trainable parameter with plain Euclidean gradient accumulation.
#[derive(Clone, Debug)]
pub struct Parameter {
    name: String,
    value: Tensor,
    gradient: Option<Tensor>,
}

impl Parameter {
    /// Creates a new parameter with the provided tensor value.
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            gradient: None,
        }
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provides an immutable view into the underlying tensor value.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Provides a mutable view into the underlying tensor value.
    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    /// Returns the currently accumulated gradient, if any.
    pub fn gradient(&self) -> Option<&Tensor> {
        self.gradient.as_ref()
    }

    fn assert_shape(&self, tensor: &Tensor) -> PureResult<()> {
        if self.value.shape() != tensor.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.value.shape(),
                right: tensor.shape(),
            });
        }
        Ok(())
    }

    /// Accumulates a Euclidean gradient update into the local buffer.
    pub fn accumulate_euclidean(&mut self, update: &Tensor) -> PureResult<()> {
        self.assert_shape(update)?;
        match self.gradient.as_mut() {
            Some(existing) => existing.add_scaled(update, 1.0)?,
            None => {
                self.gradient = Some(update.clone());
            }
        }
        Ok(())
    }

    /// Clears the cached gradient.
    pub fn zero_gradient(&mut self) {
        if let Some(grad) = self.gradient.as_mut() {
            for value in grad.data_mut() {
                *value = 0.0;
            }
        }
    }

    /// Applies the accumulated update with the supplied learning rate and
    /// resets the accumulator.
    pub fn apply_step(&mut self, learning_rate: f64) -> PureResult<()> {
        if let Some(grad) = self.gradient.as_mut() {
            self.value.add_scaled(grad, -learning_rate)?;
            for value in grad.data_mut() {
                *value = 0.0;
            }
        }
        Ok(())
    }

    /// Replaces the parameter value with the provided tensor.
    pub fn load_value(&mut self, value: &Tensor) -> PureResult<()> {
        self.assert_shape(value)?;
        self.value = value.clone();
        Ok(())
    }
}

/// High-level module trait in the `nn.Module` style, expressed in pure Rust.
///
/// Layers whose forward pass needs geometry arguments beyond a single feature
/// tensor (the point-cloud convolutions) expose inherent `forward` methods
/// instead of implementing this trait.
pub trait Module {
    /// Runs a forward pass.
    fn forward(&self, input: &Tensor) -> SE3Result<Tensor>;

    /// Propagates a gradient backwards. Implementations populate the relevant
    /// parameter accumulators before returning the gradient with respect to
    /// `input`.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> SE3Result<Tensor>;

    /// Visits immutable parameters.
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> SE3Result<()>,
    ) -> SE3Result<()>;

    /// Visits mutable parameters.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> SE3Result<()>,
    ) -> SE3Result<()>;

    /// Applies every parameter update.
    fn apply_step(&mut self, learning_rate: f64) -> SE3Result<()> {
        self.visit_parameters_mut(&mut |param| {
            param.apply_step(learning_rate)?;
            Ok(())
        })
    }

    /// Clears accumulators across every parameter.
    fn zero_accumulators(&mut self) -> SE3Result<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }

    /// Captures a copy of every parameter tensor keyed by its canonical name.
    fn state_dict(&self) -> SE3Result<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores parameters from a state dictionary produced by
    /// [`Module::state_dict`].
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> SE3Result<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(SE3Error::Tensor(TensorError::MissingParameter {
                    name: param.name().to_string(),
                }));
            };
            param.load_value(value)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_accumulates_and_steps() {
        let mut param = Parameter::new("radial", Tensor::zeros(2, 2).unwrap());
        let update = Tensor::from_vec(2, 2, vec![1.0, 0.0, 0.0, -1.0]).unwrap();
        param.accumulate_euclidean(&update).unwrap();
        param.accumulate_euclidean(&update).unwrap();
        assert_eq!(param.gradient().unwrap().data()[0], 2.0);
        param.apply_step(0.5).unwrap();
        assert_eq!(param.value().data()[0], -1.0);
        assert_eq!(param.gradient().unwrap().squared_l2_norm(), 0.0);
    }

    #[test]
    fn parameter_rejects_mismatched_updates() {
        let mut param = Parameter::new("radial", Tensor::zeros(2, 2).unwrap());
        let update = Tensor::zeros(1, 2).unwrap();
        assert!(param.accumulate_euclidean(&update).is_err());
    }
}
