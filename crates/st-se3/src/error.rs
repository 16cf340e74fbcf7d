// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use st_tensor::TensorError;
use thiserror::Error;

/// Result alias used throughout the equivariant stack.
pub type SE3Result<T> = std::result::Result<T, SE3Error>;

/// Errors surfaced by kernel constructors and layers.
///
/// Configuration violations are raised eagerly at call time and never
/// deferred; there is no retry path because every operation here is a pure,
/// deterministic tensor computation.
#[derive(Debug, Error)]
pub enum SE3Error {
    /// Invalid or missing required arguments.
    #[error("configuration error in {context}: {reason}")]
    Configuration {
        context: &'static str,
        reason: String,
    },
    /// Failure propagated from the tensor runtime.
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

impl SE3Error {
    /// Shorthand for a [`SE3Error::Configuration`] value.
    pub fn config(context: &'static str, reason: impl Into<String>) -> Self {
        SE3Error::Configuration {
            context,
            reason: reason.into(),
        }
    }
}
