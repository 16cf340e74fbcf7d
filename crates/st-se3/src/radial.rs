// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Radial basis strategies.
//!
//! A kernel constructor owns a learned weight matrix of shape
//! `[paths, basis.dim()]`; the radial profile of a path at radius `r` is the
//! dot product of its weight row with the basis evaluated at `r`. Swapping
//! the basis strategy is how callers inject alternative radial models.

use crate::error::{SE3Error, SE3Result};
use std::fmt;

/// Capability interface mapping a scalar radius to basis-function values.
pub trait RadialBasis: fmt::Debug + Send + Sync {
    /// Number of basis functions.
    fn dim(&self) -> usize;

    /// Evaluates every basis function at `radius` into `out`
    /// (`out.len() == self.dim()`).
    fn evaluate_into(&self, radius: f64, out: &mut [f64]);

    /// Convenience allocation wrapper around
    /// [`RadialBasis::evaluate_into`].
    fn evaluate(&self, radius: f64) -> Vec<f64> {
        let mut out = vec![0.0; self.dim()];
        self.evaluate_into(radius, &mut out);
        out
    }
}

/// Gaussian bumps on an even grid over `[0, max_radius]`, windowed to zero
/// beyond `max_radius` so grid-boundary aliasing cannot leak into the kernel.
#[derive(Clone, Debug)]
pub struct GaussianRadialBasis {
    centers: Vec<f64>,
    sigma: f64,
    max_radius: f64,
}

impl GaussianRadialBasis {
    /// Builds `count` Gaussians, each 0.6 of the center spacing wide.
    pub fn new(max_radius: f64, count: usize) -> SE3Result<Self> {
        if count == 0 {
            return Err(SE3Error::config(
                "radial_basis",
                "at least one radial center is required",
            ));
        }
        if !(max_radius > 0.0) {
            return Err(SE3Error::config(
                "radial_basis",
                format!("max_radius must be positive, got {max_radius}"),
            ));
        }
        let spacing = if count == 1 {
            max_radius
        } else {
            max_radius / (count - 1) as f64
        };
        let centers = (0..count)
            .map(|i| {
                if count == 1 {
                    0.0
                } else {
                    max_radius * i as f64 / (count - 1) as f64
                }
            })
            .collect();
        Ok(Self {
            centers,
            sigma: 0.6 * spacing,
            max_radius,
        })
    }

    /// Outer radius of the window.
    pub fn max_radius(&self) -> f64 {
        self.max_radius
    }
}

impl RadialBasis for GaussianRadialBasis {
    fn dim(&self) -> usize {
        self.centers.len()
    }

    fn evaluate_into(&self, radius: f64, out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.centers.len());
        if radius > self.max_radius {
            out.fill(0.0);
            return;
        }
        let inv = 1.0 / self.sigma;
        for (slot, &center) in out.iter_mut().zip(&self.centers) {
            let z = (radius - center) * inv;
            *slot = (-0.5 * z * z).exp();
        }
    }
}

/// Radius-independent basis: a single function equal to one everywhere.
/// Kernels built on it have purely angular learned structure.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConstantRadialBasis;

impl RadialBasis for ConstantRadialBasis {
    fn dim(&self) -> usize {
        1
    }

    fn evaluate_into(&self, _radius: f64, out: &mut [f64]) {
        out[0] = 1.0;
    }
}
