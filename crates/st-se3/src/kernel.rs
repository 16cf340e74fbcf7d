// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Voxel-grid steerable kernel constructor.
//!
//! The kernel is never a free parameter: every forward call re-expands the
//! learned radial weights against the precomputed angular tables and returns
//! a fresh dense tensor of shape `(dim_out, dim_in · size³)` with the
//! trailing axis laid out x-major over the centered grid.

use crate::error::{SE3Error, SE3Result};
use crate::module::Parameter;
use crate::radial::RadialBasis;
use crate::rs::Rs;
use crate::so3;
use st_tensor::Tensor;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

/// One `(in-block, out-block, l_f)` group of kernel paths. Multiplicity
/// copies inside the group share the angular table and own consecutive rows
/// of the radial weight matrix.
#[derive(Debug)]
struct PathGroup {
    l_out: usize,
    l_in: usize,
    offset_out: usize,
    offset_in: usize,
    mul_out: usize,
    mul_in: usize,
    /// First row of the weight matrix owned by this group.
    base: usize,
    /// Variance-preserving rescale for the owning output block.
    iso_scale: f64,
    /// Per-voxel `Σ_m C[i,j,m]·Y_m` blocks, `[voxel][(i·d_in + j)]`.
    angular: Vec<f64>,
}

/// Steerable SE(3) kernel on a cubic voxel grid.
#[derive(Debug)]
pub struct SE3Kernel {
    rs_in: Rs,
    rs_out: Rs,
    size: usize,
    dyn_iso: bool,
    basis: Box<dyn RadialBasis>,
    weights: Parameter,
    groups: Vec<PathGroup>,
    /// Per-voxel radial basis values, zeroed beyond the boundary window.
    basis_table: Vec<f64>,
    dim_in: usize,
    dim_out: usize,
}

impl SE3Kernel {
    /// Builds the kernel constructor for the given representations and grid
    /// extent. Fails eagerly on a non-positive grid or empty representations.
    pub fn new(
        name: impl Into<String>,
        rs_in: &Rs,
        rs_out: &Rs,
        size: usize,
        basis: Box<dyn RadialBasis>,
        dyn_iso: bool,
    ) -> SE3Result<Self> {
        if size == 0 {
            return Err(SE3Error::config("se3_kernel", "size must be positive"));
        }
        let dim_in = rs_in.dim();
        let dim_out = rs_out.dim();
        if dim_in == 0 || dim_out == 0 {
            return Err(SE3Error::config(
                "se3_kernel",
                "both representations need at least one channel",
            ));
        }
        let volume = size * size * size;
        let center = (size as f64 - 1.0) / 2.0;
        // Window radius: the grid boundary beyond which radial support would
        // alias across the kernel edge.
        let boundary = size as f64 / 2.0;

        let mut radii = vec![0.0; volume];
        let mut directions = vec![[0.0f64; 3]; volume];
        for x in 0..size {
            for y in 0..size {
                for z in 0..size {
                    let g = (x * size + y) * size + z;
                    let v = [x as f64 - center, y as f64 - center, z as f64 - center];
                    radii[g] = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
                    directions[g] = v;
                }
            }
        }

        let basis_dim = basis.dim();
        let mut basis_table = vec![0.0; volume * basis_dim];
        for g in 0..volume {
            if radii[g] <= boundary {
                basis.evaluate_into(radii[g], &mut basis_table[g * basis_dim..][..basis_dim]);
            }
        }

        let blocks_in = rs_in.decomposition();
        let blocks_out = rs_out.decomposition();

        // Count paths per output block for the dynamic-isotropy rescale.
        let mut paths_per_out_block: Vec<usize> = vec![0; blocks_out.len()];
        for (bo, out_block) in blocks_out.iter().enumerate() {
            if out_block.mul == 0 {
                continue;
            }
            for in_block in blocks_in.iter().filter(|block| block.mul > 0) {
                let n_lf = in_block.l + out_block.l - in_block.l.abs_diff(out_block.l) + 1;
                paths_per_out_block[bo] += in_block.mul * n_lf;
            }
        }

        // Spherical harmonics per needed degree, shared across groups.
        let mut needed: BTreeSet<usize> = BTreeSet::new();
        for out_block in blocks_out.iter().filter(|block| block.mul > 0) {
            for in_block in blocks_in.iter().filter(|block| block.mul > 0) {
                for l_f in in_block.l.abs_diff(out_block.l)..=(in_block.l + out_block.l) {
                    needed.insert(l_f);
                }
            }
        }
        let mut sh_tables: HashMap<usize, Vec<f64>> = HashMap::new();
        for &l_f in &needed {
            let d_f = 2 * l_f + 1;
            let mut table = vec![0.0; volume * d_f];
            for g in 0..volume {
                table[g * d_f..(g + 1) * d_f].copy_from_slice(&so3::sh(l_f, directions[g]));
            }
            sh_tables.insert(l_f, table);
        }

        let mut groups = Vec::new();
        let mut base = 0;
        for (bo, out_block) in blocks_out.iter().enumerate() {
            if out_block.mul == 0 {
                continue;
            }
            let iso_scale = if dyn_iso {
                1.0 / (paths_per_out_block[bo].max(1) as f64).sqrt()
            } else {
                1.0
            };
            for in_block in blocks_in.iter().filter(|block| block.mul > 0) {
                for l_f in in_block.l.abs_diff(out_block.l)..=(in_block.l + out_block.l) {
                    let cg = so3::clebsch_gordan(out_block.l, in_block.l, l_f)?;
                    let angular = contract_angular(
                        &cg,
                        &sh_tables[&l_f],
                        out_block.l,
                        in_block.l,
                        l_f,
                        volume,
                    );
                    groups.push(PathGroup {
                        l_out: out_block.l,
                        l_in: in_block.l,
                        offset_out: out_block.offset,
                        offset_in: in_block.offset,
                        mul_out: out_block.mul,
                        mul_in: in_block.mul,
                        base,
                        iso_scale,
                        angular,
                    });
                    base += out_block.mul * in_block.mul;
                }
            }
        }

        let name = name.into();
        let mut seed = 0.01f64;
        let weights = Tensor::from_fn(base.max(1), basis_dim, |_r, _c| {
            let value = seed;
            seed = (seed * 1.37).rem_euclid(0.1).max(1e-3);
            value
        })?;
        Ok(Self {
            rs_in: rs_in.clone(),
            rs_out: rs_out.clone(),
            size,
            dyn_iso,
            basis,
            weights: Parameter::new(format!("{name}::radial"), weights),
            groups,
            basis_table,
            dim_in,
            dim_out,
        })
    }

    /// Input representation.
    pub fn rs_in(&self) -> &Rs {
        &self.rs_in
    }

    /// Output representation.
    pub fn rs_out(&self) -> &Rs {
        &self.rs_out
    }

    /// Grid extent per axis.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Input channel count.
    pub fn dim_in(&self) -> usize {
        self.dim_in
    }

    /// Output channel count.
    pub fn dim_out(&self) -> usize {
        self.dim_out
    }

    /// Whether the dynamic-isotropy rescale is active.
    pub fn dyn_iso(&self) -> bool {
        self.dyn_iso
    }

    /// Learned radial weights.
    pub fn radial_weights(&self) -> &Parameter {
        &self.weights
    }

    /// Mutable access to the learned radial weights.
    pub fn radial_weights_mut(&mut self) -> &mut Parameter {
        &mut self.weights
    }

    /// Expands the current radial weights into a dense
    /// `(dim_out, dim_in · size³)` kernel tensor. A fresh tensor is
    /// allocated on every call.
    pub fn forward(&self) -> SE3Result<Tensor> {
        let volume = self.size * self.size * self.size;
        let basis_dim = self.basis.dim();
        let mut out = Tensor::zeros(self.dim_out, self.dim_in * volume)?;
        let out_cols = out.shape().1;
        let weights = self.weights.value().data();
        let out_data = out.data_mut();
        for group in &self.groups {
            let d_o = 2 * group.l_out + 1;
            let d_i = 2 * group.l_in + 1;
            for g in 0..volume {
                let basis_row = &self.basis_table[g * basis_dim..][..basis_dim];
                let angular = &group.angular[g * d_o * d_i..][..d_o * d_i];
                for u in 0..group.mul_out {
                    for v in 0..group.mul_in {
                        let path = group.base + u * group.mul_in + v;
                        let weight_row = &weights[path * basis_dim..][..basis_dim];
                        let coeff: f64 = weight_row
                            .iter()
                            .zip(basis_row)
                            .map(|(&w, &b)| w * b)
                            .sum::<f64>()
                            * group.iso_scale;
                        if coeff == 0.0 {
                            continue;
                        }
                        for i in 0..d_o {
                            let row = group.offset_out + u * d_o + i;
                            for j in 0..d_i {
                                let col = (group.offset_in + v * d_i + j) * volume + g;
                                out_data[row * out_cols + col] += coeff * angular[i * d_i + j];
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Accumulates the radial-weight gradient implied by a gradient with
    /// respect to the dense kernel tensor.
    pub fn backward(&mut self, grad_kernel: &Tensor) -> SE3Result<()> {
        let volume = self.size * self.size * self.size;
        if grad_kernel.shape() != (self.dim_out, self.dim_in * volume) {
            return Err(SE3Error::config(
                "se3_kernel",
                format!(
                    "kernel gradient shape {:?} does not match ({}, {})",
                    grad_kernel.shape(),
                    self.dim_out,
                    self.dim_in * volume
                ),
            ));
        }
        let basis_dim = self.basis.dim();
        let (n_paths, _) = self.weights.value().shape();
        let mut grad = Tensor::zeros(n_paths, basis_dim)?;
        let grad_cols = grad_kernel.shape().1;
        let grad_data = grad_kernel.data();
        let grad_w = grad.data_mut();
        for group in &self.groups {
            let d_o = 2 * group.l_out + 1;
            let d_i = 2 * group.l_in + 1;
            for g in 0..volume {
                let basis_row = &self.basis_table[g * basis_dim..][..basis_dim];
                let angular = &group.angular[g * d_o * d_i..][..d_o * d_i];
                for u in 0..group.mul_out {
                    for v in 0..group.mul_in {
                        let mut sensitivity = 0.0;
                        for i in 0..d_o {
                            let row = group.offset_out + u * d_o + i;
                            for j in 0..d_i {
                                let col = (group.offset_in + v * d_i + j) * volume + g;
                                sensitivity +=
                                    grad_data[row * grad_cols + col] * angular[i * d_i + j];
                            }
                        }
                        if sensitivity == 0.0 {
                            continue;
                        }
                        sensitivity *= group.iso_scale;
                        let path = group.base + u * group.mul_in + v;
                        for (slot, &b) in grad_w[path * basis_dim..][..basis_dim]
                            .iter_mut()
                            .zip(basis_row)
                        {
                            *slot += sensitivity * b;
                        }
                    }
                }
            }
        }
        self.weights.accumulate_euclidean(&grad)?;
        Ok(())
    }
}

fn contract_angular(
    cg: &Arc<[f64]>,
    sh_table: &[f64],
    l_out: usize,
    l_in: usize,
    l_f: usize,
    volume: usize,
) -> Vec<f64> {
    let d_o = 2 * l_out + 1;
    let d_i = 2 * l_in + 1;
    let d_f = 2 * l_f + 1;
    let mut angular = vec![0.0; volume * d_o * d_i];
    for g in 0..volume {
        let sh_row = &sh_table[g * d_f..(g + 1) * d_f];
        let block = &mut angular[g * d_o * d_i..(g + 1) * d_o * d_i];
        for i in 0..d_o {
            for j in 0..d_i {
                let cg_row = &cg[(i * d_i + j) * d_f..(i * d_i + j + 1) * d_f];
                block[i * d_i + j] = cg_row
                    .iter()
                    .zip(sh_row)
                    .map(|(&c, &y)| c * y)
                    .sum::<f64>();
            }
        }
    }
    angular
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radial::GaussianRadialBasis;

    fn basis(size: usize) -> Box<dyn RadialBasis> {
        Box::new(GaussianRadialBasis::new(size as f64 / 2.0, 3).unwrap())
    }

    #[test]
    fn kernel_axes_match_representations() {
        let rs_in = Rs::new(&[(2, 0), (1, 1)]).unwrap();
        let rs_out = Rs::new(&[(1, 0), (1, 1), (1, 2)]).unwrap();
        let kernel = SE3Kernel::new("k", &rs_in, &rs_out, 5, basis(5), false).unwrap();
        let dense = kernel.forward().unwrap();
        assert_eq!(dense.shape(), (rs_out.dim(), rs_in.dim() * 125));
    }

    #[test]
    fn size_one_kernel_reduces_to_the_scalar_path() {
        let rs_in = Rs::new(&[(2, 0), (1, 1)]).unwrap();
        let rs_out = Rs::new(&[(1, 0), (1, 1)]).unwrap();
        let kernel = SE3Kernel::new("k", &rs_in, &rs_out, 1, basis(1), false).unwrap();
        let dense = kernel.forward().unwrap();
        assert_eq!(dense.shape(), (rs_out.dim(), rs_in.dim()));
        // Only l_f = 0 survives at the grid origin, so the scalar-to-scalar
        // and vector-to-vector diagonals are the only non-zero structure.
        let cols = dense.shape().1;
        for (r, row) in dense.data().chunks_exact(cols).enumerate() {
            for (c, &value) in row.iter().enumerate() {
                let scalar_pair = r == 0 && c < 2;
                let vector_pair = (1..4).contains(&r) && (2..5).contains(&c) && r - 1 == c - 2;
                if !(scalar_pair || vector_pair) {
                    assert_eq!(value, 0.0, "row {r} col {c}");
                }
            }
        }
    }

    #[test]
    fn invalid_configurations_fail_eagerly() {
        let rs = Rs::new(&[(1, 0)]).unwrap();
        let empty = Rs::new(&[(0, 0)]).unwrap();
        assert!(SE3Kernel::new("k", &rs, &rs, 0, basis(3), false).is_err());
        assert!(SE3Kernel::new("k", &empty, &rs, 3, basis(3), false).is_err());
        assert!(SE3Kernel::new("k", &rs, &empty, 3, basis(3), false).is_err());
    }

    #[test]
    fn forward_is_deterministic() {
        let rs = Rs::new(&[(1, 0), (1, 1)]).unwrap();
        let kernel = SE3Kernel::new("k", &rs, &rs, 3, basis(3), true).unwrap();
        let a = kernel.forward().unwrap();
        let b = kernel.forward().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn dyn_iso_rescales_by_path_count() {
        // One output block fed by two scalar copies through a single l_f path
        // each: the rescale factor must be exactly 1/sqrt(2).
        let rs_in = Rs::new(&[(2, 0)]).unwrap();
        let rs_out = Rs::new(&[(1, 0)]).unwrap();
        let plain = SE3Kernel::new("k", &rs_in, &rs_out, 3, basis(3), false).unwrap();
        let iso = SE3Kernel::new("k", &rs_in, &rs_out, 3, basis(3), true).unwrap();
        let plain = plain.forward().unwrap();
        let iso = iso.forward().unwrap();
        let expected = plain.scale(1.0 / 2.0f64.sqrt()).unwrap();
        assert!(iso.sub(&expected).unwrap().max_abs() < 1e-14);
    }

    #[test]
    fn backward_accumulates_radial_gradients() {
        let rs = Rs::new(&[(1, 0), (1, 1)]).unwrap();
        let mut kernel = SE3Kernel::new("k", &rs, &rs, 3, basis(3), false).unwrap();
        let dense = kernel.forward().unwrap();
        let grad = Tensor::from_fn(dense.shape().0, dense.shape().1, |r, c| {
            ((r + c) % 3) as f64 - 1.0
        })
        .unwrap();
        kernel.backward(&grad).unwrap();
        let gradient = kernel.radial_weights().gradient().unwrap();
        assert_eq!(gradient.shape(), kernel.radial_weights().value().shape());
        assert!(gradient.squared_l2_norm() > 0.0);
    }
}
