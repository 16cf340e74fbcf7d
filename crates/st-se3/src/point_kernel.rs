// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Point-cloud steerable kernel constructor.
//!
//! The voxel kernel's combination logic evaluated per relative-position
//! vector instead of on a fixed grid. Pair geometry travels as an explicit
//! tagged shape (`Single` or `Batched`) so the batched/unbatched call paths
//! are dispatched on a variant check rather than inferred from tensor rank.

use crate::error::{SE3Error, SE3Result};
use crate::module::Parameter;
use crate::radial::RadialBasis;
use crate::rs::Rs;
use crate::so3;
use st_tensor::Tensor;
use std::cell::RefCell;
use std::sync::Arc;

/// Default bound on the intermediate angular momentum considered by point
/// kernels. Paths above the bound are dropped, trading expressiveness for
/// compute; the truncation is a documented approximation, never an error.
pub const DEFAULT_J_FILTER_MAX: usize = 10;

/// Tagged call shape of a pairwise-geometry tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairShape {
    /// One point set: `targets × sources` pairs.
    Single { targets: usize, sources: usize },
    /// A batch of point sets of identical extent.
    Batched {
        batch: usize,
        targets: usize,
        sources: usize,
    },
}

impl PairShape {
    /// Total number of pairs across the batch.
    pub fn pair_count(&self) -> usize {
        match *self {
            PairShape::Single { targets, sources } => targets * sources,
            PairShape::Batched {
                batch,
                targets,
                sources,
            } => batch * targets * sources,
        }
    }

    /// Batch extent, when batched.
    pub fn batch(&self) -> Option<usize> {
        match *self {
            PairShape::Single { .. } => None,
            PairShape::Batched { batch, .. } => Some(batch),
        }
    }

    /// Target point count.
    pub fn targets(&self) -> usize {
        match *self {
            PairShape::Single { targets, .. } | PairShape::Batched { targets, .. } => targets,
        }
    }

    /// Source point count.
    pub fn sources(&self) -> usize {
        match *self {
            PairShape::Single { sources, .. } | PairShape::Batched { sources, .. } => sources,
        }
    }
}

/// Pairwise displacement vectors (target minus source), stored row-major as
/// `(pair_count, 3)` under an explicit [`PairShape`].
#[derive(Clone, Debug)]
pub struct DifferenceMat {
    shape: PairShape,
    data: Tensor,
}

impl DifferenceMat {
    fn validated(shape: PairShape, data: Tensor) -> SE3Result<Self> {
        if data.shape() != (shape.pair_count(), 3) {
            return Err(SE3Error::config(
                "difference_mat",
                format!(
                    "expected {} x 3 displacement rows, got {:?}",
                    shape.pair_count(),
                    data.shape()
                ),
            ));
        }
        Ok(Self { shape, data })
    }

    /// Unbatched pair geometry over `targets × sources` displacements.
    pub fn single(targets: usize, sources: usize, data: Tensor) -> SE3Result<Self> {
        Self::validated(PairShape::Single { targets, sources }, data)
    }

    /// Batched pair geometry; pair rows are ordered batch-major, then
    /// target-major.
    pub fn batched(
        batch: usize,
        targets: usize,
        sources: usize,
        data: Tensor,
    ) -> SE3Result<Self> {
        Self::validated(
            PairShape::Batched {
                batch,
                targets,
                sources,
            },
            data,
        )
    }

    /// All-pairs displacement matrix between two coordinate sets, rows being
    /// `(points, 3)` tensors.
    pub fn from_points(targets: &Tensor, sources: &Tensor) -> SE3Result<Self> {
        if targets.shape().1 != 3 || sources.shape().1 != 3 {
            return Err(SE3Error::config(
                "difference_mat",
                "coordinate tensors must have three columns",
            ));
        }
        let (n, m) = (targets.shape().0, sources.shape().0);
        let t = targets.data();
        let s = sources.data();
        let data = Tensor::from_fn(n * m, 3, |row, axis| {
            let (b, a) = (row / m, row % m);
            t[b * 3 + axis] - s[a * 3 + axis]
        })?;
        Self::single(n, m, data)
    }

    /// Shape tag of the geometry.
    pub fn shape(&self) -> PairShape {
        self.shape
    }

    /// Raw `(pair_count, 3)` displacement tensor.
    pub fn data(&self) -> &Tensor {
        &self.data
    }

    /// Displacement vector of one pair row.
    pub fn row(&self, pair: usize) -> [f64; 3] {
        let data = self.data.data();
        [data[pair * 3], data[pair * 3 + 1], data[pair * 3 + 2]]
    }

    /// Returns the geometry with every displacement rotated by `rotation`
    /// (a 3x3 matrix acting on column vectors).
    pub fn rotated(&self, rotation: &Tensor) -> SE3Result<Self> {
        if rotation.shape() != (3, 3) {
            return Err(SE3Error::config(
                "difference_mat",
                "rotation must be a 3x3 matrix",
            ));
        }
        let data = self.data.matmul(&rotation.transpose())?;
        Ok(Self {
            shape: self.shape,
            data,
        })
    }
}

/// Pairwise mask zeroing kernel entries of padded or absent pairs before
/// contraction. Stored as one value per pair row under the same shape tag as
/// the geometry it accompanies.
#[derive(Clone, Debug)]
pub struct RelativeMask {
    shape: PairShape,
    data: Tensor,
}

impl RelativeMask {
    fn validated(shape: PairShape, data: Tensor) -> SE3Result<Self> {
        let rows = match shape {
            PairShape::Single { targets, .. } => targets,
            PairShape::Batched { batch, targets, .. } => batch * targets,
        };
        if data.shape() != (rows, shape.sources()) {
            return Err(SE3Error::config(
                "relative_mask",
                format!(
                    "expected mask shape ({rows}, {}), got {:?}",
                    shape.sources(),
                    data.shape()
                ),
            ));
        }
        Ok(Self { shape, data })
    }

    /// Unbatched mask of shape `(targets, sources)`.
    pub fn single(targets: usize, sources: usize, data: Tensor) -> SE3Result<Self> {
        Self::validated(PairShape::Single { targets, sources }, data)
    }

    /// Batched mask of shape `(batch · targets, sources)`.
    pub fn batched(
        batch: usize,
        targets: usize,
        sources: usize,
        data: Tensor,
    ) -> SE3Result<Self> {
        Self::validated(
            PairShape::Batched {
                batch,
                targets,
                sources,
            },
            data,
        )
    }

    /// Shape tag of the mask.
    pub fn shape(&self) -> PairShape {
        self.shape
    }

    /// Mask weight of one pair row.
    pub fn value(&self, pair: usize) -> f64 {
        self.data.data()[pair]
    }

    pub(crate) fn ensure_matches(&self, geometry: PairShape) -> SE3Result<()> {
        if self.shape != geometry {
            return Err(SE3Error::config(
                "relative_mask",
                format!(
                    "mask shape {:?} does not match geometry {:?}",
                    self.shape, geometry
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct PointPathGroup {
    l_out: usize,
    l_in: usize,
    l_f: usize,
    offset_out: usize,
    offset_in: usize,
    mul_out: usize,
    mul_in: usize,
    base: usize,
    iso_scale: f64,
    cg: Arc<[f64]>,
}

/// Per-pair angular tables retained by the backward-capable mode.
#[derive(Debug)]
struct ForwardCache {
    pair_count: usize,
    basis_values: Vec<f64>,
    /// One `(pair · d_out·d_in)` table per path group.
    angular: Vec<Vec<f64>>,
}

/// Steerable SE(3) kernel evaluated at arbitrary relative positions.
#[derive(Debug)]
pub struct SE3PointKernel {
    rs_in: Rs,
    rs_out: Rs,
    basis: Box<dyn RadialBasis>,
    j_filter_max: usize,
    sh_backwardable: bool,
    weights: Parameter,
    groups: Vec<PointPathGroup>,
    dim_in: usize,
    dim_out: usize,
    cache: RefCell<Option<ForwardCache>>,
}

impl SE3PointKernel {
    /// Builds the point-kernel constructor. Fails eagerly on empty
    /// representations.
    pub fn new(
        name: impl Into<String>,
        rs_in: &Rs,
        rs_out: &Rs,
        basis: Box<dyn RadialBasis>,
        j_filter_max: usize,
        sh_backwardable: bool,
    ) -> SE3Result<Self> {
        let dim_in = rs_in.dim();
        let dim_out = rs_out.dim();
        if dim_in == 0 || dim_out == 0 {
            return Err(SE3Error::config(
                "se3_point_kernel",
                "both representations need at least one channel",
            ));
        }
        let blocks_in = rs_in.decomposition();
        let blocks_out = rs_out.decomposition();

        let mut paths_per_out_block: Vec<usize> = vec![0; blocks_out.len()];
        for (bo, out_block) in blocks_out.iter().enumerate() {
            if out_block.mul == 0 {
                continue;
            }
            for in_block in blocks_in.iter().filter(|block| block.mul > 0) {
                let lo = in_block.l.abs_diff(out_block.l);
                let hi = (in_block.l + out_block.l).min(j_filter_max);
                if hi >= lo {
                    paths_per_out_block[bo] += in_block.mul * (hi - lo + 1);
                }
            }
        }

        let mut groups = Vec::new();
        let mut base = 0;
        for (bo, out_block) in blocks_out.iter().enumerate() {
            if out_block.mul == 0 {
                continue;
            }
            let iso_scale = 1.0 / (paths_per_out_block[bo].max(1) as f64).sqrt();
            for in_block in blocks_in.iter().filter(|block| block.mul > 0) {
                let lo = in_block.l.abs_diff(out_block.l);
                let hi = (in_block.l + out_block.l).min(j_filter_max);
                // l_f beyond the filter bound is silently dropped.
                for l_f in lo..=hi {
                    let cg = so3::clebsch_gordan(out_block.l, in_block.l, l_f)?;
                    groups.push(PointPathGroup {
                        l_out: out_block.l,
                        l_in: in_block.l,
                        l_f,
                        offset_out: out_block.offset,
                        offset_in: in_block.offset,
                        mul_out: out_block.mul,
                        mul_in: in_block.mul,
                        base,
                        iso_scale,
                        cg,
                    });
                    base += out_block.mul * in_block.mul;
                }
            }
        }
        if groups.is_empty() {
            return Err(SE3Error::config(
                "se3_point_kernel",
                format!("no admissible paths under J_filter_max={j_filter_max}"),
            ));
        }

        let name = name.into();
        let mut seed = 0.02f64;
        let weights = Tensor::from_fn(base, basis.dim(), |_r, _c| {
            let value = seed;
            seed = (seed * 1.57).rem_euclid(0.15).max(5e-3);
            value
        })?;
        Ok(Self {
            rs_in: rs_in.clone(),
            rs_out: rs_out.clone(),
            basis,
            j_filter_max,
            sh_backwardable,
            weights: Parameter::new(format!("{name}::radial"), weights),
            groups,
            dim_in,
            dim_out,
            cache: RefCell::new(None),
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

    /// Input channel count.
    pub fn dim_in(&self) -> usize {
        self.dim_in
    }

    /// Output channel count.
    pub fn dim_out(&self) -> usize {
        self.dim_out
    }

    /// Bound on the intermediate angular momentum.
    pub fn j_filter_max(&self) -> usize {
        self.j_filter_max
    }

    /// Learned radial weights.
    pub fn radial_weights(&self) -> &Parameter {
        &self.weights
    }

    /// Mutable access to the learned radial weights.
    pub fn radial_weights_mut(&mut self) -> &mut Parameter {
        &mut self.weights
    }

    fn pair_tables(&self, diff: &DifferenceMat) -> ForwardCache {
        let pair_count = diff.shape().pair_count();
        let basis_dim = self.basis.dim();
        let mut basis_values = vec![0.0; pair_count * basis_dim];
        let mut angular: Vec<Vec<f64>> = self
            .groups
            .iter()
            .map(|group| vec![0.0; pair_count * (2 * group.l_out + 1) * (2 * group.l_in + 1)])
            .collect();
        for pair in 0..pair_count {
            let v = diff.row(pair);
            let radius = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
            self.basis
                .evaluate_into(radius, &mut basis_values[pair * basis_dim..][..basis_dim]);
            for (group, table) in self.groups.iter().zip(angular.iter_mut()) {
                let d_o = 2 * group.l_out + 1;
                let d_i = 2 * group.l_in + 1;
                let d_f = 2 * group.l_f + 1;
                let sh_row = so3::sh(group.l_f, v);
                let block = &mut table[pair * d_o * d_i..(pair + 1) * d_o * d_i];
                for i in 0..d_o {
                    for j in 0..d_i {
                        let cg_row = &group.cg[(i * d_i + j) * d_f..(i * d_i + j + 1) * d_f];
                        block[i * d_i + j] = cg_row
                            .iter()
                            .zip(&sh_row)
                            .map(|(&c, &y)| c * y)
                            .sum::<f64>();
                    }
                }
            }
        }
        ForwardCache {
            pair_count,
            basis_values,
            angular,
        }
    }

    /// Expands the current radial weights into a dense
    /// `(dim_out, dim_in · pair_count)` kernel tensor for the supplied
    /// geometry. A fresh tensor is allocated on every call; in the
    /// backward-capable mode the per-pair angular tables from this pass are
    /// retained for [`SE3PointKernel::backward`].
    pub fn forward(&self, diff: &DifferenceMat) -> SE3Result<Tensor> {
        let tables = self.pair_tables(diff);
        let kernel = self.assemble(&tables)?;
        if self.sh_backwardable {
            *self.cache.borrow_mut() = Some(tables);
        }
        Ok(kernel)
    }

    fn assemble(&self, tables: &ForwardCache) -> SE3Result<Tensor> {
        let pair_count = tables.pair_count;
        let basis_dim = self.basis.dim();
        let mut out = Tensor::zeros(self.dim_out, self.dim_in * pair_count)?;
        let out_cols = out.shape().1;
        let weights = self.weights.value().data();
        let out_data = out.data_mut();
        for (group, table) in self.groups.iter().zip(&tables.angular) {
            let d_o = 2 * group.l_out + 1;
            let d_i = 2 * group.l_in + 1;
            for pair in 0..pair_count {
                let basis_row = &tables.basis_values[pair * basis_dim..][..basis_dim];
                let block = &table[pair * d_o * d_i..(pair + 1) * d_o * d_i];
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
                                let col = (group.offset_in + v * d_i + j) * pair_count + pair;
                                out_data[row * out_cols + col] += coeff * block[i * d_i + j];
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Accumulates the radial-weight gradient implied by a gradient with
    /// respect to the dense kernel tensor for the supplied geometry.
    pub fn backward(&mut self, diff: &DifferenceMat, grad_kernel: &Tensor) -> SE3Result<()> {
        let pair_count = diff.shape().pair_count();
        if grad_kernel.shape() != (self.dim_out, self.dim_in * pair_count) {
            return Err(SE3Error::config(
                "se3_point_kernel",
                format!(
                    "kernel gradient shape {:?} does not match ({}, {})",
                    grad_kernel.shape(),
                    self.dim_out,
                    self.dim_in * pair_count
                ),
            ));
        }
        let cached = self
            .cache
            .borrow_mut()
            .take()
            .filter(|cache| self.sh_backwardable && cache.pair_count == pair_count);
        let tables = match cached {
            Some(tables) => tables,
            None => self.pair_tables(diff),
        };
        let basis_dim = self.basis.dim();
        let (n_paths, _) = self.weights.value().shape();
        let mut grad = Tensor::zeros(n_paths, basis_dim)?;
        let grad_cols = grad_kernel.shape().1;
        let grad_data = grad_kernel.data();
        let grad_w = grad.data_mut();
        for (group, table) in self.groups.iter().zip(&tables.angular) {
            let d_o = 2 * group.l_out + 1;
            let d_i = 2 * group.l_in + 1;
            for pair in 0..pair_count {
                let basis_row = &tables.basis_values[pair * basis_dim..][..basis_dim];
                let block = &table[pair * d_o * d_i..(pair + 1) * d_o * d_i];
                for u in 0..group.mul_out {
                    for v in 0..group.mul_in {
                        let mut sensitivity = 0.0;
                        for i in 0..d_o {
                            let row = group.offset_out + u * d_o + i;
                            for j in 0..d_i {
                                let col = (group.offset_in + v * d_i + j) * pair_count + pair;
                                sensitivity +=
                                    grad_data[row * grad_cols + col] * block[i * d_i + j];
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

/// Block-diagonal grouped variant of [`SE3PointKernel`]: multiplicities are
/// split evenly across `groups` and each group owns an independent kernel
/// with no cross-group mixing.
#[derive(Debug)]
pub struct SE3GroupPointKernel {
    kernels: Vec<SE3PointKernel>,
    row_maps: Vec<Vec<usize>>,
    col_maps: Vec<Vec<usize>>,
    dim_in: usize,
    dim_out: usize,
}

fn group_channel_map(rs: &Rs, groups: usize, group: usize) -> Vec<usize> {
    let mut map = Vec::new();
    for block in rs.decomposition() {
        let mul_g = block.mul / groups;
        let irrep = block.irrep_dim();
        for copy in 0..mul_g {
            let full_copy = group * mul_g + copy;
            for i in 0..irrep {
                map.push(block.offset + full_copy * irrep + i);
            }
        }
    }
    map
}

fn split_rs(rs: &Rs, groups: usize, context: &'static str) -> SE3Result<Rs> {
    let mut entries = Vec::new();
    for entry in rs.entries() {
        if entry.mul % groups != 0 {
            return Err(SE3Error::config(
                context,
                format!(
                    "multiplicity {} of l={} is not divisible by {groups} groups",
                    entry.mul, entry.l
                ),
            ));
        }
        entries.push((entry.mul / groups, entry.l));
    }
    Rs::new(&entries)
}

impl SE3GroupPointKernel {
    /// Builds `groups` independent kernels over the per-group slices of the
    /// representations. `basis` is invoked once per group so every kernel
    /// owns its own radial strategy.
    pub fn new(
        name: impl Into<String>,
        rs_in: &Rs,
        rs_out: &Rs,
        basis: &dyn Fn() -> Box<dyn RadialBasis>,
        j_filter_max: usize,
        groups: usize,
    ) -> SE3Result<Self> {
        if groups == 0 {
            return Err(SE3Error::config(
                "se3_group_point_kernel",
                "groups must be positive",
            ));
        }
        let rs_in_group = split_rs(rs_in, groups, "se3_group_point_kernel")?;
        let rs_out_group = split_rs(rs_out, groups, "se3_group_point_kernel")?;
        let name = name.into();
        let mut kernels = Vec::with_capacity(groups);
        let mut row_maps = Vec::with_capacity(groups);
        let mut col_maps = Vec::with_capacity(groups);
        for group in 0..groups {
            kernels.push(SE3PointKernel::new(
                format!("{name}::group{group}"),
                &rs_in_group,
                &rs_out_group,
                basis(),
                j_filter_max,
                false,
            )?);
            row_maps.push(group_channel_map(rs_out, groups, group));
            col_maps.push(group_channel_map(rs_in, groups, group));
        }
        Ok(Self {
            kernels,
            row_maps,
            col_maps,
            dim_in: rs_in.dim(),
            dim_out: rs_out.dim(),
        })
    }

    /// Input channel count of the full (ungrouped) space.
    pub fn dim_in(&self) -> usize {
        self.dim_in
    }

    /// Output channel count of the full (ungrouped) space.
    pub fn dim_out(&self) -> usize {
        self.dim_out
    }

    /// Per-group kernels.
    pub fn kernels(&self) -> &[SE3PointKernel] {
        &self.kernels
    }

    /// Assembles the block-diagonal dense kernel for the supplied geometry.
    pub fn forward(&self, diff: &DifferenceMat) -> SE3Result<Tensor> {
        let pair_count = diff.shape().pair_count();
        let mut out = Tensor::zeros(self.dim_out, self.dim_in * pair_count)?;
        let out_cols = out.shape().1;
        for (kernel, (row_map, col_map)) in self
            .kernels
            .iter()
            .zip(self.row_maps.iter().zip(&self.col_maps))
        {
            let part = kernel.forward(diff)?;
            let part_cols = part.shape().1;
            let part_data = part.data();
            let out_data = out.data_mut();
            for (local_row, &full_row) in row_map.iter().enumerate() {
                for (local_col, &full_col) in col_map.iter().enumerate() {
                    for pair in 0..pair_count {
                        out_data[full_row * out_cols + full_col * pair_count + pair] +=
                            part_data[local_row * part_cols + local_col * pair_count + pair];
                    }
                }
            }
        }
        Ok(out)
    }

    /// Scatters a dense-kernel gradient back into the per-group kernels.
    pub fn backward(&mut self, diff: &DifferenceMat, grad_kernel: &Tensor) -> SE3Result<()> {
        let pair_count = diff.shape().pair_count();
        if grad_kernel.shape() != (self.dim_out, self.dim_in * pair_count) {
            return Err(SE3Error::config(
                "se3_group_point_kernel",
                format!(
                    "kernel gradient shape {:?} does not match ({}, {})",
                    grad_kernel.shape(),
                    self.dim_out,
                    self.dim_in * pair_count
                ),
            ));
        }
        let grad_cols = grad_kernel.shape().1;
        let grad_data = grad_kernel.data();
        for (kernel, (row_map, col_map)) in self
            .kernels
            .iter_mut()
            .zip(self.row_maps.iter().zip(&self.col_maps))
        {
            let local_cols = col_map.len() * pair_count;
            let mut local = Tensor::zeros(row_map.len(), local_cols)?;
            {
                let local_data = local.data_mut();
                for (local_row, &full_row) in row_map.iter().enumerate() {
                    for (local_col, &full_col) in col_map.iter().enumerate() {
                        for pair in 0..pair_count {
                            local_data[local_row * local_cols + local_col * pair_count + pair] =
                                grad_data[full_row * grad_cols + full_col * pair_count + pair];
                        }
                    }
                }
            }
            kernel.backward(diff, &local)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radial::{ConstantRadialBasis, GaussianRadialBasis};

    fn geometry(targets: usize, sources: usize, seed: u64) -> DifferenceMat {
        let t = Tensor::random_normal(targets, 3, 0.0, 1.0, Some(seed)).unwrap();
        let s = Tensor::random_normal(sources, 3, 0.0, 1.0, Some(seed + 1)).unwrap();
        DifferenceMat::from_points(&t, &s).unwrap()
    }

    #[test]
    fn kernel_axes_match_representations() {
        let rs_in = Rs::new(&[(3, 0), (0, 1)]).unwrap();
        let rs_out = Rs::new(&[(5, 1), (3, 2)]).unwrap();
        let kernel = SE3PointKernel::new(
            "pk",
            &rs_in,
            &rs_out,
            Box::new(GaussianRadialBasis::new(3.0, 4).unwrap()),
            DEFAULT_J_FILTER_MAX,
            false,
        )
        .unwrap();
        let diff = geometry(2, 4, 3);
        let dense = kernel.forward(&diff).unwrap();
        assert_eq!(dense.shape(), (rs_out.dim(), rs_in.dim() * 8));
    }

    #[test]
    fn difference_mat_validates_shape() {
        let bad = Tensor::zeros(5, 3).unwrap();
        assert!(DifferenceMat::single(2, 3, bad).is_err());
        let good = Tensor::zeros(6, 3).unwrap();
        assert!(DifferenceMat::single(2, 3, good).is_ok());
    }

    #[test]
    fn j_filter_truncation_drops_paths_silently() {
        let rs = Rs::new(&[(1, 2)]).unwrap();
        let full = SE3PointKernel::new(
            "pk",
            &rs,
            &rs,
            Box::new(ConstantRadialBasis),
            DEFAULT_J_FILTER_MAX,
            false,
        )
        .unwrap();
        let truncated =
            SE3PointKernel::new("pk", &rs, &rs, Box::new(ConstantRadialBasis), 1, false).unwrap();
        assert_eq!(full.groups.len(), 5);
        assert_eq!(truncated.groups.len(), 2);
    }

    #[test]
    fn unsatisfiable_filter_bound_is_a_configuration_error() {
        let rs_in = Rs::new(&[(1, 3)]).unwrap();
        let rs_out = Rs::new(&[(1, 0)]).unwrap();
        // The only admissible l_f is 3; a bound of 1 leaves no paths at all.
        assert!(SE3PointKernel::new(
            "pk",
            &rs_in,
            &rs_out,
            Box::new(ConstantRadialBasis),
            1,
            false
        )
        .is_err());
    }

    #[test]
    fn group_kernel_is_block_diagonal() {
        let rs = Rs::new(&[(2, 0)]).unwrap();
        let kernel = SE3GroupPointKernel::new(
            "gk",
            &rs,
            &rs,
            &|| Box::new(ConstantRadialBasis),
            DEFAULT_J_FILTER_MAX,
            2,
        )
        .unwrap();
        let diff = geometry(2, 2, 11);
        let dense = kernel.forward(&diff).unwrap();
        let pairs = 4;
        let cols = dense.shape().1;
        // Cross-group entries must be exactly zero.
        for pair in 0..pairs {
            assert_eq!(dense.data()[cols + pair], 0.0);
            assert_eq!(dense.data()[pair + pairs], 0.0);
        }
    }

    #[test]
    fn group_kernel_rejects_indivisible_multiplicities() {
        let rs = Rs::new(&[(3, 0)]).unwrap();
        assert!(SE3GroupPointKernel::new(
            "gk",
            &rs,
            &rs,
            &|| Box::new(ConstantRadialBasis),
            DEFAULT_J_FILTER_MAX,
            2
        )
        .is_err());
    }

    #[test]
    fn backwardable_mode_reuses_cached_tables() {
        let rs = Rs::new(&[(1, 0), (1, 1)]).unwrap();
        let mut kernel = SE3PointKernel::new(
            "pk",
            &rs,
            &rs,
            Box::new(GaussianRadialBasis::new(3.0, 3).unwrap()),
            DEFAULT_J_FILTER_MAX,
            true,
        )
        .unwrap();
        let diff = geometry(2, 3, 5);
        let dense = kernel.forward(&diff).unwrap();
        assert!(kernel.cache.borrow().is_some());
        let grad = Tensor::from_fn(dense.shape().0, dense.shape().1, |r, c| {
            ((r * 31 + c) % 5) as f64 - 2.0
        })
        .unwrap();
        kernel.backward(&diff, &grad).unwrap();
        assert!(kernel.cache.borrow().is_none());
        assert!(kernel.radial_weights().gradient().unwrap().squared_l2_norm() > 0.0);
    }
}
