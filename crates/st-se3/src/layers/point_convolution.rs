// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Point-cloud equivariant convolution layers.
//!
//! The kernel is rebuilt from the caller-supplied pairwise geometry on every
//! call and contracted against the features with an explicit einsum-style
//! loop; the batched and unbatched paths are selected by the geometry's
//! shape tag, never by sniffing tensor ranks.

use crate::error::{SE3Error, SE3Result};
use crate::point_kernel::{DifferenceMat, PairShape, RelativeMask, SE3PointKernel};
use crate::point_utils::{neighbor_difference_matrix, neighbor_feature_matrix, NeighborList};
use crate::radial::RadialBasis;
use crate::rs::Rs;
use st_tensor::Tensor;

/// Zeroes kernel entries of masked-out pairs, returning the masked copy.
pub fn apply_relative_mask(kernel: &Tensor, mask: &RelativeMask) -> SE3Result<Tensor> {
    let pair_count = mask.shape().pair_count();
    let (rows, cols) = kernel.shape();
    if cols % pair_count != 0 {
        return Err(SE3Error::config(
            "relative_mask",
            format!("kernel columns {cols} do not decompose over {pair_count} pairs"),
        ));
    }
    let channels = cols / pair_count;
    let mut masked = kernel.clone();
    let data = masked.data_mut();
    for row in 0..rows {
        for channel in 0..channels {
            let base = row * cols + channel * pair_count;
            for pair in 0..pair_count {
                data[base + pair] *= mask.value(pair);
            }
        }
    }
    Ok(masked)
}

fn ensure_input_shape(
    input: &Tensor,
    shape: PairShape,
    dim_in: usize,
    context: &'static str,
) -> SE3Result<()> {
    let expected = match shape {
        PairShape::Single { sources, .. } => (dim_in, sources),
        PairShape::Batched { batch, sources, .. } => (batch, dim_in * sources),
    };
    if input.shape() != expected {
        return Err(SE3Error::config(
            context,
            format!(
                "input shape {:?} does not match expected {:?} for {:?}",
                input.shape(),
                expected,
                shape
            ),
        ));
    }
    Ok(())
}

/// Explicit einsum-equivalent contraction of a dense pairwise kernel against
/// a feature tensor: `out[d, b] = Σ_{c,a} input[c, a] · K[d, c, b, a]`, with
/// a leading batch axis in the batched variant.
pub fn contract_pairwise(
    kernel: &Tensor,
    input: &Tensor,
    shape: PairShape,
) -> SE3Result<Tensor> {
    let pair_count = shape.pair_count();
    let (dim_out, kernel_cols) = kernel.shape();
    if kernel_cols % pair_count != 0 {
        return Err(SE3Error::config(
            "contract_pairwise",
            format!("kernel columns {kernel_cols} do not decompose over {pair_count} pairs"),
        ));
    }
    let dim_in = kernel_cols / pair_count;
    ensure_input_shape(input, shape, dim_in, "contract_pairwise")?;
    let kernel_data = kernel.data();
    let input_data = input.data();
    let targets = shape.targets();
    let sources = shape.sources();
    match shape {
        PairShape::Single { .. } => {
            let mut out = Tensor::zeros(dim_out, targets)?;
            let out_data = out.data_mut();
            for d in 0..dim_out {
                let kernel_row = &kernel_data[d * kernel_cols..(d + 1) * kernel_cols];
                for b in 0..targets {
                    let mut acc = 0.0;
                    for c in 0..dim_in {
                        let pair_base = c * pair_count + b * sources;
                        let feature_base = c * sources;
                        for a in 0..sources {
                            acc += input_data[feature_base + a] * kernel_row[pair_base + a];
                        }
                    }
                    out_data[d * targets + b] = acc;
                }
            }
            Ok(out)
        }
        PairShape::Batched { batch, .. } => {
            let mut out = Tensor::zeros(batch, dim_out * targets)?;
            let out_cols = out.shape().1;
            let in_cols = input.shape().1;
            let out_data = out.data_mut();
            for n in 0..batch {
                let features = &input_data[n * in_cols..(n + 1) * in_cols];
                for d in 0..dim_out {
                    let kernel_row = &kernel_data[d * kernel_cols..(d + 1) * kernel_cols];
                    for b in 0..targets {
                        let mut acc = 0.0;
                        for c in 0..dim_in {
                            let pair_base = c * pair_count + (n * targets + b) * sources;
                            let feature_base = c * sources;
                            for a in 0..sources {
                                acc += features[feature_base + a] * kernel_row[pair_base + a];
                            }
                        }
                        out_data[n * out_cols + d * targets + b] = acc;
                    }
                }
            }
            Ok(out)
        }
    }
}

fn ensure_grad_shape(
    grad_output: &Tensor,
    shape: PairShape,
    dim_out: usize,
    context: &'static str,
) -> SE3Result<()> {
    let expected = match shape {
        PairShape::Single { targets, .. } => (dim_out, targets),
        PairShape::Batched { batch, targets, .. } => (batch, dim_out * targets),
    };
    if grad_output.shape() != expected {
        return Err(SE3Error::config(
            context,
            format!(
                "gradient shape {:?} does not match expected {:?}",
                grad_output.shape(),
                expected
            ),
        ));
    }
    Ok(())
}

fn pairwise_grad_input(
    kernel: &Tensor,
    grad_output: &Tensor,
    shape: PairShape,
) -> SE3Result<Tensor> {
    let pair_count = shape.pair_count();
    let (dim_out, kernel_cols) = kernel.shape();
    let dim_in = kernel_cols / pair_count;
    let targets = shape.targets();
    let sources = shape.sources();
    let kernel_data = kernel.data();
    let grad_data = grad_output.data();
    match shape {
        PairShape::Single { .. } => {
            let mut grad_input = Tensor::zeros(dim_in, sources)?;
            let grad_in = grad_input.data_mut();
            for d in 0..dim_out {
                let kernel_row = &kernel_data[d * kernel_cols..(d + 1) * kernel_cols];
                for b in 0..targets {
                    let go = grad_data[d * targets + b];
                    if go == 0.0 {
                        continue;
                    }
                    for c in 0..dim_in {
                        let pair_base = c * pair_count + b * sources;
                        let feature_base = c * sources;
                        for a in 0..sources {
                            grad_in[feature_base + a] += go * kernel_row[pair_base + a];
                        }
                    }
                }
            }
            Ok(grad_input)
        }
        PairShape::Batched { batch, .. } => {
            let mut grad_input = Tensor::zeros(batch, dim_in * sources)?;
            let in_cols = grad_input.shape().1;
            let grad_cols = grad_output.shape().1;
            let grad_in = grad_input.data_mut();
            for n in 0..batch {
                for d in 0..dim_out {
                    let kernel_row = &kernel_data[d * kernel_cols..(d + 1) * kernel_cols];
                    for b in 0..targets {
                        let go = grad_data[n * grad_cols + d * targets + b];
                        if go == 0.0 {
                            continue;
                        }
                        for c in 0..dim_in {
                            let pair_base = c * pair_count + (n * targets + b) * sources;
                            let feature_base = n * in_cols + c * sources;
                            for a in 0..sources {
                                grad_in[feature_base + a] += go * kernel_row[pair_base + a];
                            }
                        }
                    }
                }
            }
            Ok(grad_input)
        }
    }
}

fn pairwise_grad_kernel(
    input: &Tensor,
    grad_output: &Tensor,
    shape: PairShape,
    dim_in: usize,
    dim_out: usize,
) -> SE3Result<Tensor> {
    let pair_count = shape.pair_count();
    let targets = shape.targets();
    let sources = shape.sources();
    let mut grad_kernel = Tensor::zeros(dim_out, dim_in * pair_count)?;
    let kernel_cols = grad_kernel.shape().1;
    let input_data = input.data();
    let grad_data = grad_output.data();
    let out = grad_kernel.data_mut();
    match shape {
        PairShape::Single { .. } => {
            for d in 0..dim_out {
                for b in 0..targets {
                    let go = grad_data[d * targets + b];
                    if go == 0.0 {
                        continue;
                    }
                    for c in 0..dim_in {
                        let pair_base = d * kernel_cols + c * pair_count + b * sources;
                        let feature_base = c * sources;
                        for a in 0..sources {
                            out[pair_base + a] += go * input_data[feature_base + a];
                        }
                    }
                }
            }
        }
        PairShape::Batched { batch, .. } => {
            let in_cols = input.shape().1;
            let grad_cols = grad_output.shape().1;
            for n in 0..batch {
                for d in 0..dim_out {
                    for b in 0..targets {
                        let go = grad_data[n * grad_cols + d * targets + b];
                        if go == 0.0 {
                            continue;
                        }
                        for c in 0..dim_in {
                            let pair_base =
                                d * kernel_cols + c * pair_count + (n * targets + b) * sources;
                            let feature_base = n * in_cols + c * sources;
                            for a in 0..sources {
                                out[pair_base + a] += go * input_data[feature_base + a];
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(grad_kernel)
}

/// Point-cloud equivariant convolution over caller-supplied pairwise
/// geometry.
#[derive(Debug)]
pub struct SE3PointConvolution {
    kernel: SE3PointKernel,
}

impl SE3PointConvolution {
    pub fn new(
        name: impl Into<String>,
        rs_in: &Rs,
        rs_out: &Rs,
        basis: Box<dyn RadialBasis>,
        j_filter_max: usize,
        sh_backwardable: bool,
    ) -> SE3Result<Self> {
        Ok(Self {
            kernel: SE3PointKernel::new(name, rs_in, rs_out, basis, j_filter_max, sh_backwardable)?,
        })
    }

    /// The owned kernel constructor.
    pub fn kernel(&self) -> &SE3PointKernel {
        &self.kernel
    }

    /// Mutable access to the owned kernel constructor.
    pub fn kernel_mut(&mut self) -> &mut SE3PointKernel {
        &mut self.kernel
    }

    /// Applies the accumulated radial-weight update.
    pub fn apply_step(&mut self, learning_rate: f64) -> SE3Result<()> {
        self.kernel
            .radial_weights_mut()
            .apply_step(learning_rate)?;
        Ok(())
    }

    /// Forward pass: build the kernel from the geometry, mask absent pairs,
    /// contract against the features.
    pub fn forward(
        &self,
        input: &Tensor,
        difference_mat: &DifferenceMat,
        relative_mask: Option<&RelativeMask>,
    ) -> SE3Result<Tensor> {
        let shape = difference_mat.shape();
        ensure_input_shape(input, shape, self.kernel.dim_in(), "se3_point_convolution")?;
        let mut kernel = self.kernel.forward(difference_mat)?;
        if let Some(mask) = relative_mask {
            mask.ensure_matches(shape)?;
            kernel = apply_relative_mask(&kernel, mask)?;
        }
        contract_pairwise(&kernel, input, shape)
    }

    /// Backward pass: accumulates the radial-weight gradient and returns the
    /// gradient with respect to the input features.
    pub fn backward(
        &mut self,
        input: &Tensor,
        difference_mat: &DifferenceMat,
        relative_mask: Option<&RelativeMask>,
        grad_output: &Tensor,
    ) -> SE3Result<Tensor> {
        let shape = difference_mat.shape();
        ensure_input_shape(input, shape, self.kernel.dim_in(), "se3_point_convolution")?;
        ensure_grad_shape(grad_output, shape, self.kernel.dim_out(), "se3_point_convolution")?;
        let mut kernel = self.kernel.forward(difference_mat)?;
        if let Some(mask) = relative_mask {
            mask.ensure_matches(shape)?;
            kernel = apply_relative_mask(&kernel, mask)?;
        }
        let grad_input = pairwise_grad_input(&kernel, grad_output, shape)?;
        let mut grad_kernel = pairwise_grad_kernel(
            input,
            grad_output,
            shape,
            self.kernel.dim_in(),
            self.kernel.dim_out(),
        )?;
        if let Some(mask) = relative_mask {
            grad_kernel = apply_relative_mask(&grad_kernel, mask)?;
        }
        self.kernel.backward(difference_mat, &grad_kernel)?;
        Ok(grad_input)
    }
}

/// Point-cloud equivariant convolution restricted to fixed-size neighbor
/// lists. Materialises the per-point difference and gathered-feature
/// matrices, then runs the same kernel-build-and-contract sequence.
#[derive(Debug)]
pub struct SE3PointNeighborConvolution {
    kernel: SE3PointKernel,
}

impl SE3PointNeighborConvolution {
    pub fn new(
        name: impl Into<String>,
        rs_in: &Rs,
        rs_out: &Rs,
        basis: Box<dyn RadialBasis>,
        j_filter_max: usize,
    ) -> SE3Result<Self> {
        Ok(Self {
            kernel: SE3PointKernel::new(name, rs_in, rs_out, basis, j_filter_max, false)?,
        })
    }

    /// The owned kernel constructor.
    pub fn kernel(&self) -> &SE3PointKernel {
        &self.kernel
    }

    /// Forward pass. `coords` and `neighbors` are required; omitting either
    /// is a configuration error, not a crash.
    pub fn forward(
        &self,
        input: &Tensor,
        coords: Option<&Tensor>,
        neighbors: Option<&NeighborList>,
        relative_mask: Option<&RelativeMask>,
    ) -> SE3Result<Tensor> {
        let coords = coords.ok_or_else(|| {
            SE3Error::config("se3_point_neighbor_convolution", "coords is required")
        })?;
        let neighbors = neighbors.ok_or_else(|| {
            SE3Error::config("se3_point_neighbor_convolution", "neighbors is required")
        })?;
        let dim_in = self.kernel.dim_in();
        if input.shape() != (dim_in, neighbors.points()) {
            return Err(SE3Error::config(
                "se3_point_neighbor_convolution",
                format!(
                    "input shape {:?} does not match ({dim_in}, {})",
                    input.shape(),
                    neighbors.points()
                ),
            ));
        }
        let difference_mat = neighbor_difference_matrix(neighbors, coords)?;
        let gathered = neighbor_feature_matrix(neighbors, input)?;
        let mut kernel = self.kernel.forward(&difference_mat)?;
        if let Some(mask) = relative_mask {
            mask.ensure_matches(difference_mat.shape())?;
            kernel = apply_relative_mask(&kernel, mask)?;
        }
        let points = neighbors.points();
        let k = neighbors.k();
        let pair_count = points * k;
        let dim_out = self.kernel.dim_out();
        let kernel_cols = kernel.shape().1;
        let kernel_data = kernel.data();
        let gathered_data = gathered.data();
        let mut out = Tensor::zeros(dim_out, points)?;
        let out_data = out.data_mut();
        for d in 0..dim_out {
            let kernel_row = &kernel_data[d * kernel_cols..(d + 1) * kernel_cols];
            for b in 0..points {
                let mut acc = 0.0;
                for c in 0..dim_in {
                    let pair_base = c * pair_count + b * k;
                    let feature_base = c * pair_count + b * k;
                    for j in 0..k {
                        acc += gathered_data[feature_base + j] * kernel_row[pair_base + j];
                    }
                }
                out_data[d * points + b] = acc;
            }
        }
        Ok(out)
    }

    /// Backward pass mirroring [`SE3PointNeighborConvolution::forward`]:
    /// accumulates the radial-weight gradient and scatters the feature
    /// gradient back through the neighbor gather.
    pub fn backward(
        &mut self,
        input: &Tensor,
        coords: Option<&Tensor>,
        neighbors: Option<&NeighborList>,
        relative_mask: Option<&RelativeMask>,
        grad_output: &Tensor,
    ) -> SE3Result<Tensor> {
        let coords = coords.ok_or_else(|| {
            SE3Error::config("se3_point_neighbor_convolution", "coords is required")
        })?;
        let neighbors = neighbors.ok_or_else(|| {
            SE3Error::config("se3_point_neighbor_convolution", "neighbors is required")
        })?;
        let dim_in = self.kernel.dim_in();
        let dim_out = self.kernel.dim_out();
        let points = neighbors.points();
        let k = neighbors.k();
        if input.shape() != (dim_in, points) {
            return Err(SE3Error::config(
                "se3_point_neighbor_convolution",
                format!(
                    "input shape {:?} does not match ({dim_in}, {points})",
                    input.shape()
                ),
            ));
        }
        if grad_output.shape() != (dim_out, points) {
            return Err(SE3Error::config(
                "se3_point_neighbor_convolution",
                format!(
                    "gradient shape {:?} does not match ({dim_out}, {points})",
                    grad_output.shape()
                ),
            ));
        }
        let difference_mat = neighbor_difference_matrix(neighbors, coords)?;
        let gathered = neighbor_feature_matrix(neighbors, input)?;
        let mut kernel = self.kernel.forward(&difference_mat)?;
        if let Some(mask) = relative_mask {
            mask.ensure_matches(difference_mat.shape())?;
            kernel = apply_relative_mask(&kernel, mask)?;
        }
        let pair_count = points * k;
        let kernel_cols = kernel.shape().1;
        let kernel_data = kernel.data();
        let gathered_data = gathered.data();
        let grad_data = grad_output.data();
        let mut grad_input = Tensor::zeros(dim_in, points)?;
        let mut grad_kernel = Tensor::zeros(dim_out, dim_in * pair_count)?;
        {
            let grad_in = grad_input.data_mut();
            let grad_k = grad_kernel.data_mut();
            for d in 0..dim_out {
                let kernel_row = &kernel_data[d * kernel_cols..(d + 1) * kernel_cols];
                for b in 0..points {
                    let go = grad_data[d * points + b];
                    if go == 0.0 {
                        continue;
                    }
                    for c in 0..dim_in {
                        let pair_base = c * pair_count + b * k;
                        for j in 0..k {
                            let neighbor = neighbors.get(b, j);
                            grad_in[c * points + neighbor] += go * kernel_row[pair_base + j];
                            grad_k[d * kernel_cols + pair_base + j] +=
                                go * gathered_data[pair_base + j];
                        }
                    }
                }
            }
        }
        if let Some(mask) = relative_mask {
            grad_kernel = apply_relative_mask(&grad_kernel, mask)?;
        }
        self.kernel.backward(&difference_mat, &grad_kernel)?;
        Ok(grad_input)
    }
}
