// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Dense 3D convolution primitives over `(batch, channels · D·H·W)` tensors.
//!
//! Kernel tensors use the `(out_channels, in_channels_per_group · k³)` layout
//! produced by the steerable kernel constructors; transpose convolution takes
//! the adjoint `(in_channels, out_channels_per_group · k³)` layout.

use crate::error::{SE3Error, SE3Result};
use serde::{Deserialize, Serialize};
use st_tensor::Tensor;

/// Caller-forwarded convolution options, passed through verbatim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv3dOptions {
    pub stride: (usize, usize, usize),
    pub padding: (usize, usize, usize),
    pub dilation: (usize, usize, usize),
    pub groups: usize,
}

impl Default for Conv3dOptions {
    fn default() -> Self {
        Self {
            stride: (1, 1, 1),
            padding: (0, 0, 0),
            dilation: (1, 1, 1),
            groups: 1,
        }
    }
}

impl Conv3dOptions {
    /// Builder-style helper overriding the stride on every axis.
    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = (stride, stride, stride);
        self
    }

    /// Builder-style helper overriding the padding on every axis.
    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = (padding, padding, padding);
        self
    }

    /// Builder-style helper overriding the dilation on every axis.
    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation = (dilation, dilation, dilation);
        self
    }

    /// Builder-style helper overriding the group count.
    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    fn validate(&self) -> SE3Result<()> {
        let (sd, sh, sw) = self.stride;
        let (dd, dh, dw) = self.dilation;
        if sd == 0 || sh == 0 || sw == 0 || dd == 0 || dh == 0 || dw == 0 || self.groups == 0 {
            return Err(SE3Error::config(
                "conv3d_options",
                "stride, dilation, and groups must be positive",
            ));
        }
        Ok(())
    }
}

fn out_extent(
    input: usize,
    pad: usize,
    dilation: usize,
    kernel: usize,
    stride: usize,
) -> SE3Result<usize> {
    let effective = (kernel - 1) * dilation + 1;
    let padded = input + 2 * pad;
    if padded < effective {
        return Err(SE3Error::config(
            "conv3d",
            format!("padded extent {padded} is smaller than the dilated kernel {effective}"),
        ));
    }
    Ok((padded - effective) / stride + 1)
}

fn transpose_extent(
    input: usize,
    pad: usize,
    dilation: usize,
    kernel: usize,
    stride: usize,
) -> SE3Result<usize> {
    let full = (input - 1) * stride + (kernel - 1) * dilation + 1;
    if full <= 2 * pad {
        return Err(SE3Error::config(
            "conv_transpose3d",
            format!("padding {pad} swallows the whole output extent {full}"),
        ));
    }
    Ok(full - 2 * pad)
}

struct ConvGeometry {
    batch: usize,
    out_channels: usize,
    per_group_in: usize,
    per_group_out: usize,
    in_dhw: (usize, usize, usize),
    out_dhw: (usize, usize, usize),
    kernel: usize,
}

fn conv_geometry(
    input: &Tensor,
    weight: &Tensor,
    input_dhw: (usize, usize, usize),
    kernel: usize,
    options: &Conv3dOptions,
) -> SE3Result<ConvGeometry> {
    options.validate()?;
    if kernel == 0 {
        return Err(SE3Error::config("conv3d", "kernel size must be positive"));
    }
    let (d, h, w) = input_dhw;
    let volume = d * h * w;
    let (batch, cols) = input.shape();
    if volume == 0 || cols % volume != 0 {
        return Err(SE3Error::config(
            "conv3d",
            format!("input columns {cols} do not decompose over a {d}x{h}x{w} grid"),
        ));
    }
    let in_channels = cols / volume;
    let out_channels = weight.shape().0;
    if in_channels % options.groups != 0 || out_channels % options.groups != 0 {
        return Err(SE3Error::config(
            "conv3d",
            format!(
                "channels ({in_channels} in, {out_channels} out) are not divisible by {} groups",
                options.groups
            ),
        ));
    }
    let per_group_in = in_channels / options.groups;
    let kernel_volume = kernel * kernel * kernel;
    if weight.shape().1 != per_group_in * kernel_volume {
        return Err(SE3Error::config(
            "conv3d",
            format!(
                "weight columns {} do not match {per_group_in} channels x {kernel_volume} taps",
                weight.shape().1
            ),
        ));
    }
    let out_dhw = (
        out_extent(d, options.padding.0, options.dilation.0, kernel, options.stride.0)?,
        out_extent(h, options.padding.1, options.dilation.1, kernel, options.stride.1)?,
        out_extent(w, options.padding.2, options.dilation.2, kernel, options.stride.2)?,
    );
    Ok(ConvGeometry {
        batch,
        out_channels,
        per_group_in,
        per_group_out: out_channels / options.groups,
        in_dhw: input_dhw,
        out_dhw,
        kernel,
    })
}

/// Dense 3D convolution. `input` is `(batch, in_channels · D·H·W)`, `weight`
/// is `(out_channels, in_channels_per_group · k³)`.
pub fn conv3d(
    input: &Tensor,
    weight: &Tensor,
    input_dhw: (usize, usize, usize),
    kernel: usize,
    options: &Conv3dOptions,
) -> SE3Result<Tensor> {
    let geo = conv_geometry(input, weight, input_dhw, kernel, options)?;
    let (d, h, w) = geo.in_dhw;
    let (od, oh, ow) = geo.out_dhw;
    let k = geo.kernel;
    let kernel_volume = k * k * k;
    let in_cols = input.shape().1;
    let mut out = Tensor::zeros(geo.batch, geo.out_channels * od * oh * ow)?;
    let out_cols = out.shape().1;
    let input_data = input.data();
    let weight_data = weight.data();
    let out_data = out.data_mut();
    for b in 0..geo.batch {
        let row = &input_data[b * in_cols..(b + 1) * in_cols];
        let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
        for g in 0..options.groups {
            for oc_local in 0..geo.per_group_out {
                let oc = g * geo.per_group_out + oc_local;
                let weight_row =
                    &weight_data[oc * geo.per_group_in * kernel_volume
                        ..(oc + 1) * geo.per_group_in * kernel_volume];
                for zd in 0..od {
                    for zh in 0..oh {
                        for zw in 0..ow {
                            let mut acc = 0.0;
                            for ic_local in 0..geo.per_group_in {
                                let ic = g * geo.per_group_in + ic_local;
                                for kd in 0..k {
                                    let pd = zd * options.stride.0 + kd * options.dilation.0;
                                    if pd < options.padding.0 {
                                        continue;
                                    }
                                    let id = pd - options.padding.0;
                                    if id >= d {
                                        continue;
                                    }
                                    for kh in 0..k {
                                        let ph = zh * options.stride.1 + kh * options.dilation.1;
                                        if ph < options.padding.1 {
                                            continue;
                                        }
                                        let ih = ph - options.padding.1;
                                        if ih >= h {
                                            continue;
                                        }
                                        for kw in 0..k {
                                            let pw =
                                                zw * options.stride.2 + kw * options.dilation.2;
                                            if pw < options.padding.2 {
                                                continue;
                                            }
                                            let iw = pw - options.padding.2;
                                            if iw >= w {
                                                continue;
                                            }
                                            let input_idx = ((ic * d + id) * h + ih) * w + iw;
                                            let weight_idx = ic_local * kernel_volume
                                                + (kd * k + kh) * k
                                                + kw;
                                            acc += row[input_idx] * weight_row[weight_idx];
                                        }
                                    }
                                }
                            }
                            out_row[((oc * od + zd) * oh + zh) * ow + zw] = acc;
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Gradients of [`conv3d`] with respect to its input and weight, mirroring
/// the forward loops so every contribution is paired with its adjoint.
pub fn conv3d_backward(
    input: &Tensor,
    weight: &Tensor,
    grad_output: &Tensor,
    input_dhw: (usize, usize, usize),
    kernel: usize,
    options: &Conv3dOptions,
) -> SE3Result<(Tensor, Tensor)> {
    let geo = conv_geometry(input, weight, input_dhw, kernel, options)?;
    let (d, h, w) = geo.in_dhw;
    let (od, oh, ow) = geo.out_dhw;
    if grad_output.shape() != (geo.batch, geo.out_channels * od * oh * ow) {
        return Err(SE3Error::config(
            "conv3d",
            format!(
                "gradient shape {:?} does not match ({}, {})",
                grad_output.shape(),
                geo.batch,
                geo.out_channels * od * oh * ow
            ),
        ));
    }
    let k = geo.kernel;
    let kernel_volume = k * k * k;
    let in_cols = input.shape().1;
    let grad_cols = grad_output.shape().1;
    let mut grad_input = Tensor::zeros(geo.batch, in_cols)?;
    let mut grad_weight = Tensor::zeros(weight.shape().0, weight.shape().1)?;
    let input_data = input.data();
    let weight_data = weight.data();
    let grad_data = grad_output.data();
    {
        let grad_input_data = grad_input.data_mut();
        let grad_weight_data = grad_weight.data_mut();
        for b in 0..geo.batch {
            let row = &input_data[b * in_cols..(b + 1) * in_cols];
            let grad_row = &grad_data[b * grad_cols..(b + 1) * grad_cols];
            for g in 0..options.groups {
                for oc_local in 0..geo.per_group_out {
                    let oc = g * geo.per_group_out + oc_local;
                    let weight_base = oc * geo.per_group_in * kernel_volume;
                    for zd in 0..od {
                        for zh in 0..oh {
                            for zw in 0..ow {
                                let go = grad_row[((oc * od + zd) * oh + zh) * ow + zw];
                                if go == 0.0 {
                                    continue;
                                }
                                for ic_local in 0..geo.per_group_in {
                                    let ic = g * geo.per_group_in + ic_local;
                                    for kd in 0..k {
                                        let pd = zd * options.stride.0 + kd * options.dilation.0;
                                        if pd < options.padding.0 {
                                            continue;
                                        }
                                        let id = pd - options.padding.0;
                                        if id >= d {
                                            continue;
                                        }
                                        for kh in 0..k {
                                            let ph =
                                                zh * options.stride.1 + kh * options.dilation.1;
                                            if ph < options.padding.1 {
                                                continue;
                                            }
                                            let ih = ph - options.padding.1;
                                            if ih >= h {
                                                continue;
                                            }
                                            for kw in 0..k {
                                                let pw = zw * options.stride.2
                                                    + kw * options.dilation.2;
                                                if pw < options.padding.2 {
                                                    continue;
                                                }
                                                let iw = pw - options.padding.2;
                                                if iw >= w {
                                                    continue;
                                                }
                                                let input_idx =
                                                    ((ic * d + id) * h + ih) * w + iw;
                                                let weight_idx = weight_base
                                                    + ic_local * kernel_volume
                                                    + (kd * k + kh) * k
                                                    + kw;
                                                grad_weight_data[weight_idx] +=
                                                    go * row[input_idx];
                                                grad_input_data
                                                    [b * in_cols + input_idx] +=
                                                    go * weight_data[weight_idx];
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    Ok((grad_input, grad_weight))
}

struct TransposeGeometry {
    batch: usize,
    out_channels: usize,
    per_group_in: usize,
    per_group_out: usize,
    in_dhw: (usize, usize, usize),
    out_dhw: (usize, usize, usize),
    kernel: usize,
}

fn transpose_geometry(
    input: &Tensor,
    weight: &Tensor,
    input_dhw: (usize, usize, usize),
    kernel: usize,
    options: &Conv3dOptions,
) -> SE3Result<TransposeGeometry> {
    options.validate()?;
    if kernel == 0 {
        return Err(SE3Error::config(
            "conv_transpose3d",
            "kernel size must be positive",
        ));
    }
    let (d, h, w) = input_dhw;
    let volume = d * h * w;
    let (batch, cols) = input.shape();
    if volume == 0 || cols % volume != 0 {
        return Err(SE3Error::config(
            "conv_transpose3d",
            format!("input columns {cols} do not decompose over a {d}x{h}x{w} grid"),
        ));
    }
    let in_channels = cols / volume;
    if weight.shape().0 != in_channels {
        return Err(SE3Error::config(
            "conv_transpose3d",
            format!(
                "weight rows {} do not match {in_channels} input channels",
                weight.shape().0
            ),
        ));
    }
    if in_channels % options.groups != 0 {
        return Err(SE3Error::config(
            "conv_transpose3d",
            format!(
                "input channels {in_channels} are not divisible by {} groups",
                options.groups
            ),
        ));
    }
    let kernel_volume = kernel * kernel * kernel;
    if weight.shape().1 % kernel_volume != 0 {
        return Err(SE3Error::config(
            "conv_transpose3d",
            format!(
                "weight columns {} do not decompose over {kernel_volume} kernel taps",
                weight.shape().1
            ),
        ));
    }
    let per_group_out = weight.shape().1 / kernel_volume;
    let out_dhw = (
        transpose_extent(d, options.padding.0, options.dilation.0, kernel, options.stride.0)?,
        transpose_extent(h, options.padding.1, options.dilation.1, kernel, options.stride.1)?,
        transpose_extent(w, options.padding.2, options.dilation.2, kernel, options.stride.2)?,
    );
    Ok(TransposeGeometry {
        batch,
        out_channels: per_group_out * options.groups,
        per_group_in: in_channels / options.groups,
        per_group_out,
        in_dhw: input_dhw,
        out_dhw,
        kernel,
    })
}

/// Dense transpose 3D convolution. `input` is
/// `(batch, in_channels · D·H·W)`, `weight` is
/// `(in_channels, out_channels_per_group · k³)`.
pub fn conv_transpose3d(
    input: &Tensor,
    weight: &Tensor,
    input_dhw: (usize, usize, usize),
    kernel: usize,
    options: &Conv3dOptions,
) -> SE3Result<Tensor> {
    let geo = transpose_geometry(input, weight, input_dhw, kernel, options)?;
    let (d, h, w) = geo.in_dhw;
    let (od, oh, ow) = geo.out_dhw;
    let k = geo.kernel;
    let kernel_volume = k * k * k;
    let in_cols = input.shape().1;
    let mut out = Tensor::zeros(geo.batch, geo.out_channels * od * oh * ow)?;
    let out_cols = out.shape().1;
    let input_data = input.data();
    let weight_data = weight.data();
    let out_data = out.data_mut();
    for b in 0..geo.batch {
        let row = &input_data[b * in_cols..(b + 1) * in_cols];
        let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
        for g in 0..options.groups {
            for ic_local in 0..geo.per_group_in {
                let ic = g * geo.per_group_in + ic_local;
                let weight_row = &weight_data
                    [ic * geo.per_group_out * kernel_volume
                        ..(ic + 1) * geo.per_group_out * kernel_volume];
                for id in 0..d {
                    for ih in 0..h {
                        for iw in 0..w {
                            let value = row[((ic * d + id) * h + ih) * w + iw];
                            if value == 0.0 {
                                continue;
                            }
                            for oc_local in 0..geo.per_group_out {
                                let oc = g * geo.per_group_out + oc_local;
                                for kd in 0..k {
                                    let pd = id * options.stride.0 + kd * options.dilation.0;
                                    if pd < options.padding.0 {
                                        continue;
                                    }
                                    let zd = pd - options.padding.0;
                                    if zd >= od {
                                        continue;
                                    }
                                    for kh in 0..k {
                                        let ph = ih * options.stride.1 + kh * options.dilation.1;
                                        if ph < options.padding.1 {
                                            continue;
                                        }
                                        let zh = ph - options.padding.1;
                                        if zh >= oh {
                                            continue;
                                        }
                                        for kw in 0..k {
                                            let pw =
                                                iw * options.stride.2 + kw * options.dilation.2;
                                            if pw < options.padding.2 {
                                                continue;
                                            }
                                            let zw = pw - options.padding.2;
                                            if zw >= ow {
                                                continue;
                                            }
                                            let weight_idx = oc_local * kernel_volume
                                                + (kd * k + kh) * k
                                                + kw;
                                            out_row[((oc * od + zd) * oh + zh) * ow + zw] +=
                                                value * weight_row[weight_idx];
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Gradients of [`conv_transpose3d`] with respect to its input and weight.
pub fn conv_transpose3d_backward(
    input: &Tensor,
    weight: &Tensor,
    grad_output: &Tensor,
    input_dhw: (usize, usize, usize),
    kernel: usize,
    options: &Conv3dOptions,
) -> SE3Result<(Tensor, Tensor)> {
    let geo = transpose_geometry(input, weight, input_dhw, kernel, options)?;
    let (d, h, w) = geo.in_dhw;
    let (od, oh, ow) = geo.out_dhw;
    if grad_output.shape() != (geo.batch, geo.out_channels * od * oh * ow) {
        return Err(SE3Error::config(
            "conv_transpose3d",
            format!(
                "gradient shape {:?} does not match ({}, {})",
                grad_output.shape(),
                geo.batch,
                geo.out_channels * od * oh * ow
            ),
        ));
    }
    let k = geo.kernel;
    let kernel_volume = k * k * k;
    let in_cols = input.shape().1;
    let grad_cols = grad_output.shape().1;
    let mut grad_input = Tensor::zeros(geo.batch, in_cols)?;
    let mut grad_weight = Tensor::zeros(weight.shape().0, weight.shape().1)?;
    let input_data = input.data();
    let weight_data = weight.data();
    let grad_data = grad_output.data();
    {
        let grad_input_data = grad_input.data_mut();
        let grad_weight_data = grad_weight.data_mut();
        for b in 0..geo.batch {
            let row = &input_data[b * in_cols..(b + 1) * in_cols];
            let grad_row = &grad_data[b * grad_cols..(b + 1) * grad_cols];
            for g in 0..options.groups {
                for ic_local in 0..geo.per_group_in {
                    let ic = g * geo.per_group_in + ic_local;
                    let weight_base = ic * geo.per_group_out * kernel_volume;
                    for id in 0..d {
                        for ih in 0..h {
                            for iw in 0..w {
                                let input_idx = ((ic * d + id) * h + ih) * w + iw;
                                let value = row[input_idx];
                                let mut acc = 0.0;
                                for oc_local in 0..geo.per_group_out {
                                    let oc = g * geo.per_group_out + oc_local;
                                    for kd in 0..k {
                                        let pd = id * options.stride.0 + kd * options.dilation.0;
                                        if pd < options.padding.0 {
                                            continue;
                                        }
                                        let zd = pd - options.padding.0;
                                        if zd >= od {
                                            continue;
                                        }
                                        for kh in 0..k {
                                            let ph =
                                                ih * options.stride.1 + kh * options.dilation.1;
                                            if ph < options.padding.1 {
                                                continue;
                                            }
                                            let zh = ph - options.padding.1;
                                            if zh >= oh {
                                                continue;
                                            }
                                            for kw in 0..k {
                                                let pw = iw * options.stride.2
                                                    + kw * options.dilation.2;
                                                if pw < options.padding.2 {
                                                    continue;
                                                }
                                                let zw = pw - options.padding.2;
                                                if zw >= ow {
                                                    continue;
                                                }
                                                let go = grad_row
                                                    [((oc * od + zd) * oh + zh) * ow + zw];
                                                let weight_idx = weight_base
                                                    + oc_local * kernel_volume
                                                    + (kd * k + kh) * k
                                                    + kw;
                                                acc += go * weight_data[weight_idx];
                                                grad_weight_data[weight_idx] += go * value;
                                            }
                                        }
                                    }
                                }
                                grad_input_data[b * in_cols + input_idx] += acc;
                            }
                        }
                    }
                }
            }
        }
    }
    Ok((grad_input, grad_weight))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointwise_identity_kernel_passes_input_through() {
        let input = Tensor::random_normal(2, 2 * 27, 0.0, 1.0, Some(3)).unwrap();
        let weight = Tensor::from_vec(2, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let out = conv3d(&input, &weight, (3, 3, 3), 1, &Conv3dOptions::default()).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn conv3d_matches_manual_sum() {
        // Single channel, 2x2x2 kernel over a 2x2x2 grid: one output cell
        // equal to the full dot product.
        let input = Tensor::from_fn(1, 8, |_r, c| c as f64 + 1.0).unwrap();
        let weight = Tensor::from_fn(1, 8, |_r, c| if c % 2 == 0 { 1.0 } else { -1.0 }).unwrap();
        let out = conv3d(&input, &weight, (2, 2, 2), 2, &Conv3dOptions::default()).unwrap();
        assert_eq!(out.shape(), (1, 1));
        let expected: f64 = (0..8)
            .map(|c| (c as f64 + 1.0) * if c % 2 == 0 { 1.0 } else { -1.0 })
            .sum();
        assert!((out.data()[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn transpose_restores_spatial_extent() {
        let input = Tensor::random_normal(1, 3 * 64, 0.0, 1.0, Some(5)).unwrap();
        let weight = Tensor::random_normal(2, 3 * 27, 0.0, 0.2, Some(6)).unwrap();
        let options = Conv3dOptions::default();
        let reduced = conv3d(&input, &weight, (4, 4, 4), 3, &options).unwrap();
        assert_eq!(reduced.shape(), (1, 2 * 8));
        let weight_t = Tensor::random_normal(2, 3 * 27, 0.0, 0.2, Some(7)).unwrap();
        let restored = conv_transpose3d(&reduced, &weight_t, (2, 2, 2), 3, &options).unwrap();
        assert_eq!(restored.shape(), (1, 3 * 64));
    }

    #[test]
    fn grouped_convolution_keeps_groups_independent() {
        // Two groups of one channel each; zeroing the second group's input
        // must not disturb the first group's output.
        let options = Conv3dOptions::default().with_groups(2);
        let weight = Tensor::random_normal(2, 8, 0.0, 1.0, Some(8)).unwrap();
        let input = Tensor::random_normal(1, 2 * 27, 0.0, 1.0, Some(9)).unwrap();
        let full = conv3d(&input, &weight, (3, 3, 3), 2, &options).unwrap();
        let mut half = input.clone();
        for value in half.data_mut()[27..].iter_mut() {
            *value = 0.0;
        }
        let masked = conv3d(&half, &weight, (3, 3, 3), 2, &options).unwrap();
        let out_half = full.shape().1 / 2;
        for idx in 0..out_half {
            assert_eq!(full.data()[idx], masked.data()[idx]);
        }
    }

    #[test]
    fn conv3d_backward_matches_finite_differences() {
        let options = Conv3dOptions::default();
        let input = Tensor::random_normal(1, 2 * 27, 0.0, 1.0, Some(11)).unwrap();
        let weight = Tensor::random_normal(2, 2 * 8, 0.0, 0.5, Some(12)).unwrap();
        // Probe matches the 2-channel 2x2x2 output of the convolution.
        let probe = Tensor::random_normal(1, 2 * 8, 0.0, 1.0, Some(13)).unwrap();
        let loss = |weight: &Tensor, input: &Tensor| -> f64 {
            let out = conv3d(input, weight, (3, 3, 3), 2, &options).unwrap();
            out.hadamard(&probe).unwrap().data().iter().sum()
        };
        let (grad_input, grad_weight) =
            conv3d_backward(&input, &weight, &probe, (3, 3, 3), 2, &options).unwrap();
        let eps = 1e-6;
        for &idx in &[0usize, 5, 11] {
            let mut shifted = weight.clone();
            shifted.data_mut()[idx] += eps;
            let numeric = (loss(&shifted, &input) - loss(&weight, &input)) / eps;
            assert!(
                (numeric - grad_weight.data()[idx]).abs() < 1e-5,
                "weight {idx}: {numeric} vs {}",
                grad_weight.data()[idx]
            );
            let mut shifted = input.clone();
            shifted.data_mut()[idx] += eps;
            let numeric = (loss(&weight, &shifted) - loss(&weight, &input)) / eps;
            assert!(
                (numeric - grad_input.data()[idx]).abs() < 1e-5,
                "input {idx}: {numeric} vs {}",
                grad_input.data()[idx]
            );
        }
    }

    #[test]
    fn invalid_options_are_rejected() {
        let input = Tensor::zeros(1, 27).unwrap();
        let weight = Tensor::zeros(1, 1).unwrap();
        let options = Conv3dOptions {
            stride: (0, 1, 1),
            ..Conv3dOptions::default()
        };
        assert!(conv3d(&input, &weight, (3, 3, 3), 1, &options).is_err());
    }
}
