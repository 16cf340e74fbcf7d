// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Voxel-grid equivariant convolution layers.
//!
//! Each layer owns one steerable kernel constructor; every forward pass
//! re-expands the dense kernel from the current radial weights and then
//! delegates to the plain dense (transpose) convolution primitive with the
//! caller-supplied options forwarded verbatim.

use crate::error::{SE3Error, SE3Result};
use crate::kernel::SE3Kernel;
use crate::layers::functional::{
    conv3d, conv3d_backward, conv_transpose3d, conv_transpose3d_backward, Conv3dOptions,
};
use crate::module::{Module, Parameter};
use crate::radial::RadialBasis;
use crate::rs::Rs;
use st_tensor::Tensor;

fn validate_grid(input_dhw: (usize, usize, usize), context: &'static str) -> SE3Result<()> {
    if input_dhw.0 == 0 || input_dhw.1 == 0 || input_dhw.2 == 0 {
        return Err(SE3Error::config(context, "input grid extents must be positive"));
    }
    Ok(())
}

/// SE(3)-equivariant dense 3D convolution.
#[derive(Debug)]
pub struct SE3Convolution {
    kernel: SE3Kernel,
    input_dhw: (usize, usize, usize),
    options: Conv3dOptions,
}

impl SE3Convolution {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        rs_in: &Rs,
        rs_out: &Rs,
        size: usize,
        basis: Box<dyn RadialBasis>,
        dyn_iso: bool,
        input_dhw: (usize, usize, usize),
        options: Conv3dOptions,
    ) -> SE3Result<Self> {
        validate_grid(input_dhw, "se3_convolution")?;
        Ok(Self {
            kernel: SE3Kernel::new(name, rs_in, rs_out, size, basis, dyn_iso)?,
            input_dhw,
            options,
        })
    }

    /// The owned kernel constructor.
    pub fn kernel(&self) -> &SE3Kernel {
        &self.kernel
    }

    /// Convolution options forwarded to the primitive.
    pub fn options(&self) -> &Conv3dOptions {
        &self.options
    }
}

impl Module for SE3Convolution {
    fn forward(&self, input: &Tensor) -> SE3Result<Tensor> {
        let dense = self.kernel.forward()?;
        conv3d(
            input,
            &dense,
            self.input_dhw,
            self.kernel.size(),
            &self.options,
        )
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> SE3Result<Tensor> {
        let dense = self.kernel.forward()?;
        let (grad_input, grad_kernel) = conv3d_backward(
            input,
            &dense,
            grad_output,
            self.input_dhw,
            self.kernel.size(),
            &self.options,
        )?;
        self.kernel.backward(&grad_kernel)?;
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> SE3Result<()>,
    ) -> SE3Result<()> {
        visitor(self.kernel.radial_weights())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> SE3Result<()>,
    ) -> SE3Result<()> {
        visitor(self.kernel.radial_weights_mut())
    }
}

/// SE(3)-equivariant transpose 3D convolution.
///
/// The kernel is constructed with the representation roles swapped (the
/// layer's output representation becomes the kernel's input side) so the
/// dense tensor lands in the `(in_channels, out_channels · k³)` layout the
/// transpose primitive expects, matching the adjoint relationship between
/// convolution and its transpose.
#[derive(Debug)]
pub struct SE3ConvolutionTranspose {
    kernel: SE3Kernel,
    input_dhw: (usize, usize, usize),
    options: Conv3dOptions,
}

impl SE3ConvolutionTranspose {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        rs_in: &Rs,
        rs_out: &Rs,
        size: usize,
        basis: Box<dyn RadialBasis>,
        dyn_iso: bool,
        input_dhw: (usize, usize, usize),
        options: Conv3dOptions,
    ) -> SE3Result<Self> {
        validate_grid(input_dhw, "se3_convolution_transpose")?;
        Ok(Self {
            kernel: SE3Kernel::new(name, rs_out, rs_in, size, basis, dyn_iso)?,
            input_dhw,
            options,
        })
    }

    /// The owned kernel constructor.
    pub fn kernel(&self) -> &SE3Kernel {
        &self.kernel
    }
}

impl Module for SE3ConvolutionTranspose {
    fn forward(&self, input: &Tensor) -> SE3Result<Tensor> {
        let dense = self.kernel.forward()?;
        conv_transpose3d(
            input,
            &dense,
            self.input_dhw,
            self.kernel.size(),
            &self.options,
        )
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> SE3Result<Tensor> {
        let dense = self.kernel.forward()?;
        let (grad_input, grad_kernel) = conv_transpose3d_backward(
            input,
            &dense,
            grad_output,
            self.input_dhw,
            self.kernel.size(),
            &self.options,
        )?;
        self.kernel.backward(&grad_kernel)?;
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> SE3Result<()>,
    ) -> SE3Result<()> {
        visitor(self.kernel.radial_weights())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> SE3Result<()>,
    ) -> SE3Result<()> {
        visitor(self.kernel.radial_weights_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radial::GaussianRadialBasis;

    fn basis(size: usize) -> Box<dyn RadialBasis> {
        Box::new(GaussianRadialBasis::new(size as f64 / 2.0, 3).unwrap())
    }

    #[test]
    fn forward_produces_expected_channel_layout() {
        let rs_in = Rs::new(&[(1, 0), (1, 1)]).unwrap();
        let rs_out = Rs::new(&[(2, 0), (1, 1)]).unwrap();
        let layer = SE3Convolution::new(
            "conv",
            &rs_in,
            &rs_out,
            3,
            basis(3),
            false,
            (5, 5, 5),
            Conv3dOptions::default().with_padding(1),
        )
        .unwrap();
        let input = Tensor::random_normal(2, rs_in.dim() * 125, 0.0, 1.0, Some(4)).unwrap();
        let output = layer.forward(&input).unwrap();
        assert_eq!(output.shape(), (2, rs_out.dim() * 125));
    }

    #[test]
    fn transpose_swaps_representation_roles() {
        let rs_in = Rs::new(&[(1, 0), (1, 1)]).unwrap();
        let rs_out = Rs::new(&[(2, 0)]).unwrap();
        let layer = SE3ConvolutionTranspose::new(
            "deconv",
            &rs_in,
            &rs_out,
            3,
            basis(3),
            false,
            (4, 4, 4),
            Conv3dOptions::default(),
        )
        .unwrap();
        // Kernel rows are the layer's input channels in the transpose layout.
        assert_eq!(layer.kernel().dim_out(), rs_in.dim());
        assert_eq!(layer.kernel().dim_in(), rs_out.dim());
        let input = Tensor::random_normal(1, rs_in.dim() * 64, 0.0, 1.0, Some(5)).unwrap();
        let output = layer.forward(&input).unwrap();
        assert_eq!(output.shape(), (1, rs_out.dim() * 216));
    }

    #[test]
    fn backward_reaches_the_radial_weights() {
        let rs = Rs::new(&[(1, 0), (1, 1)]).unwrap();
        let mut layer = SE3Convolution::new(
            "conv",
            &rs,
            &rs,
            3,
            basis(3),
            true,
            (3, 3, 3),
            Conv3dOptions::default().with_padding(1),
        )
        .unwrap();
        let input = Tensor::random_normal(1, rs.dim() * 27, 0.0, 1.0, Some(6)).unwrap();
        let output = layer.forward(&input).unwrap();
        let grad = Tensor::random_normal(1, output.shape().1, 0.0, 1.0, Some(7)).unwrap();
        let grad_input = layer.backward(&input, &grad).unwrap();
        assert_eq!(grad_input.shape(), input.shape());
        let gradient = layer.kernel().radial_weights().gradient().unwrap();
        assert!(gradient.squared_l2_norm() > 0.0);
    }

    #[test]
    fn zero_sized_grids_are_rejected() {
        let rs = Rs::new(&[(1, 0)]).unwrap();
        assert!(SE3Convolution::new(
            "conv",
            &rs,
            &rs,
            3,
            basis(3),
            false,
            (0, 4, 4),
            Conv3dOptions::default(),
        )
        .is_err());
    }
}
