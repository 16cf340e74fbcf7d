//! SE(3)-equivariant convolution layers for point clouds and voxel grids.
//!
//! The crate builds steerable convolution kernels by expanding learned radial
//! profiles against spherical-harmonic angular bases and Clebsch-Gordan
//! tensor-product coefficients, then contracting the result into dense kernel
//! tensors consumed by ordinary convolution and contraction primitives from
//! `st-tensor`.

pub mod error;
pub mod kernel;
pub mod layers;
pub mod module;
pub mod point_kernel;
pub mod point_utils;
pub mod radial;
pub mod rs;
pub mod so3;

pub use error::{SE3Error, SE3Result};
pub use kernel::SE3Kernel;
pub use layers::convolution::{SE3Convolution, SE3ConvolutionTranspose};
pub use layers::functional::{conv3d, conv_transpose3d, Conv3dOptions};
pub use layers::point_convolution::{SE3PointConvolution, SE3PointNeighborConvolution};
pub use module::{Module, Parameter};
pub use point_kernel::{
    DifferenceMat, PairShape, RelativeMask, SE3GroupPointKernel, SE3PointKernel,
};
pub use point_utils::NeighborList;
pub use radial::{ConstantRadialBasis, GaussianRadialBasis, RadialBasis};
pub use rs::{Parity, Rs, RsBlock};

pub use st_tensor::{PureResult, Tensor, TensorError};
