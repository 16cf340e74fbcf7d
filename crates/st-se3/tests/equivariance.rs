// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! End-to-end equivariance checks: rotating the geometry and the input
//! features must reproduce the rotated output to double-precision accuracy.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use st_se3::layers::point_convolution::contract_pairwise;
use st_se3::point_kernel::DEFAULT_J_FILTER_MAX;
use st_se3::{
    Conv3dOptions, DifferenceMat, GaussianRadialBasis, Module, RadialBasis, RelativeMask, Rs,
    SE3Convolution, SE3GroupPointKernel, SE3PointConvolution, SE3PointKernel, Tensor,
};

fn basis() -> Box<dyn RadialBasis> {
    Box::new(GaussianRadialBasis::new(3.5, 4).unwrap())
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f64 {
    a.sub(b).unwrap().max_abs()
}

#[test]
fn point_convolution_is_rotation_equivariant() {
    // Rs_in = [(3,0),(0,1)], Rs_out = [(5,1),(3,2)], three random edges
    // among four source and two target points.
    let rs_in = Rs::new(&[(3, 0), (0, 1)]).unwrap();
    let rs_out = Rs::new(&[(5, 1), (3, 2)]).unwrap();
    let (n_source, n_target, n_edge) = (4usize, 2usize, 3usize);

    let layer = SE3PointConvolution::new(
        "equiv",
        &rs_in,
        &rs_out,
        basis(),
        DEFAULT_J_FILTER_MAX,
        false,
    )
    .unwrap();

    let sources = Tensor::random_normal(n_source, 3, 0.0, 1.0, Some(101)).unwrap();
    let targets = Tensor::random_normal(n_target, 3, 0.0, 1.0, Some(102)).unwrap();
    let features = Tensor::random_normal(rs_in.dim(), n_source, 0.0, 1.0, Some(103)).unwrap();

    // Random edges become an adjacency-count mask over the full pair grid.
    let mut rng = StdRng::seed_from_u64(104);
    let mut adjacency = Tensor::zeros(n_target, n_source).unwrap();
    for _ in 0..n_edge {
        let s = rng.gen_range(0..n_source);
        let t = rng.gen_range(0..n_target);
        adjacency.data_mut()[t * n_source + s] += 1.0;
    }
    let mask = RelativeMask::single(n_target, n_source, adjacency).unwrap();

    let diff = DifferenceMat::from_points(&targets, &sources).unwrap();
    let out = layer.forward(&features, &diff, Some(&mask)).unwrap();

    let (alpha, beta, gamma) = st_se3::so3::rand_angles(Some(105));
    let rotation = st_se3::so3::rot(alpha, beta, gamma).unwrap();
    let d_in = rs_in.rep(alpha, beta, gamma).unwrap();
    let d_out = rs_out.rep(alpha, beta, gamma).unwrap();

    let rotated_features = d_in.matmul(&features).unwrap();
    let rotated_diff = diff.rotated(&rotation).unwrap();
    let rotated_out = layer
        .forward(&rotated_features, &rotated_diff, Some(&mask))
        .unwrap();

    let expected = d_out.matmul(&out).unwrap();
    assert!(
        max_abs_diff(&rotated_out, &expected) < 1e-10,
        "equivariance violated: {}",
        max_abs_diff(&rotated_out, &expected)
    );
}

#[test]
fn grouped_point_kernel_is_rotation_equivariant() {
    let rs_in = Rs::new(&[(2, 0), (2, 1)]).unwrap();
    let rs_out = Rs::new(&[(2, 1), (2, 2)]).unwrap();
    let kernel = SE3GroupPointKernel::new(
        "equiv_groups",
        &rs_in,
        &rs_out,
        &basis,
        DEFAULT_J_FILTER_MAX,
        2,
    )
    .unwrap();

    let sources = Tensor::random_normal(4, 3, 0.0, 1.0, Some(111)).unwrap();
    let targets = Tensor::random_normal(2, 3, 0.0, 1.0, Some(112)).unwrap();
    let features = Tensor::random_normal(rs_in.dim(), 4, 0.0, 1.0, Some(113)).unwrap();
    let diff = DifferenceMat::from_points(&targets, &sources).unwrap();

    let dense = kernel.forward(&diff).unwrap();
    let out = contract_pairwise(&dense, &features, diff.shape()).unwrap();

    let (alpha, beta, gamma) = st_se3::so3::rand_angles(Some(114));
    let rotation = st_se3::so3::rot(alpha, beta, gamma).unwrap();
    let d_in = rs_in.rep(alpha, beta, gamma).unwrap();
    let d_out = rs_out.rep(alpha, beta, gamma).unwrap();

    let rotated_dense = kernel.forward(&diff.rotated(&rotation).unwrap()).unwrap();
    let rotated_out = contract_pairwise(
        &rotated_dense,
        &d_in.matmul(&features).unwrap(),
        diff.shape(),
    )
    .unwrap();

    let expected = d_out.matmul(&out).unwrap();
    assert!(
        max_abs_diff(&rotated_out, &expected) < 1e-10,
        "grouped equivariance violated: {}",
        max_abs_diff(&rotated_out, &expected)
    );
}

#[test]
fn kernel_axes_follow_the_representations() {
    for (rs_in, rs_out) in [
        (Rs::new(&[(1, 0)]).unwrap(), Rs::new(&[(1, 0)]).unwrap()),
        (
            Rs::new(&[(3, 0), (0, 1)]).unwrap(),
            Rs::new(&[(5, 1), (3, 2)]).unwrap(),
        ),
        (
            Rs::new(&[(2, 1), (1, 2)]).unwrap(),
            Rs::new(&[(4, 0)]).unwrap(),
        ),
    ] {
        let kernel = SE3PointKernel::new(
            "dims",
            &rs_in,
            &rs_out,
            basis(),
            DEFAULT_J_FILTER_MAX,
            false,
        )
        .unwrap();
        let diff = DifferenceMat::from_points(
            &Tensor::random_normal(3, 3, 0.0, 1.0, Some(121)).unwrap(),
            &Tensor::random_normal(2, 3, 0.0, 1.0, Some(122)).unwrap(),
        )
        .unwrap();
        let dense = kernel.forward(&diff).unwrap();
        assert_eq!(dense.shape().0, rs_out.dim());
        assert_eq!(dense.shape().1, rs_in.dim() * 6);
    }
}

/// Applies the z-quarter-turn to a `(1, dim · size³)` voxel field: channels
/// mix through the representation matrix while voxels permute through the
/// inverse spatial rotation.
fn rotate_field_z90(field: &Tensor, rep: &Tensor, size: usize) -> Tensor {
    let dim = rep.shape().0;
    let volume = size * size * size;
    let mut out = Tensor::zeros(1, dim * volume).unwrap();
    let field_data = field.data();
    let rep_data = rep.data();
    let out_data = out.data_mut();
    for x in 0..size {
        for y in 0..size {
            for z in 0..size {
                let p = (x * size + y) * size + z;
                // Inverse of the centered quarter turn (cx, cy) -> (-cy, cx).
                let (qx, qy) = (y, size - 1 - x);
                let q = (qx * size + qy) * size + z;
                for row in 0..dim {
                    let mut acc = 0.0;
                    for col in 0..dim {
                        acc += rep_data[row * dim + col] * field_data[col * volume + q];
                    }
                    out_data[row * volume + p] += acc;
                }
            }
        }
    }
    out
}

#[test]
fn voxel_convolution_is_equivariant_under_grid_rotations() {
    use std::f64::consts::FRAC_PI_2;

    let rs_in = Rs::new(&[(1, 0), (1, 1)]).unwrap();
    let rs_out = Rs::new(&[(1, 0), (1, 1), (1, 2)]).unwrap();
    let size = 5usize;
    let layer = SE3Convolution::new(
        "equiv_voxel",
        &rs_in,
        &rs_out,
        size,
        Box::new(GaussianRadialBasis::new(size as f64 / 2.0, 3).unwrap()),
        true,
        (size, size, size),
        Conv3dOptions::default().with_padding(size / 2),
    )
    .unwrap();

    let volume = size * size * size;
    let input = Tensor::random_normal(1, rs_in.dim() * volume, 0.0, 1.0, Some(131)).unwrap();
    let out = layer.forward(&input).unwrap();

    // A quarter turn about z maps the centered grid onto itself, so the
    // equivariance law holds without any interpolation error.
    let d_in = rs_in.rep(FRAC_PI_2, 0.0, 0.0).unwrap();
    let d_out = rs_out.rep(FRAC_PI_2, 0.0, 0.0).unwrap();
    let rotated_input = rotate_field_z90(&input, &d_in, size);
    let rotated_out = layer.forward(&rotated_input).unwrap();
    let expected = rotate_field_z90(&out, &d_out, size);
    assert!(
        max_abs_diff(&rotated_out, &expected) < 1e-10,
        "voxel equivariance violated: {}",
        max_abs_diff(&rotated_out, &expected)
    );
}

#[test]
fn state_dict_round_trips_through_a_fresh_layer() {
    let rs = Rs::new(&[(1, 0), (1, 1)]).unwrap();
    let make = || {
        SE3Convolution::new(
            "roundtrip",
            &rs,
            &rs,
            3,
            Box::new(GaussianRadialBasis::new(1.5, 3).unwrap()),
            false,
            (3, 3, 3),
            Conv3dOptions::default().with_padding(1),
        )
        .unwrap()
    };
    let mut layer = make();
    let input = Tensor::random_normal(1, rs.dim() * 27, 0.0, 1.0, Some(141)).unwrap();
    let grad = Tensor::random_normal(1, rs.dim() * 27, 0.0, 1.0, Some(142)).unwrap();
    let _ = layer.backward(&input, &grad).unwrap();
    layer.apply_step(0.1).unwrap();

    let state = layer.state_dict().unwrap();
    let mut restored = make();
    restored.load_state_dict(&state).unwrap();
    assert_eq!(
        layer.forward(&input).unwrap(),
        restored.forward(&input).unwrap()
    );
}
