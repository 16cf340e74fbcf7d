// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Gather utilities for fixed-size neighbor lists.

use crate::error::{SE3Error, SE3Result};
use crate::point_kernel::DifferenceMat;
use st_tensor::Tensor;

/// Fixed-size neighbor indices: every point owns exactly `k` neighbors.
#[derive(Clone, Debug)]
pub struct NeighborList {
    indices: Vec<usize>,
    points: usize,
    k: usize,
}

impl NeighborList {
    /// Builds a neighbor list from a flat row-major `points × k` index
    /// buffer.
    pub fn new(points: usize, k: usize, indices: Vec<usize>) -> SE3Result<Self> {
        if points == 0 || k == 0 {
            return Err(SE3Error::config(
                "neighbor_list",
                "points and neighbor count must be positive",
            ));
        }
        if indices.len() != points * k {
            return Err(SE3Error::config(
                "neighbor_list",
                format!(
                    "expected {} indices, got {}",
                    points * k,
                    indices.len()
                ),
            ));
        }
        Ok(Self { indices, points, k })
    }

    /// Number of points.
    pub fn points(&self) -> usize {
        self.points
    }

    /// Neighbors per point.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Index of neighbor `j` of point `p`.
    pub fn get(&self, p: usize, j: usize) -> usize {
        self.indices[p * self.k + j]
    }

    fn ensure_in_bounds(&self, limit: usize, context: &'static str) -> SE3Result<()> {
        if let Some(&bad) = self.indices.iter().find(|&&idx| idx >= limit) {
            return Err(SE3Error::config(
                context,
                format!("neighbor index {bad} out of bounds for {limit} points"),
            ));
        }
        Ok(())
    }
}

/// Per-point displacement matrix `coords[p] - coords[neighbors[p][j]]`,
/// shaped as `points × k` pair geometry.
pub fn neighbor_difference_matrix(
    neighbors: &NeighborList,
    coords: &Tensor,
) -> SE3Result<DifferenceMat> {
    if coords.shape() != (neighbors.points(), 3) {
        return Err(SE3Error::config(
            "neighbor_difference_matrix",
            format!(
                "expected coords of shape ({}, 3), got {:?}",
                neighbors.points(),
                coords.shape()
            ),
        ));
    }
    neighbors.ensure_in_bounds(neighbors.points(), "neighbor_difference_matrix")?;
    let k = neighbors.k();
    let data = coords.data();
    let diff = Tensor::from_fn(neighbors.points() * k, 3, |row, axis| {
        let (p, j) = (row / k, row % k);
        let n = neighbors.get(p, j);
        data[p * 3 + axis] - data[n * 3 + axis]
    })?;
    DifferenceMat::single(neighbors.points(), k, diff)
}

/// Gathers the neighbor features of every point from a `(channels, points)`
/// feature tensor into a `(channels, points · k)` tensor whose trailing axis
/// is point-major.
pub fn neighbor_feature_matrix(
    neighbors: &NeighborList,
    features: &Tensor,
) -> SE3Result<Tensor> {
    let (channels, points) = features.shape();
    if points != neighbors.points() {
        return Err(SE3Error::config(
            "neighbor_feature_matrix",
            format!(
                "features cover {points} points but the neighbor list has {}",
                neighbors.points()
            ),
        ));
    }
    neighbors.ensure_in_bounds(points, "neighbor_feature_matrix")?;
    let k = neighbors.k();
    let data = features.data();
    let gathered = Tensor::from_fn(channels, points * k, |c, col| {
        let (p, j) = (col / k, col % k);
        data[c * points + neighbors.get(p, j)]
    })?;
    Ok(gathered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbor_list_validates_lengths() {
        assert!(NeighborList::new(2, 2, vec![0, 1, 1]).is_err());
        assert!(NeighborList::new(0, 2, vec![]).is_err());
        assert!(NeighborList::new(2, 2, vec![0, 1, 1, 0]).is_ok());
    }

    #[test]
    fn difference_matrix_gathers_displacements() {
        let neighbors = NeighborList::new(2, 1, vec![1, 0]).unwrap();
        let coords = Tensor::from_vec(2, 3, vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0]).unwrap();
        let diff = neighbor_difference_matrix(&neighbors, &coords).unwrap();
        assert_eq!(diff.row(0), [-1.0, -2.0, -3.0]);
        assert_eq!(diff.row(1), [1.0, 2.0, 3.0]);
    }

    #[test]
    fn out_of_bounds_indices_are_rejected() {
        let neighbors = NeighborList::new(2, 1, vec![1, 5]).unwrap();
        let coords = Tensor::zeros(2, 3).unwrap();
        assert!(neighbor_difference_matrix(&neighbors, &coords).is_err());
    }

    #[test]
    fn feature_matrix_gathers_channels() {
        let neighbors = NeighborList::new(2, 2, vec![1, 0, 0, 1]).unwrap();
        let features = Tensor::from_vec(1, 2, vec![10.0, 20.0]).unwrap();
        let gathered = neighbor_feature_matrix(&neighbors, &features).unwrap();
        assert_eq!(gathered.data(), &[20.0, 10.0, 10.0, 20.0]);
    }
}
